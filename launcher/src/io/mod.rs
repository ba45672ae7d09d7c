//! Side-effecting launch machinery: descriptors, pipes, processes, files.

pub mod cancel;
pub mod config;
pub mod manifest_store;
pub mod pipe;
pub mod process;
pub mod resolver;
pub mod spawner;
pub mod supervisor;
pub mod table;
