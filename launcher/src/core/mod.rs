//! Deterministic, pure logic for launch manifests.
//!
//! Core modules must be free of I/O side effects. They describe what a launch
//! binds and check that the description is coherent before anything is opened.

pub mod argv;
pub mod invariants;
pub mod manifest;
