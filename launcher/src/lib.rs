//! Channel-binding process launcher.
//!
//! A child program is written against a fixed convention of abstract channels:
//! numbered descriptors (0 in, 1 out, 3 side channel, ...) and named parameters
//! (environment variables, positional arguments). This crate binds each channel
//! at launch time to a concrete resource declared in a [`core::manifest`], so the
//! child never learns where its data comes from.
//!
//! - **[`core`]**: Pure manifest model and validation. No I/O.
//! - **[`io`]**: Binding resolution, the channel table, process spawning and the
//!   lifecycle supervisor that releases every resolved resource exactly once.
//!
//! [`launch`] ties them together: resolve → spawn → wait → release.

pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod launch;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use crate::core::manifest::{
    BindingKind, ChannelBinding, ChannelId, Direction, LaunchManifest, ManifestSpec, StdStream,
};
pub use crate::error::{BindingError, LaunchError, ManifestError, TeardownError, WrapperError};
pub use crate::launch::{LaunchHandle, LaunchOptions, LaunchOutcome, launch, launch_detached};
