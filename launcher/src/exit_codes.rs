//! Stable exit codes for the launcher CLI.
//!
//! A child's own exit code is passed through unchanged; only failures inside the
//! wrapper use [`WRAPPER_FAILURE`] (or the configured override).

use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

/// Command succeeded (`validate`, `init-config`).
pub const OK: i32 = 0;
/// The wrapper failed to resolve bindings or to start the child.
pub const WRAPPER_FAILURE: i32 = 125;
/// Added to the signal number when the child was killed by a signal.
pub const SIGNAL_BASE: i32 = 128;

/// Map a child's exit status to the code the wrapper exits with.
pub fn from_status(status: &ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    match status.signal() {
        Some(signal) => SIGNAL_BASE + signal,
        None => WRAPPER_FAILURE,
    }
}
