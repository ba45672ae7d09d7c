//! Cooperative cancellation shared between a caller and one launch.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Abort request for one launch.
///
/// Before the child starts, resolution stops at the next binding and releases
/// what it opened. After the child starts, the child is terminated and normal
/// teardown runs.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
