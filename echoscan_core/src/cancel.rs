//! Cooperative cancellation for in-flight measurements.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::RangingError;

/// Shared cancellation flag.
///
/// The session manager holds one per session and raises it on stop;
/// long-running steps (sonar capture, correlation) poll it between stages.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Returns `Err(Cancelled)` once cancellation was requested.
    pub fn check(&self) -> Result<(), RangingError> {
        if self.is_cancelled() {
            Err(RangingError::Cancelled)
        } else {
            Ok(())
        }
    }
}
