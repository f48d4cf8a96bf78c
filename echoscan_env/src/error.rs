//! Error types for the EchoScan environment abstraction.

use thiserror::Error;

use crate::permission::Hardware;

/// Errors that can occur in the environment abstraction layer.
#[derive(Debug, Error)]
pub enum EnvError {
    /// Platform device access failed (stream closed, driver error, etc.)
    #[error("Device error: {0}")]
    DeviceError(String),

    /// The user or platform refused access to a piece of hardware
    #[error("Permission denied: {0}")]
    PermissionDenied(Hardware),

    /// A platform call did not complete in time
    #[error("Timeout after {0}ms")]
    Timeout(u64),
}

impl EnvError {
    /// Creates a device error.
    pub fn device(msg: impl Into<String>) -> Self {
        Self::DeviceError(msg.into())
    }
}
