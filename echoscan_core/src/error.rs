//! Error types for the ranging and fusion engine.

use echoscan_env::{EnvError, Hardware, SessionId};
use thiserror::Error;

use crate::types::Modality;

/// Errors produced by ranging adapters and the signal correlator.
///
/// These never unwind past the session manager: each one is turned into
/// "skip this tick" or "disable the modality".
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RangingError {
    /// The correlation function had no usable peak
    #[error("No echo: correlation peak too weak or flat")]
    NoEcho,

    /// The capture ended before the expected number of samples arrived
    #[error("Capture timeout: got {captured} of {expected} samples")]
    CaptureTimeout { captured: usize, expected: usize },

    /// The measured distance lies outside the modality's declared range
    #[error("Out of range: {modality} measured {distance:.3}m outside [{min}, {max}]")]
    OutOfRange {
        modality: Modality,
        distance: f64,
        min: f64,
        max: f64,
    },

    /// An optical sensor reported no valid return
    #[error("No return from {modality}: {reason}")]
    NoReturn { modality: Modality, reason: String },

    /// Access to required hardware was refused
    #[error("Permission denied: {0}")]
    PermissionDenied(Hardware),

    /// The modality does not exist on this device
    #[error("Hardware unavailable: {0}")]
    HardwareUnavailable(Modality),

    /// The measurement was cancelled cooperatively
    #[error("Measurement cancelled")]
    Cancelled,

    /// `measure()` called outside of an active adapter session
    #[error("Adapter not started: {0}")]
    NotStarted(Modality),

    /// Platform device failure
    #[error("Device error: {0}")]
    Device(String),

    /// Invalid adapter / correlator configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl RangingError {
    /// Per-sample failures that a retry on the next tick may fix.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            RangingError::NoEcho
                | RangingError::CaptureTimeout { .. }
                | RangingError::OutOfRange { .. }
                | RangingError::NoReturn { .. }
                | RangingError::Cancelled
                | RangingError::Device(_)
        )
    }

    /// Failures that take the modality out of the session immediately,
    /// without waiting for the consecutive-failure limit.
    pub fn disables_modality(&self) -> bool {
        matches!(
            self,
            RangingError::PermissionDenied(_)
                | RangingError::HardwareUnavailable(_)
                | RangingError::NotStarted(_)
                | RangingError::InvalidConfig(_)
        )
    }

    /// Creates a device error.
    pub fn device(msg: impl Into<String>) -> Self {
        Self::Device(msg.into())
    }

    /// Creates an invalid configuration error.
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }
}

impl From<EnvError> for RangingError {
    fn from(err: EnvError) -> Self {
        match err {
            EnvError::PermissionDenied(hw) => RangingError::PermissionDenied(hw),
            EnvError::Timeout(ms) => RangingError::Device(format!("platform timeout after {}ms", ms)),
            EnvError::DeviceError(msg) => RangingError::Device(msg),
        }
    }
}

/// Errors produced by the fusion estimator.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FusionError {
    /// The state can no longer be trusted; the estimator has reset itself
    #[error("State corruption: {0}")]
    StateCorruption(String),

    /// The input sample was malformed and was skipped; state untouched
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl FusionError {
    pub fn corruption(reason: impl Into<String>) -> Self {
        Self::StateCorruption(reason.into())
    }

    pub fn invalid_input(reason: impl Into<String>) -> Self {
        Self::InvalidInput(reason.into())
    }
}

/// Errors surfaced by the session manager to its caller.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    /// The request named no modalities, or all were dropped
    #[error("No usable modalities")]
    NoUsableModalities,

    /// A required modality is not present on the device
    #[error("Required modality unavailable: {0}")]
    HardwareUnavailable(Modality),

    /// A required modality's hardware access was refused
    #[error("Permission denied for {modality}: {hardware}")]
    PermissionDenied { modality: Modality, hardware: Hardware },

    /// A required adapter failed to initialize or start
    #[error("Initialization of {modality} failed: {source}")]
    InitializationFailed {
        modality: Modality,
        #[source]
        source: RangingError,
    },

    /// Unknown session id
    #[error("Unknown session: {0}")]
    UnknownSession(SessionId),

    /// Lifecycle misuse that is not idempotent (e.g. worker did not stop in time)
    #[error("Session lifecycle error: {0}")]
    Lifecycle(String),

    /// Invalid configuration or request
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl SessionError {
    pub fn lifecycle(msg: impl Into<String>) -> Self {
        Self::Lifecycle(msg.into())
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }
}
