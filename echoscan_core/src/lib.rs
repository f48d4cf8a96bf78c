//! EchoScan Core - Multi-Sensor Ranging and Fusion Engine
//!
//! Measures the distance from a handheld device to the surface it points
//! at by combining three ranging modalities with inertial data:
//! 1. **Sonar**: ultrasonic chirp + FFT matched filter (`correlator`)
//! 2. **Time-of-flight**: single-zone optical ranging
//! 3. **Depth**: center-patch sampling of a depth map
//!
//! Samples flow through one [`FusionEstimator`] per session (Kalman,
//! complementary or Madgwick) and out as [`FusionUpdate`]s. The
//! [`SessionManager`] owns the lifecycle: capability, permission and
//! initialization gating, the sampling worker, and graceful degradation
//! when a modality fails mid-session.

pub mod adapters;
pub mod cancel;
pub mod config;
pub mod correlator;
pub mod error;
pub mod fusion;
pub mod reporter;
pub mod session;
pub mod types;

// Re-export key types for convenience
pub use adapters::{AdapterProvider, AdapterState, RangingAdapter};
pub use cancel::CancelToken;
pub use config::{EngineConfig, SessionConfig};
pub use correlator::{ChirpConfig, CorrelatorConfig, EchoEstimate, EchoSignal, SignalCorrelator};
pub use error::{FusionError, RangingError, SessionError};
pub use fusion::{FusionAlgorithm, FusionConfig, FusionEstimator, FusionState};
pub use reporter::{CapabilityReporter, ConfidenceConfig, ConfidenceTracker};
pub use session::{
    FusionUpdate, RangingSession, SensorEvent, SessionEvent, SessionManager, SessionRequest, SessionStatus,
    SessionSummary, Termination,
};
pub use types::{DeviceCapabilities, DistanceRange, InertialSample, Modality, ModalityCapability, RangingSample};
