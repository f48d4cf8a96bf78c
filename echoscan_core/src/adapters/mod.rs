//! Ranging Source Adapters
//!
//! One adapter per modality, each wrapping a platform primitive behind the
//! same four-call lifecycle:
//!
//! ```text
//! initialize() ──► start_session() ──► measure(direction)* ──► stop_session()
//!  (capability)      (acquire)           (one sample or error)    (release)
//! ```
//!
//! Adapters never panic or unwind across the session boundary; every
//! failure is a typed `RangingError` the session manager can act on.
//! The platform side (audio streams, optical sensors, depth cameras) is
//! itself a trait so each platform, and the simulator, supplies its own.

use async_trait::async_trait;
use nalgebra::{Unit, Vector3};

use crate::cancel::CancelToken;
use crate::config::EngineConfig;
use crate::error::RangingError;
use crate::types::{Modality, ModalityCapability, RangingSample};

pub mod sonar;
pub mod tof;
pub mod depth;

pub use sonar::{AudioCapture, AudioTransducer, SonarConfig, SonarRanger};
pub use tof::{TofConfig, TofRanger, TofReading, TofSensor};
pub use depth::{DepthConfig, DepthFrame, DepthSampler, DepthSource};

/// Lifecycle state shared by all adapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    /// Constructed, hardware not yet probed
    Uninitialized,
    /// Probed and capable, resources not held
    Ready,
    /// Resources acquired, `measure()` allowed
    Active,
}

/// A per-modality ranging driver.
#[async_trait]
pub trait RangingAdapter: Send {
    /// The modality this adapter measures.
    fn modality(&self) -> Modality;

    /// Probes the hardware and reports what it can do.
    ///
    /// Absent hardware is `HardwareUnavailable`.
    async fn initialize(&mut self) -> Result<ModalityCapability, RangingError>;

    /// Acquires the hardware for a session.
    async fn start_session(&mut self) -> Result<(), RangingError>;

    /// Takes one measurement along `direction` (body frame).
    ///
    /// The returned distance always lies inside the declared range.
    async fn measure(
        &mut self,
        direction: Unit<Vector3<f64>>,
        cancel: &CancelToken,
    ) -> Result<RangingSample, RangingError>;

    /// Releases the hardware. Idempotent.
    async fn stop_session(&mut self);
}

/// Platform factory for adapters.
///
/// Each call returns a fresh adapter that owns its hardware handle.
/// `None` means the platform has no driver for the modality at all.
pub trait AdapterProvider: Send + Sync + 'static {
    fn create(&self, modality: Modality, config: &EngineConfig) -> Option<Box<dyn RangingAdapter>>;
}
