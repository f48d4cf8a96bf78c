//! Sonar Ranger - active ultrasonic echolocation.
//!
//! Emits the chirp through the speaker, records the echo, and hands both
//! to the `SignalCorrelator`. The audio transducer is moved into the ranger,
//! so nothing else can emit or record while a session holds it, and
//! `measure(&mut self)` keeps at most one ping in flight.

use async_trait::async_trait;
use echoscan_env::EnvError;
use nalgebra::{Unit, Vector3};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{AdapterState, RangingAdapter};
use crate::cancel::CancelToken;
use crate::correlator::{synthesize_chirp, ChirpConfig, CorrelatorConfig, EchoSignal, SignalCorrelator};
use crate::error::RangingError;
use crate::types::{Modality, ModalityCapability, RangingSample};

/// Sonar adapter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SonarConfig {
    pub chirp: ChirpConfig,
    pub correlator: CorrelatorConfig,

    /// Recording window after emission, in seconds (default: 2 s)
    pub capture_duration_s: f64,

    /// Declared one-sigma accuracy in meters (default: 1 cm)
    pub accuracy_m: f64,
}

impl Default for SonarConfig {
    fn default() -> Self {
        Self {
            chirp: ChirpConfig::default(),
            correlator: CorrelatorConfig::default(),
            capture_duration_s: 2.0,
            accuracy_m: 0.01,
        }
    }
}

impl SonarConfig {
    /// Number of samples a complete capture must contain.
    pub fn capture_len(&self) -> usize {
        let window = (self.capture_duration_s * self.chirp.sample_rate).round().max(0.0) as usize;
        window.max(self.chirp.num_samples())
    }
}

/// Samples recorded after one emission.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioCapture {
    pub samples: Vec<f32>,
    /// Context time at which playback started (seconds)
    pub started_at: f64,
}

/// Platform speaker + microphone pair.
#[async_trait]
pub trait AudioTransducer: Send {
    /// Checks that both playback and capture devices exist.
    async fn probe(&mut self) -> Result<(), EnvError>;

    /// Opens the audio streams.
    async fn open(&mut self) -> Result<(), EnvError>;

    /// Plays `pulse` and records `capture_len` samples from the same instant.
    ///
    /// A capture that ends early returns fewer samples.
    async fn emit_and_capture(
        &mut self,
        pulse: &[f32],
        sample_rate: f64,
        capture_len: usize,
    ) -> Result<AudioCapture, EnvError>;

    /// Closes the audio streams. Idempotent.
    async fn close(&mut self);
}

/// Sonar ranging adapter.
pub struct SonarRanger<T: AudioTransducer> {
    config: SonarConfig,
    transducer: T,
    correlator: SignalCorrelator,
    chirp: Vec<f32>,
    state: AdapterState,
}

impl<T: AudioTransducer> SonarRanger<T> {
    pub fn new(config: SonarConfig, transducer: T) -> Self {
        let correlator = SignalCorrelator::new(config.correlator.clone());
        Self {
            config,
            transducer,
            correlator,
            chirp: Vec::new(),
            state: AdapterState::Uninitialized,
        }
    }

    pub fn state(&self) -> AdapterState {
        self.state
    }

    pub fn config(&self) -> &SonarConfig {
        &self.config
    }
}

#[async_trait]
impl<T: AudioTransducer> RangingAdapter for SonarRanger<T> {
    fn modality(&self) -> Modality {
        Modality::Sonar
    }

    async fn initialize(&mut self) -> Result<ModalityCapability, RangingError> {
        self.chirp = synthesize_chirp(&self.config.chirp)?;
        self.transducer
            .probe()
            .await
            .map_err(|_| RangingError::HardwareUnavailable(Modality::Sonar))?;
        self.state = AdapterState::Ready;

        let resolution = self.correlator.distance_resolution(self.config.chirp.sample_rate);
        Ok(ModalityCapability {
            modality: Modality::Sonar,
            range: self.config.correlator.range,
            accuracy_m: self.config.accuracy_m.max(resolution),
        })
    }

    async fn start_session(&mut self) -> Result<(), RangingError> {
        match self.state {
            AdapterState::Uninitialized => Err(RangingError::NotStarted(Modality::Sonar)),
            AdapterState::Active => Ok(()),
            AdapterState::Ready => {
                self.transducer.open().await?;
                self.state = AdapterState::Active;
                Ok(())
            }
        }
    }

    async fn measure(
        &mut self,
        direction: Unit<Vector3<f64>>,
        cancel: &CancelToken,
    ) -> Result<RangingSample, RangingError> {
        if self.state != AdapterState::Active {
            return Err(RangingError::NotStarted(Modality::Sonar));
        }
        cancel.check()?;

        let expected = self.config.capture_len();
        let capture = self
            .transducer
            .emit_and_capture(&self.chirp, self.config.chirp.sample_rate, expected)
            .await?;
        cancel.check()?;

        if capture.samples.len() < expected {
            return Err(RangingError::CaptureTimeout {
                captured: capture.samples.len(),
                expected,
            });
        }

        let echo = EchoSignal::new(self.config.chirp.sample_rate, self.chirp.clone(), capture.samples);
        let sample = self.correlator.estimate(&echo, direction, capture.started_at, cancel)?;
        debug!(
            "sonar ping: {:.3}m conf={:.2} at t={:.3}",
            sample.distance_m(),
            sample.confidence(),
            sample.timestamp()
        );
        Ok(sample)
    }

    async fn stop_session(&mut self) {
        if self.state == AdapterState::Active {
            self.transducer.close().await;
            self.state = AdapterState::Ready;
        }
    }
}
