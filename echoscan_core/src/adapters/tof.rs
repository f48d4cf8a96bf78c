//! ToF Ranger - single-zone optical time-of-flight.
//!
//! Wraps a VL53-class sensor that reports distance, a sigma estimate,
//! signal and ambient rates and a range status code. The native quality
//! fields are folded into one confidence in `[0, 1]`:
//!
//! ```text
//! confidence = signal / (signal + ambient) × (1 − sigma / sigma_max)
//! ```

use async_trait::async_trait;
use echoscan_env::EnvError;
use nalgebra::{Unit, Vector3};
use serde::{Deserialize, Serialize};

use super::{AdapterState, RangingAdapter};
use crate::cancel::CancelToken;
use crate::error::RangingError;
use crate::types::{DistanceRange, Modality, ModalityCapability, RangingSample};

/// ToF adapter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TofConfig {
    /// Declared range (default: 0.02 - 4.0 m)
    pub range: DistanceRange,

    /// Sigma at which confidence reaches zero, in mm (default: 40 mm)
    pub sigma_max_mm: f64,

    /// Sensor boresight in the body frame (default: +X)
    pub boresight: [f64; 3],

    /// Full field of view in degrees (default: 27°)
    pub field_of_view_deg: f64,

    /// Declared one-sigma accuracy in meters (default: 1.5 cm)
    pub accuracy_m: f64,
}

impl Default for TofConfig {
    fn default() -> Self {
        Self {
            range: DistanceRange::new(0.02, 4.0),
            sigma_max_mm: 40.0,
            boresight: [1.0, 0.0, 0.0],
            field_of_view_deg: 27.0,
            accuracy_m: 0.015,
        }
    }
}

/// One native sensor reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TofReading {
    /// Context time of the reading (seconds)
    pub timestamp: f64,
    pub distance_mm: u16,
    /// Estimated ranging precision
    pub sigma_mm: u16,
    /// Return signal rate (kcps)
    pub signal_kcps: u32,
    /// Ambient light rate (kcps)
    pub ambient_kcps: u32,
    /// 0 = valid, anything else is a sensor-specific failure code
    pub status: u8,
}

/// Platform time-of-flight sensor.
#[async_trait]
pub trait TofSensor: Send {
    async fn probe(&mut self) -> Result<(), EnvError>;
    async fn start(&mut self) -> Result<(), EnvError>;
    async fn read(&mut self) -> Result<TofReading, EnvError>;
    async fn stop(&mut self);
}

/// Folds the native quality fields into a `[0, 1]` confidence.
pub fn normalize_confidence(reading: &TofReading, sigma_max_mm: f64) -> f64 {
    let signal = reading.signal_kcps as f64;
    let total = signal + reading.ambient_kcps as f64;
    let signal_ratio = if total > 0.0 { signal / total } else { 0.0 };
    let precision = if sigma_max_mm > 0.0 {
        (1.0 - reading.sigma_mm as f64 / sigma_max_mm).clamp(0.0, 1.0)
    } else {
        0.0
    };
    (signal_ratio * precision).clamp(0.0, 1.0)
}

/// ToF ranging adapter.
pub struct TofRanger<S: TofSensor> {
    config: TofConfig,
    sensor: S,
    boresight: Unit<Vector3<f64>>,
    state: AdapterState,
}

impl<S: TofSensor> TofRanger<S> {
    pub fn new(config: TofConfig, sensor: S) -> Self {
        let boresight = Unit::try_new(Vector3::from(config.boresight), 1e-9).unwrap_or_else(Vector3::x_axis);
        Self {
            config,
            sensor,
            boresight,
            state: AdapterState::Uninitialized,
        }
    }

    pub fn state(&self) -> AdapterState {
        self.state
    }

    fn within_field_of_view(&self, direction: &Unit<Vector3<f64>>) -> bool {
        let half_fov = (self.config.field_of_view_deg / 2.0).to_radians();
        self.boresight.angle(direction) <= half_fov + 1e-9
    }
}

#[async_trait]
impl<S: TofSensor> RangingAdapter for TofRanger<S> {
    fn modality(&self) -> Modality {
        Modality::Tof
    }

    async fn initialize(&mut self) -> Result<ModalityCapability, RangingError> {
        if !self.config.range.is_valid() {
            return Err(RangingError::invalid_config("tof range is empty"));
        }
        self.sensor
            .probe()
            .await
            .map_err(|_| RangingError::HardwareUnavailable(Modality::Tof))?;
        self.state = AdapterState::Ready;
        Ok(ModalityCapability {
            modality: Modality::Tof,
            range: self.config.range,
            accuracy_m: self.config.accuracy_m,
        })
    }

    async fn start_session(&mut self) -> Result<(), RangingError> {
        match self.state {
            AdapterState::Uninitialized => Err(RangingError::NotStarted(Modality::Tof)),
            AdapterState::Active => Ok(()),
            AdapterState::Ready => {
                self.sensor.start().await?;
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
            return Err(RangingError::NotStarted(Modality::Tof));
        }
        if !self.within_field_of_view(&direction) {
            return Err(RangingError::NoReturn {
                modality: Modality::Tof,
                reason: "direction outside field of view".to_string(),
            });
        }
        cancel.check()?;

        let reading = self.sensor.read().await?;
        if reading.status != 0 {
            return Err(RangingError::NoReturn {
                modality: Modality::Tof,
                reason: format!("range status {}", reading.status),
            });
        }

        let distance = self
            .config
            .range
            .validate(Modality::Tof, reading.distance_mm as f64 / 1000.0)?;
        let confidence = normalize_confidence(&reading, self.config.sigma_max_mm);

        Ok(RangingSample::new(Modality::Tof, distance, confidence, reading.timestamp, direction)
            .with_metadata("sigma_mm", reading.sigma_mm as f64)
            .with_metadata("signal_kcps", reading.signal_kcps as f64)
            .with_metadata("ambient_kcps", reading.ambient_kcps as f64))
    }

    async fn stop_session(&mut self) {
        if self.state == AdapterState::Active {
            self.sensor.stop().await;
            self.state = AdapterState::Ready;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    struct FixedSensor {
        reading: TofReading,
    }

    #[async_trait]
    impl TofSensor for FixedSensor {
        async fn probe(&mut self) -> Result<(), EnvError> {
            Ok(())
        }
        async fn start(&mut self) -> Result<(), EnvError> {
            Ok(())
        }
        async fn read(&mut self) -> Result<TofReading, EnvError> {
            Ok(self.reading)
        }
        async fn stop(&mut self) {}
    }

    fn reading(distance_mm: u16, status: u8) -> TofReading {
        TofReading {
            timestamp: 0.25,
            distance_mm,
            sigma_mm: 2,
            signal_kcps: 8000,
            ambient_kcps: 200,
            status,
        }
    }

    async fn started(reading: TofReading) -> TofRanger<FixedSensor> {
        let mut ranger = TofRanger::new(TofConfig::default(), FixedSensor { reading });
        ranger.initialize().await.unwrap();
        ranger.start_session().await.unwrap();
        ranger
    }

    #[test]
    fn test_confidence_normalization() {
        let r = reading(1500, 0);
        let expected = (8000.0 / 8200.0) * (1.0 - 2.0 / 40.0);
        assert_relative_eq!(normalize_confidence(&r, 40.0), expected, epsilon = 1e-12);

        let dark = TofReading { signal_kcps: 0, ambient_kcps: 0, ..r };
        assert_eq!(normalize_confidence(&dark, 40.0), 0.0);

        let sloppy = TofReading { sigma_mm: 90, ..r };
        assert_eq!(normalize_confidence(&sloppy, 40.0), 0.0);
    }

    #[tokio::test]
    async fn test_valid_reading_becomes_sample() {
        let mut ranger = started(reading(1500, 0)).await;
        let sample = ranger.measure(Vector3::x_axis(), &CancelToken::new()).await.unwrap();
        assert_relative_eq!(sample.distance_m(), 1.5);
        assert_eq!(sample.timestamp(), 0.25);
        assert!(sample.confidence() > 0.9);
    }

    #[tokio::test]
    async fn test_bad_status_is_no_return() {
        let mut ranger = started(reading(1500, 4)).await;
        let err = ranger.measure(Vector3::x_axis(), &CancelToken::new()).await.unwrap_err();
        assert!(matches!(err, RangingError::NoReturn { modality: Modality::Tof, .. }));
    }

    #[tokio::test]
    async fn test_beyond_range_is_rejected() {
        let mut ranger = started(reading(6000, 0)).await;
        let err = ranger.measure(Vector3::x_axis(), &CancelToken::new()).await.unwrap_err();
        assert!(matches!(err, RangingError::OutOfRange { .. }));
    }

    #[tokio::test]
    async fn test_off_axis_direction_is_no_return() {
        let mut ranger = started(reading(1500, 0)).await;
        let err = ranger.measure(Vector3::y_axis(), &CancelToken::new()).await.unwrap_err();
        assert!(matches!(err, RangingError::NoReturn { .. }));
    }
}
