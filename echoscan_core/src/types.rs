//! Shared data model: modalities, ranging samples, inertial samples and
//! device capabilities.

use nalgebra::{Unit, Vector3};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use echoscan_env::Hardware;

use crate::error::RangingError;

// ============================================================================
// MODALITY
// ============================================================================

/// A ranging modality (physical sensing principle).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Modality {
    /// Active ultrasonic echolocation through the speaker/microphone pair
    Sonar,
    /// Single-zone optical time-of-flight ranging
    Tof,
    /// Structured-light / LiDAR depth map sampling
    Depth,
}

impl Modality {
    /// Returns all modalities in canonical order.
    pub fn all() -> [Modality; 3] {
        [Modality::Sonar, Modality::Tof, Modality::Depth]
    }

    /// Returns the modality name.
    pub fn name(&self) -> &'static str {
        match self {
            Modality::Sonar => "sonar",
            Modality::Tof => "tof",
            Modality::Depth => "depth",
        }
    }

    /// Hardware that must be authorized before this modality can run.
    pub fn required_hardware(&self) -> &'static [Hardware] {
        match self {
            Modality::Sonar => &[Hardware::Microphone, Hardware::Speaker],
            Modality::Tof => &[Hardware::ProximitySensor],
            Modality::Depth => &[Hardware::Camera],
        }
    }

    /// Returns true if this modality uses the audio transducer.
    pub fn uses_audio(&self) -> bool {
        matches!(self, Modality::Sonar)
    }
}

impl std::fmt::Display for Modality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Modality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sonar" | "ultrasonic" => Ok(Modality::Sonar),
            "tof" | "time_of_flight" => Ok(Modality::Tof),
            "depth" | "lidar" => Ok(Modality::Depth),
            _ => Err(format!("Unknown modality: {}", s)),
        }
    }
}

// ============================================================================
// DISTANCE RANGE
// ============================================================================

/// Declared measurement range of a modality, in meters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DistanceRange {
    pub min_m: f64,
    pub max_m: f64,
}

impl DistanceRange {
    pub const fn new(min_m: f64, max_m: f64) -> Self {
        Self { min_m, max_m }
    }

    /// Returns true if `distance` lies inside `[min, max]`.
    pub fn contains(&self, distance: f64) -> bool {
        distance.is_finite() && distance >= self.min_m && distance <= self.max_m
    }

    /// Rejects distances outside the range. Never clamps.
    pub fn validate(&self, modality: Modality, distance: f64) -> Result<f64, RangingError> {
        if self.contains(distance) {
            Ok(distance)
        } else {
            Err(RangingError::OutOfRange {
                modality,
                distance,
                min: self.min_m,
                max: self.max_m,
            })
        }
    }

    /// Returns true if the range is non-empty and finite.
    pub fn is_valid(&self) -> bool {
        self.min_m.is_finite() && self.max_m.is_finite() && self.min_m >= 0.0 && self.min_m < self.max_m
    }
}

// ============================================================================
// RANGING SAMPLE
// ============================================================================

/// Modality-specific raw values attached to a sample (diagnostics only).
pub type SampleMetadata = BTreeMap<String, f64>;

/// A single timestamped distance measurement.
///
/// Immutable once produced: fields are private and only exposed through
/// getters. Created by an adapter, consumed by the fusion estimator.
/// Deserialization enforces the same invariants as `new`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "SampleRecord")]
pub struct RangingSample {
    modality: Modality,
    distance_m: f64,
    confidence: f64,
    timestamp: f64,
    direction: Unit<Vector3<f64>>,
    metadata: SampleMetadata,
}

impl RangingSample {
    /// Creates a sample. Confidence is clamped into `[0, 1]`
    /// (non-finite confidence becomes 0).
    pub fn new(
        modality: Modality,
        distance_m: f64,
        confidence: f64,
        timestamp: f64,
        direction: Unit<Vector3<f64>>,
    ) -> Self {
        let confidence = if confidence.is_finite() {
            confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            modality,
            distance_m,
            confidence,
            timestamp,
            direction,
            metadata: SampleMetadata::new(),
        }
    }

    /// Attaches a metadata entry (builder style, before the sample is shared).
    pub fn with_metadata(mut self, key: &str, value: f64) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    pub fn modality(&self) -> Modality {
        self.modality
    }

    pub fn distance_m(&self) -> f64 {
        self.distance_m
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    /// Unit direction of the measurement in the device body frame.
    pub fn direction(&self) -> &Unit<Vector3<f64>> {
        &self.direction
    }

    pub fn metadata(&self) -> &SampleMetadata {
        &self.metadata
    }
}

/// Wire form of a `RangingSample`, checked before it becomes one.
#[derive(Deserialize)]
struct SampleRecord {
    modality: Modality,
    distance_m: f64,
    confidence: f64,
    timestamp: f64,
    direction: Vector3<f64>,
    #[serde(default)]
    metadata: SampleMetadata,
}

impl TryFrom<SampleRecord> for RangingSample {
    type Error = String;

    fn try_from(record: SampleRecord) -> Result<Self, Self::Error> {
        if !(0.0..=1.0).contains(&record.confidence) {
            return Err(format!("confidence {} outside [0, 1]", record.confidence));
        }
        let direction = Unit::try_new(record.direction, 1e-9)
            .ok_or_else(|| format!("direction {:?} is not a usable vector", record.direction))?;
        let mut sample = RangingSample::new(
            record.modality,
            record.distance_m,
            record.confidence,
            record.timestamp,
            direction,
        );
        sample.metadata = record.metadata;
        Ok(sample)
    }
}

// ============================================================================
// INERTIAL SAMPLE
// ============================================================================

/// One accelerometer/gyroscope(/magnetometer) reading in the body frame.
///
/// # Units
///
/// - Accelerometer: specific force in m/s² (a resting device reads +g up)
/// - Gyroscope: rad/s
/// - Magnetometer: any consistent unit (only the direction is used)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InertialSample {
    pub timestamp: f64,
    pub accelerometer: Vector3<f64>,
    pub gyroscope: Vector3<f64>,
    pub magnetometer: Option<Vector3<f64>>,
}

impl InertialSample {
    pub fn new(timestamp: f64, accelerometer: Vector3<f64>, gyroscope: Vector3<f64>) -> Self {
        Self {
            timestamp,
            accelerometer,
            gyroscope,
            magnetometer: None,
        }
    }

    /// A device at rest in its reference attitude (Z up).
    pub fn stationary(timestamp: f64, gravity: f64) -> Self {
        Self::new(timestamp, Vector3::new(0.0, 0.0, gravity), Vector3::zeros())
    }

    pub fn with_magnetometer(mut self, magnetometer: Vector3<f64>) -> Self {
        self.magnetometer = Some(magnetometer);
        self
    }

    /// Returns true if every component is finite.
    pub fn is_finite(&self) -> bool {
        self.timestamp.is_finite()
            && self.accelerometer.iter().all(|v| v.is_finite())
            && self.gyroscope.iter().all(|v| v.is_finite())
            && self
                .magnetometer
                .map_or(true, |m| m.iter().all(|v| v.is_finite()))
    }
}

// ============================================================================
// CAPABILITIES
// ============================================================================

/// What one modality can do on this device.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModalityCapability {
    pub modality: Modality,
    pub range: DistanceRange,
    /// One-sigma distance accuracy in meters
    pub accuracy_m: f64,
}

/// Device capability set, computed once at initialization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    pub modalities: BTreeMap<Modality, ModalityCapability>,
}

impl DeviceCapabilities {
    /// Returns true if the modality is physically available.
    pub fn supports(&self, modality: Modality) -> bool {
        self.modalities.contains_key(&modality)
    }

    /// Available modalities in canonical order.
    pub fn available_modalities(&self) -> Vec<Modality> {
        self.modalities.keys().copied().collect()
    }

    pub fn get(&self, modality: Modality) -> Option<&ModalityCapability> {
        self.modalities.get(&modality)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_json_keeps_confidence_in_unit_range() {
        let sample = RangingSample::new(Modality::Tof, 1.5, 0.7, 2.0, Vector3::x_axis()).with_metadata("sigma_mm", 4.0);
        let json = serde_json::to_string(&sample).unwrap();
        assert_eq!(serde_json::from_str::<RangingSample>(&json).unwrap(), sample);

        let forged = json.replace("0.7", "5.0");
        let err = serde_json::from_str::<RangingSample>(&forged).unwrap_err();
        assert!(err.to_string().contains("confidence"));

        let negative = r#"{"modality":"Tof","distance_m":1.0,"confidence":-0.1,"timestamp":0.0,"direction":[1.0,0.0,0.0]}"#;
        assert!(serde_json::from_str::<RangingSample>(negative).is_err());

        let zero = r#"{"modality":"Tof","distance_m":1.0,"confidence":0.5,"timestamp":0.0,"direction":[0.0,0.0,0.0]}"#;
        assert!(serde_json::from_str::<RangingSample>(zero).is_err());
    }

    #[test]
    fn test_range_rejects_instead_of_clamping() {
        let range = DistanceRange::new(0.1, 10.0);
        assert!(range.validate(Modality::Sonar, 2.0).is_ok());

        match range.validate(Modality::Sonar, 0.05) {
            Err(RangingError::OutOfRange { distance, min, .. }) => {
                assert_eq!(distance, 0.05);
                assert_eq!(min, 0.1);
            }
            other => panic!("expected OutOfRange, got {:?}", other),
        }
        assert!(range.validate(Modality::Sonar, f64::NAN).is_err());
    }

    #[test]
    fn test_sample_confidence_is_clamped() {
        let dir = Vector3::x_axis();
        assert_eq!(RangingSample::new(Modality::Tof, 1.0, 1.7, 0.0, dir).confidence(), 1.0);
        assert_eq!(RangingSample::new(Modality::Tof, 1.0, -0.2, 0.0, dir).confidence(), 0.0);
        assert_eq!(RangingSample::new(Modality::Tof, 1.0, f64::NAN, 0.0, dir).confidence(), 0.0);
    }

    #[test]
    fn test_modality_parse_roundtrip() {
        for m in Modality::all() {
            assert_eq!(m.name().parse::<Modality>().unwrap(), m);
        }
        assert!("radar".parse::<Modality>().is_err());
    }

    #[test]
    fn test_inertial_finite_check() {
        let mut imu = InertialSample::stationary(0.0, 9.81);
        assert!(imu.is_finite());
        imu.gyroscope.x = f64::INFINITY;
        assert!(!imu.is_finite());
    }
}
