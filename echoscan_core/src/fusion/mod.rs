//! The Fusion Estimator - inertial prediction + ranging correction.
//!
//! # Frames
//!
//! The body frame is the device frame the sensors report in. The world
//! frame is gravity-aligned (Z up) with its origin at the ranged surface
//! point, so the state position is the device's offset from that point.
//! A range `r` measured along body direction `d_b` observes
//!
//! ```text
//! d = q · d_b            (world direction)
//! h(p) = −p · d          (distance from device to surface along d)
//! ```
//!
//! # Strategies
//!
//! | Algorithm     | Translation                         | Orientation            |
//! |---------------|-------------------------------------|------------------------|
//! | Kalman        | 6-state CV filter, covariance gain  | gyro integration       |
//! | Complementary | fixed gain × confidence             | gyro + slow tilt blend |
//! | Madgwick      | not estimated                       | gradient descent       |
//!
//! All three sit behind `FusionFilter`; the `FusionEstimator` wraps the
//! chosen one with timestamp bookkeeping and corruption recovery.

use nalgebra::{Matrix6, Unit, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::check_positive;
use crate::error::{FusionError, SessionError};
use crate::reporter::{ConfidenceConfig, ConfidenceTracker};
use crate::types::{InertialSample, RangingSample};

pub mod complementary;
pub mod kalman;
pub mod madgwick;

pub use complementary::ComplementaryFilter;
pub use kalman::KalmanFilter;
pub use madgwick::MadgwickFilter;

/// Tolerance on `|‖q‖ − 1|` before the orientation counts as corrupted.
pub const ORIENTATION_NORM_TOLERANCE: f64 = 1e-6;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Correction strategy, chosen per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FusionAlgorithm {
    /// Covariance-weighted blend (default)
    #[default]
    Kalman,
    /// Fixed-gain blend
    Complementary,
    /// Orientation-only gradient descent
    Madgwick,
}

impl FusionAlgorithm {
    pub fn all() -> [FusionAlgorithm; 3] {
        [FusionAlgorithm::Kalman, FusionAlgorithm::Complementary, FusionAlgorithm::Madgwick]
    }

    pub fn name(&self) -> &'static str {
        match self {
            FusionAlgorithm::Kalman => "kalman",
            FusionAlgorithm::Complementary => "complementary",
            FusionAlgorithm::Madgwick => "madgwick",
        }
    }

    /// Returns true if range corrections move the translation estimate.
    pub fn estimates_translation(&self) -> bool {
        !matches!(self, FusionAlgorithm::Madgwick)
    }
}

impl std::fmt::Display for FusionAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for FusionAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "kalman" | "ekf" => Ok(FusionAlgorithm::Kalman),
            "complementary" => Ok(FusionAlgorithm::Complementary),
            "madgwick" => Ok(FusionAlgorithm::Madgwick),
            _ => Err(format!("Unknown fusion algorithm: {}", s)),
        }
    }
}

/// Fusion tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Local gravity in m/s² (default: 9.80665)
    pub gravity: f64,

    /// Initial position variance in m² (default: 25, i.e. "somewhere in the room")
    pub initial_position_variance: f64,

    /// Initial velocity variance in (m/s)² (default: 0.25)
    pub initial_velocity_variance: f64,

    /// White acceleration noise density in m/s² (default: 0.5)
    pub accel_noise: f64,

    /// Lower bound on confidence when scaling measurement noise (default: 0.05)
    pub confidence_floor: f64,

    /// Complementary position gain at confidence 1 (default: 0.5)
    pub complementary_position_gain: f64,

    /// Complementary velocity gain at confidence 1 (default: 0.1)
    pub complementary_velocity_gain: f64,

    /// Complementary per-step tilt blend toward the accelerometer (default: 0.02)
    pub complementary_tilt_gain: f64,

    /// Madgwick gradient step gain β (default: 0.1)
    pub madgwick_beta: f64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            gravity: 9.80665,
            initial_position_variance: 25.0,
            initial_velocity_variance: 0.25,
            accel_noise: 0.5,
            confidence_floor: 0.05,
            complementary_position_gain: 0.5,
            complementary_velocity_gain: 0.1,
            complementary_tilt_gain: 0.02,
            madgwick_beta: 0.1,
        }
    }
}

impl FusionConfig {
    pub fn validate(&self) -> Result<(), SessionError> {
        check_positive("fusion.gravity", self.gravity)?;
        check_positive("fusion.initial_position_variance", self.initial_position_variance)?;
        check_positive("fusion.initial_velocity_variance", self.initial_velocity_variance)?;
        check_positive("fusion.accel_noise", self.accel_noise)?;
        check_positive("fusion.madgwick_beta", self.madgwick_beta)?;
        for (name, value) in [
            ("fusion.confidence_floor", self.confidence_floor),
            ("fusion.complementary_position_gain", self.complementary_position_gain),
            ("fusion.complementary_velocity_gain", self.complementary_velocity_gain),
            ("fusion.complementary_tilt_gain", self.complementary_tilt_gain),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(SessionError::invalid_config(format!("{} must lie in (0, 1], got {}", name, value)));
            }
        }
        Ok(())
    }

    /// Covariance the filters start from and reset to.
    pub fn initial_covariance(&self) -> Matrix6<f64> {
        let p = self.initial_position_variance;
        let v = self.initial_velocity_variance;
        Matrix6::from_diagonal(&nalgebra::Vector6::new(p, p, p, v, v, v))
    }
}

// ============================================================================
// STATE
// ============================================================================

/// Snapshot of the estimator state. Callers only ever get copies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusionState {
    /// Device position relative to the ranged surface point (world frame, m)
    pub position: Vector3<f64>,
    /// World-frame velocity (m/s)
    pub velocity: Vector3<f64>,
    /// Body → world rotation
    pub orientation: UnitQuaternion<f64>,
    /// Context time of the last applied step (seconds)
    pub last_update: f64,
    /// Position/velocity covariance (or the filter's equivalent)
    pub covariance: Matrix6<f64>,
}

impl FusionState {
    /// At the surface-frame origin, at rest, level.
    pub fn identity(timestamp: f64) -> Self {
        Self {
            position: Vector3::zeros(),
            velocity: Vector3::zeros(),
            orientation: UnitQuaternion::identity(),
            last_update: timestamp,
            covariance: Matrix6::identity(),
        }
    }

    /// Fused distance to the surface along a body-frame direction.
    pub fn distance_along(&self, direction_body: &Unit<Vector3<f64>>) -> f64 {
        let world = self.orientation * direction_body.into_inner();
        -self.position.dot(&world)
    }

    /// Norm of the underlying quaternion (1 for a valid rotation).
    pub fn orientation_norm(&self) -> f64 {
        self.orientation.quaternion().norm()
    }

    /// Position standard deviation, averaged over the three axes.
    pub fn position_sigma(&self) -> f64 {
        let trace = self.covariance.fixed_view::<3, 3>(0, 0).trace();
        (trace / 3.0).max(0.0).sqrt()
    }
}

// ============================================================================
// FILTER INTERFACE
// ============================================================================

/// A range measurement in the world frame, ready for a filter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangeObservation {
    pub distance_m: f64,
    pub direction: Unit<Vector3<f64>>,
    pub confidence: f64,
    /// Measurement noise variance after confidence scaling (m²)
    pub noise_variance: f64,
}

impl RangeObservation {
    /// Predicted distance for a given position.
    pub fn predicted(&self, position: &Vector3<f64>) -> f64 {
        -position.dot(&self.direction)
    }
}

/// What one correction did.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CorrectionOutcome {
    /// Measured minus predicted distance (m)
    pub innovation: f64,
    /// Fraction of the innovation absorbed into the state along the ray
    pub gain: f64,
}

/// Interchangeable correction strategy.
///
/// Filters never fail: the estimator validates their state after each call
/// and resets them when it stops being trustworthy.
pub trait FusionFilter: Send {
    fn algorithm(&self) -> FusionAlgorithm;

    /// Inertial step over `dt` seconds.
    fn predict(&mut self, imu: &InertialSample, dt: f64);

    /// Time update without inertial input (constant velocity).
    fn propagate(&mut self, dt: f64);

    /// Range correction.
    fn correct(&mut self, obs: &RangeObservation) -> CorrectionOutcome;

    fn position(&self) -> Vector3<f64>;
    fn velocity(&self) -> Vector3<f64>;
    fn orientation(&self) -> UnitQuaternion<f64>;
    fn covariance(&self) -> Matrix6<f64>;

    /// Copy of the filter with its full internal state.
    fn box_clone(&self) -> Box<dyn FusionFilter>;

    /// Back to the identity state and initial uncertainty.
    fn reset(&mut self);
}

/// Builds the filter for `algorithm`.
pub fn create_filter(algorithm: FusionAlgorithm, config: &FusionConfig) -> Box<dyn FusionFilter> {
    match algorithm {
        FusionAlgorithm::Kalman => Box::new(KalmanFilter::new(config.clone())),
        FusionAlgorithm::Complementary => Box::new(ComplementaryFilter::new(config.clone())),
        FusionAlgorithm::Madgwick => Box::new(MadgwickFilter::new(config.clone())),
    }
}

/// Integrates body-frame angular rate into the orientation.
pub(crate) fn integrate_gyro(q: &UnitQuaternion<f64>, gyro: &Vector3<f64>, dt: f64) -> UnitQuaternion<f64> {
    let mut next = q * UnitQuaternion::from_scaled_axis(gyro * dt);
    next.renormalize();
    next
}

/// Specific force (body) → world-frame kinematic acceleration.
pub(crate) fn world_acceleration(q: &UnitQuaternion<f64>, specific_force: &Vector3<f64>, gravity: f64) -> Vector3<f64> {
    q * specific_force - Vector3::new(0.0, 0.0, gravity)
}

// ============================================================================
// ESTIMATOR
// ============================================================================

/// Single-writer state estimator for one session.
///
/// Owns the filter, the monotonic time base and the confidence tracker.
/// `FusionState::last_update` never decreases, including across resets.
pub struct FusionEstimator {
    config: FusionConfig,
    filter: Box<dyn FusionFilter>,
    tracker: ConfidenceTracker,
    last_update: f64,
    resets: u32,
}

impl Clone for FusionEstimator {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            filter: self.filter.box_clone(),
            tracker: self.tracker.clone(),
            last_update: self.last_update,
            resets: self.resets,
        }
    }
}

impl FusionEstimator {
    pub fn new(algorithm: FusionAlgorithm, config: FusionConfig, confidence: ConfidenceConfig, start_time: f64) -> Self {
        let filter = create_filter(algorithm, &config);
        Self {
            config,
            filter,
            tracker: ConfidenceTracker::new(confidence),
            last_update: start_time,
            resets: 0,
        }
    }

    pub fn algorithm(&self) -> FusionAlgorithm {
        self.filter.algorithm()
    }

    pub fn last_update(&self) -> f64 {
        self.last_update
    }

    /// Number of corruption resets so far.
    pub fn resets(&self) -> u32 {
        self.resets
    }

    pub fn tracker(&self) -> &ConfidenceTracker {
        &self.tracker
    }

    /// Session-level confidence at time `now`.
    pub fn session_confidence(&self, now: f64) -> f64 {
        self.tracker.session_confidence(now)
    }

    /// Copy of the current state.
    pub fn state(&self) -> FusionState {
        FusionState {
            position: self.filter.position(),
            velocity: self.filter.velocity(),
            orientation: self.filter.orientation(),
            last_update: self.last_update,
            covariance: self.filter.covariance(),
        }
    }

    /// Inertial prediction step.
    ///
    /// A timestamp earlier than the last update is state corruption: the
    /// filter is reset to identity at the last timestamp.
    pub fn predict(&mut self, imu: &InertialSample) -> Result<(), FusionError> {
        if !imu.is_finite() {
            return Err(FusionError::invalid_input("non-finite inertial sample"));
        }
        if imu.timestamp < self.last_update {
            let reason = format!(
                "non-monotonic predict: t={:.6} before last update {:.6}",
                imu.timestamp, self.last_update
            );
            self.reset_state(&reason);
            return Err(FusionError::corruption(reason));
        }

        let dt = imu.timestamp - self.last_update;
        self.filter.predict(imu, dt);
        self.last_update = imu.timestamp;
        self.check_health()
    }

    /// Range correction step.
    ///
    /// The filter is first propagated to the sample's timestamp. A sample
    /// older than the state is refused as invalid input; the state is left
    /// untouched.
    pub fn correct(&mut self, sample: &RangingSample, accuracy_m: f64) -> Result<CorrectionOutcome, FusionError> {
        let distance = sample.distance_m();
        if !(distance.is_finite() && distance > 0.0) {
            return Err(FusionError::invalid_input(format!("distance {} is not a positive number", distance)));
        }
        if !sample.timestamp().is_finite() {
            return Err(FusionError::invalid_input("non-finite sample timestamp"));
        }
        if !(accuracy_m.is_finite() && accuracy_m > 0.0) {
            return Err(FusionError::invalid_input(format!("accuracy {} is not a positive number", accuracy_m)));
        }

        if sample.timestamp() < self.last_update {
            return Err(FusionError::invalid_input(format!(
                "stale {} sample: t={:.6} before last update {:.6}",
                sample.modality(),
                sample.timestamp(),
                self.last_update
            )));
        }
        if sample.timestamp() > self.last_update {
            self.filter.propagate(sample.timestamp() - self.last_update);
            self.last_update = sample.timestamp();
        }

        let direction = Unit::new_normalize(self.filter.orientation() * sample.direction().into_inner());
        let confidence = sample.confidence();
        let obs = RangeObservation {
            distance_m: distance,
            direction,
            confidence,
            noise_variance: accuracy_m * accuracy_m / confidence.max(self.config.confidence_floor),
        };

        let outcome = self.filter.correct(&obs);
        self.check_health()?;
        self.tracker.record(sample.modality(), confidence, sample.timestamp());
        Ok(outcome)
    }

    /// Fused distance along a body-frame direction.
    pub fn distance_along(&self, direction_body: &Unit<Vector3<f64>>) -> f64 {
        self.state().distance_along(direction_body)
    }

    fn reset_state(&mut self, reason: &str) {
        warn!("fusion state reset ({}): {}", self.filter.algorithm(), reason);
        self.filter.reset();
        self.resets += 1;
    }

    fn check_health(&mut self) -> Result<(), FusionError> {
        let norm = self.filter.orientation().quaternion().norm();
        let reason = if !((norm - 1.0).abs() <= ORIENTATION_NORM_TOLERANCE) {
            Some(format!("orientation norm {} is not a unit rotation", norm))
        } else if !self.filter.position().iter().chain(self.filter.velocity().iter()).all(|v| v.is_finite()) {
            Some("non-finite position or velocity".to_string())
        } else if !self.filter.covariance().iter().all(|v| v.is_finite()) {
            Some("non-finite covariance".to_string())
        } else {
            None
        };

        match reason {
            Some(reason) => {
                self.reset_state(&reason);
                Err(FusionError::corruption(reason))
            }
            None => Ok(()),
        }
    }
}
