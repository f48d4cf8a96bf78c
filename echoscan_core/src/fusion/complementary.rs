//! Complementary strategy - fixed-gain range blend.
//!
//! Translation follows the IMU between ranges and is pulled toward each
//! range by `position_gain × confidence`, so confident samples move the
//! estimate more than weak ones. Orientation integrates the gyroscope and
//! leans slowly toward the accelerometer's gravity direction:
//!
//! ```text
//! q_fused = slerp(q_gyro, q_tilt, tilt_gain)
//! ```
//!
//! There is no covariance; a scalar variance proxy stands in for it.

use nalgebra::{Matrix6, UnitQuaternion, Vector3, Vector6};

use super::{integrate_gyro, world_acceleration, CorrectionOutcome, FusionAlgorithm, FusionConfig, FusionFilter, RangeObservation};
use crate::types::InertialSample;

/// Accelerometer magnitude window (fraction of g) trusted for tilt.
const TILT_TRUST_BAND: f64 = 0.2;

#[derive(Debug, Clone)]
pub struct ComplementaryFilter {
    config: FusionConfig,
    position: Vector3<f64>,
    velocity: Vector3<f64>,
    orientation: UnitQuaternion<f64>,
    position_variance: f64,
    velocity_variance: f64,
}

impl ComplementaryFilter {
    pub fn new(config: FusionConfig) -> Self {
        let position_variance = config.initial_position_variance;
        let velocity_variance = config.initial_velocity_variance;
        Self {
            config,
            position: Vector3::zeros(),
            velocity: Vector3::zeros(),
            orientation: UnitQuaternion::identity(),
            position_variance,
            velocity_variance,
        }
    }

    /// Nudges orientation so the measured specific force points up.
    fn blend_tilt(&mut self, specific_force: &Vector3<f64>) {
        let g = self.config.gravity;
        let magnitude = specific_force.norm();
        if (magnitude - g).abs() > TILT_TRUST_BAND * g {
            // Linear acceleration dominates, gravity direction unreliable
            return;
        }
        let measured_up = self.orientation * specific_force;
        if let Some(correction) =
            UnitQuaternion::scaled_rotation_between(&measured_up, &Vector3::z(), self.config.complementary_tilt_gain)
        {
            self.orientation = correction * self.orientation;
            self.orientation.renormalize();
        }
    }

    fn advance(&mut self, accel: &Vector3<f64>, dt: f64) {
        self.position += self.velocity * dt + accel * (0.5 * dt * dt);
        self.velocity += accel * dt;

        let q = self.config.accel_noise * self.config.accel_noise;
        self.position_variance += self.velocity_variance * dt * dt;
        self.velocity_variance += q * dt * dt;
    }
}

impl FusionFilter for ComplementaryFilter {
    fn algorithm(&self) -> FusionAlgorithm {
        FusionAlgorithm::Complementary
    }

    fn predict(&mut self, imu: &InertialSample, dt: f64) {
        if !(dt > 0.0) {
            return;
        }
        self.orientation = integrate_gyro(&self.orientation, &imu.gyroscope, dt);
        self.blend_tilt(&imu.accelerometer);
        let accel = world_acceleration(&self.orientation, &imu.accelerometer, self.config.gravity);
        self.advance(&accel, dt);
    }

    fn propagate(&mut self, dt: f64) {
        if dt > 0.0 {
            self.advance(&Vector3::zeros(), dt);
        }
    }

    fn correct(&mut self, obs: &RangeObservation) -> CorrectionOutcome {
        let d = obs.direction.into_inner();
        let innovation = obs.distance_m - obs.predicted(&self.position);
        let gain = (self.config.complementary_position_gain * obs.confidence).clamp(0.0, 1.0);
        let velocity_gain = self.config.complementary_velocity_gain * obs.confidence;

        // h = −p·d, so raising h means moving against d
        self.position -= d * (gain * innovation);
        self.velocity -= d * (velocity_gain * innovation);

        self.position_variance = (1.0 - gain) * self.position_variance + gain * gain * obs.noise_variance;
        self.velocity_variance *= 1.0 - velocity_gain.clamp(0.0, 1.0);

        CorrectionOutcome { innovation, gain }
    }

    fn position(&self) -> Vector3<f64> {
        self.position
    }

    fn velocity(&self) -> Vector3<f64> {
        self.velocity
    }

    fn orientation(&self) -> UnitQuaternion<f64> {
        self.orientation
    }

    fn covariance(&self) -> Matrix6<f64> {
        let p = self.position_variance;
        let v = self.velocity_variance;
        Matrix6::from_diagonal(&Vector6::new(p, p, p, v, v, v))
    }

    fn box_clone(&self) -> Box<dyn FusionFilter> {
        Box::new(self.clone())
    }

    fn reset(&mut self) {
        self.position = Vector3::zeros();
        self.velocity = Vector3::zeros();
        self.orientation = UnitQuaternion::identity();
        self.position_variance = self.config.initial_position_variance;
        self.velocity_variance = self.config.initial_velocity_variance;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn obs(distance: f64, confidence: f64) -> RangeObservation {
        RangeObservation {
            distance_m: distance,
            direction: Vector3::x_axis(),
            confidence,
            noise_variance: 0.0001,
        }
    }

    #[test]
    fn test_gain_scales_with_confidence() {
        let mut filter = ComplementaryFilter::new(FusionConfig::default());
        let outcome = filter.correct(&obs(2.0, 0.8));
        assert_relative_eq!(outcome.gain, 0.4);
        assert_relative_eq!(filter.position().x, -0.8);

        let mut weak = ComplementaryFilter::new(FusionConfig::default());
        weak.correct(&obs(2.0, 0.2));
        assert!(weak.position().x.abs() < filter.position().x.abs());
    }

    #[test]
    fn test_variance_proxy_shrinks_on_correction() {
        let mut filter = ComplementaryFilter::new(FusionConfig::default());
        let before = filter.covariance()[(0, 0)];
        filter.correct(&obs(2.0, 1.0));
        assert!(filter.covariance()[(0, 0)] < before);

        filter.propagate(1.0);
        let grown = filter.covariance()[(0, 0)];
        filter.propagate(1.0);
        assert!(filter.covariance()[(0, 0)] > grown);
    }

    #[test]
    fn test_tilt_blends_toward_gravity() {
        let mut filter = ComplementaryFilter::new(FusionConfig::default());
        // Device pitched: gravity shows up partly on body X
        let tilt = UnitQuaternion::from_euler_angles(0.0, 0.3, 0.0);
        let f_body = tilt.inverse() * Vector3::new(0.0, 0.0, 9.80665);
        let imu = InertialSample::new(0.0, f_body, Vector3::zeros());

        for _ in 0..500 {
            filter.predict(&imu, 0.01);
        }
        let up = filter.orientation() * f_body.normalize();
        assert_relative_eq!(up, Vector3::z(), epsilon = 1e-3);
    }
}
