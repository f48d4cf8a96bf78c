//! Kalman strategy - constant-velocity filter with acceleration input.
//!
//! State `x = [p; v]` (world frame). Gravity-compensated acceleration from
//! the IMU drives the prediction; each range is a scalar update with
//! `H = [−dᵀ, 0]`.

use nalgebra::{Matrix3, Matrix6, RowVector6, UnitQuaternion, Vector3, Vector6};

use super::{integrate_gyro, world_acceleration, CorrectionOutcome, FusionAlgorithm, FusionConfig, FusionFilter, RangeObservation};
use crate::types::InertialSample;

/// Covariance-weighted range/inertial filter.
#[derive(Debug, Clone)]
pub struct KalmanFilter {
    config: FusionConfig,
    /// [px, py, pz, vx, vy, vz]
    state: Vector6<f64>,
    covariance: Matrix6<f64>,
    orientation: UnitQuaternion<f64>,
}

impl KalmanFilter {
    pub fn new(config: FusionConfig) -> Self {
        let covariance = config.initial_covariance();
        Self {
            config,
            state: Vector6::zeros(),
            covariance,
            orientation: UnitQuaternion::identity(),
        }
    }

    /// Time update: x = F x + B a,  P = F P Fᵀ + Q
    #[allow(non_snake_case)]
    fn time_update(&mut self, accel: &Vector3<f64>, dt: f64) {
        if !(dt > 0.0) {
            return;
        }

        let F = motion_model(dt);
        let mut x = F * self.state;
        x.fixed_rows_mut::<3>(0).axpy(0.5 * dt * dt, accel, 1.0);
        x.fixed_rows_mut::<3>(3).axpy(dt, accel, 1.0);
        self.state = x;

        let Q = process_noise(self.config.accel_noise, dt);
        self.covariance = F * self.covariance * F.transpose() + Q;
    }

    /// Reset covariance to the initial uncertainty (self-healing).
    fn reset_covariance(&mut self) {
        self.covariance = self.config.initial_covariance();
    }
}

/// Constant-velocity transition for one step.
fn motion_model(dt: f64) -> Matrix6<f64> {
    let mut f = Matrix6::identity();
    f.fixed_view_mut::<3, 3>(0, 3).copy_from(&(Matrix3::identity() * dt));
    f
}

/// White-acceleration process noise.
///
/// ```text
/// Q = σa² · [ dt⁴/4·I   dt³/2·I ]
///           [ dt³/2·I   dt²·I   ]
/// ```
fn process_noise(accel_noise: f64, dt: f64) -> Matrix6<f64> {
    let s2 = accel_noise * accel_noise;
    let dt2 = dt * dt;
    let mut q = Matrix6::zeros();
    let i3 = Matrix3::<f64>::identity();
    q.fixed_view_mut::<3, 3>(0, 0).copy_from(&(i3 * (s2 * dt2 * dt2 / 4.0)));
    q.fixed_view_mut::<3, 3>(0, 3).copy_from(&(i3 * (s2 * dt2 * dt / 2.0)));
    q.fixed_view_mut::<3, 3>(3, 0).copy_from(&(i3 * (s2 * dt2 * dt / 2.0)));
    q.fixed_view_mut::<3, 3>(3, 3).copy_from(&(i3 * (s2 * dt2)));
    q
}

impl FusionFilter for KalmanFilter {
    fn algorithm(&self) -> FusionAlgorithm {
        FusionAlgorithm::Kalman
    }

    fn predict(&mut self, imu: &InertialSample, dt: f64) {
        if !(dt > 0.0) {
            return;
        }
        self.orientation = integrate_gyro(&self.orientation, &imu.gyroscope, dt);
        let accel = world_acceleration(&self.orientation, &imu.accelerometer, self.config.gravity);
        self.time_update(&accel, dt);
    }

    fn propagate(&mut self, dt: f64) {
        self.time_update(&Vector3::zeros(), dt);
    }

    #[allow(non_snake_case)]
    fn correct(&mut self, obs: &RangeObservation) -> CorrectionOutcome {
        let d = obs.direction.into_inner();
        let H = RowVector6::new(-d.x, -d.y, -d.z, 0.0, 0.0, 0.0);
        let R = obs.noise_variance;

        // y = z - H x
        let predicted = (H * self.state)[0];
        let innovation = obs.distance_m - predicted;

        // S = H P Hᵀ + R
        let PHt = self.covariance * H.transpose();
        let S = (H * PHt)[0] + R;
        if !(S.is_finite() && S > 0.0) {
            // Degraded covariance: heal and skip this measurement
            self.reset_covariance();
            return CorrectionOutcome { innovation, gain: 0.0 };
        }

        // K = P Hᵀ S⁻¹
        let K = PHt / S;
        self.state += K * innovation;

        // Joseph form: P = (I - K H) P (I - K H)ᵀ + K R Kᵀ
        let IKH = Matrix6::identity() - K * H;
        let P = IKH * self.covariance * IKH.transpose() + K * K.transpose() * R;
        self.covariance = (P + P.transpose()) * 0.5;

        CorrectionOutcome {
            innovation,
            gain: (H * K)[0],
        }
    }

    fn position(&self) -> Vector3<f64> {
        self.state.fixed_rows::<3>(0).into_owned()
    }

    fn velocity(&self) -> Vector3<f64> {
        self.state.fixed_rows::<3>(3).into_owned()
    }

    fn orientation(&self) -> UnitQuaternion<f64> {
        self.orientation
    }

    fn covariance(&self) -> Matrix6<f64> {
        self.covariance
    }

    fn box_clone(&self) -> Box<dyn FusionFilter> {
        Box::new(self.clone())
    }

    fn reset(&mut self) {
        self.state = Vector6::zeros();
        self.orientation = UnitQuaternion::identity();
        self.reset_covariance();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{Unit, Vector3};

    fn obs(distance: f64, variance: f64) -> RangeObservation {
        RangeObservation {
            distance_m: distance,
            direction: Vector3::x_axis(),
            confidence: 1.0,
            noise_variance: variance,
        }
    }

    #[test]
    fn test_prediction_integrates_acceleration() {
        let mut kf = KalmanFilter::new(FusionConfig::default());
        // 1 m/s² forward on top of gravity for 1 s
        let imu = InertialSample::new(1.0, Vector3::new(1.0, 0.0, 9.80665), Vector3::zeros());
        kf.predict(&imu, 1.0);

        assert_relative_eq!(kf.velocity().x, 1.0, epsilon = 1e-9);
        assert_relative_eq!(kf.position().x, 0.5, epsilon = 1e-9);
        assert_relative_eq!(kf.velocity().z, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_covariance_grows_on_propagate() {
        let mut kf = KalmanFilter::new(FusionConfig::default());
        let before = kf.covariance().trace();
        kf.propagate(0.1);
        assert!(kf.covariance().trace() > before);
    }

    #[test]
    fn test_update_shrinks_variance_along_ray_only() {
        let mut kf = KalmanFilter::new(FusionConfig::default());
        let outcome = kf.correct(&obs(2.0, 0.01));

        assert_relative_eq!(outcome.innovation, 2.0);
        assert!(outcome.gain > 0.99);
        assert_relative_eq!(kf.position().x, -2.0 * outcome.gain, epsilon = 1e-12);

        let p = kf.covariance();
        assert!(p[(0, 0)] < 0.011);
        assert_relative_eq!(p[(1, 1)], 25.0);
        assert_relative_eq!(p[(2, 2)], 25.0);
    }

    #[test]
    fn test_degraded_covariance_self_heals() {
        let mut kf = KalmanFilter::new(FusionConfig::default());
        kf.covariance[(0, 0)] = f64::NAN;

        let outcome = kf.correct(&obs(1.0, 0.01));
        assert_eq!(outcome.gain, 0.0);
        assert!(kf.covariance().iter().all(|v| v.is_finite()));
        assert_eq!(kf.position(), Vector3::zeros());
    }

    #[test]
    fn test_gyro_rotates_measurement_ray() {
        let mut kf = KalmanFilter::new(FusionConfig::default());
        let yaw_rate = std::f64::consts::FRAC_PI_2;
        let mut imu = InertialSample::stationary(1.0, 9.80665);
        imu.gyroscope = Vector3::new(0.0, 0.0, yaw_rate);
        kf.predict(&imu, 1.0);

        let forward = kf.orientation() * Vector3::x();
        assert_relative_eq!(forward, Vector3::y(), epsilon = 1e-9);

        let ray = Unit::new_normalize(forward);
        kf.correct(&RangeObservation {
            direction: ray,
            ..obs(1.0, 0.0001)
        });
        assert_relative_eq!(kf.position().y, -1.0, epsilon = 1e-3);
    }
}
