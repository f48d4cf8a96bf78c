//! Madgwick strategy - gradient-descent orientation filter.
//!
//! Each step integrates the gyroscope and subtracts `β` times the
//! normalised gradient of the orientation error against gravity (IMU
//! form) or gravity plus the magnetic field (MARG form):
//!
//! ```text
//! q̇ = ½ q ⊗ (0, ω) − β · ∇f / ‖∇f‖
//! ```
//!
//! Orientation only: translation stays where it was reset and range
//! corrections report zero gain.

use nalgebra::{Matrix6, Quaternion, UnitQuaternion, Vector3, Vector4};

use super::{CorrectionOutcome, FusionAlgorithm, FusionConfig, FusionFilter, RangeObservation};
use crate::types::InertialSample;

#[derive(Debug, Clone)]
pub struct MadgwickFilter {
    config: FusionConfig,
    /// (w, x, y, z)
    q: Vector4<f64>,
    position: Vector3<f64>,
}

impl MadgwickFilter {
    pub fn new(config: FusionConfig) -> Self {
        Self {
            config,
            q: Vector4::new(1.0, 0.0, 0.0, 0.0),
            position: Vector3::zeros(),
        }
    }

    pub fn beta(&self) -> f64 {
        self.config.madgwick_beta
    }

    /// Gradient of the gravity objective, `Jᵀ f`.
    fn imu_gradient(q: &Vector4<f64>, a: &Vector3<f64>) -> Vector4<f64> {
        let (q0, q1, q2, q3) = (q[0], q[1], q[2], q[3]);
        let f = Vector3::new(
            2.0 * (q1 * q3 - q0 * q2) - a.x,
            2.0 * (q0 * q1 + q2 * q3) - a.y,
            2.0 * (0.5 - q1 * q1 - q2 * q2) - a.z,
        );
        Vector4::new(
            -2.0 * q2 * f.x + 2.0 * q1 * f.y,
            2.0 * q3 * f.x + 2.0 * q0 * f.y - 4.0 * q1 * f.z,
            -2.0 * q0 * f.x + 2.0 * q3 * f.y - 4.0 * q2 * f.z,
            2.0 * q1 * f.x + 2.0 * q2 * f.y,
        )
    }

    /// Gradient of the gravity + magnetic field objective.
    ///
    /// The field reference `b = (bx, 0, bz)` is re-derived every step from
    /// the measured field rotated into the world frame.
    fn marg_gradient(q: &Vector4<f64>, a: &Vector3<f64>, m: &Vector3<f64>) -> Vector4<f64> {
        let (q0, q1, q2, q3) = (q[0], q[1], q[2], q[3]);
        let (mx, my, mz) = (m.x, m.y, m.z);

        let q0q0 = q0 * q0;
        let q0q1 = q0 * q1;
        let q0q2 = q0 * q2;
        let q0q3 = q0 * q3;
        let q1q1 = q1 * q1;
        let q1q2 = q1 * q2;
        let q1q3 = q1 * q3;
        let q2q2 = q2 * q2;
        let q2q3 = q2 * q3;
        let q3q3 = q3 * q3;

        // Earth-frame field direction
        let hx = mx * (q0q0 + q1q1 - q2q2 - q3q3) + 2.0 * my * (q1q2 - q0q3) + 2.0 * mz * (q0q2 + q1q3);
        let hy = 2.0 * mx * (q0q3 + q1q2) + my * (q0q0 - q1q1 + q2q2 - q3q3) + 2.0 * mz * (q2q3 - q0q1);
        let hz = 2.0 * mx * (q1q3 - q0q2) + 2.0 * my * (q0q1 + q2q3) + mz * (q0q0 - q1q1 - q2q2 + q3q3);
        let bx = (hx * hx + hy * hy).sqrt();
        let bz = hz;

        // Objective: gravity rows then field rows
        let f = [
            2.0 * (q1q3 - q0q2) - a.x,
            2.0 * (q0q1 + q2q3) - a.y,
            2.0 * (0.5 - q1q1 - q2q2) - a.z,
            2.0 * bx * (0.5 - q2q2 - q3q3) + 2.0 * bz * (q1q3 - q0q2) - mx,
            2.0 * bx * (q1q2 - q0q3) + 2.0 * bz * (q0q1 + q2q3) - my,
            2.0 * bx * (q0q2 + q1q3) + 2.0 * bz * (0.5 - q1q1 - q2q2) - mz,
        ];

        // Jacobian of f with respect to (q0, q1, q2, q3)
        let j = [
            [-2.0 * q2, 2.0 * q3, -2.0 * q0, 2.0 * q1],
            [2.0 * q1, 2.0 * q0, 2.0 * q3, 2.0 * q2],
            [0.0, -4.0 * q1, -4.0 * q2, 0.0],
            [
                -2.0 * bz * q2,
                2.0 * bz * q3,
                -4.0 * bx * q2 - 2.0 * bz * q0,
                -4.0 * bx * q3 + 2.0 * bz * q1,
            ],
            [
                -2.0 * bx * q3 + 2.0 * bz * q1,
                2.0 * bx * q2 + 2.0 * bz * q0,
                2.0 * bx * q1 + 2.0 * bz * q3,
                -2.0 * bx * q0 + 2.0 * bz * q2,
            ],
            [
                2.0 * bx * q2,
                2.0 * bx * q3 - 4.0 * bz * q1,
                2.0 * bx * q0 - 4.0 * bz * q2,
                2.0 * bx * q1,
            ],
        ];

        let mut grad = Vector4::zeros();
        for (row, fi) in j.iter().zip(f.iter()) {
            for c in 0..4 {
                grad[c] += row[c] * fi;
            }
        }
        grad
    }

    fn step(&mut self, imu: &InertialSample, dt: f64) {
        let q = self.q;
        let (q0, q1, q2, q3) = (q[0], q[1], q[2], q[3]);
        let w = imu.gyroscope;

        // ½ q ⊗ (0, ω)
        let mut q_dot = 0.5
            * Vector4::new(
                -q1 * w.x - q2 * w.y - q3 * w.z,
                q0 * w.x + q2 * w.z - q3 * w.y,
                q0 * w.y - q1 * w.z + q3 * w.x,
                q0 * w.z + q1 * w.y - q2 * w.x,
            );

        if let Some(a) = imu.accelerometer.try_normalize(1e-12) {
            let gradient = match imu.magnetometer.and_then(|m| m.try_normalize(1e-12)) {
                Some(m) => Self::marg_gradient(&q, &a, &m),
                None => Self::imu_gradient(&q, &a),
            };
            if let Some(step) = gradient.try_normalize(1e-12) {
                q_dot -= step * self.config.madgwick_beta;
            }
        }

        let next = q + q_dot * dt;
        let norm = next.norm();
        // A degenerate quaternion is passed through so the estimator sees it
        self.q = if norm > 0.0 { next / norm } else { next };
    }
}

impl FusionFilter for MadgwickFilter {
    fn algorithm(&self) -> FusionAlgorithm {
        FusionAlgorithm::Madgwick
    }

    fn predict(&mut self, imu: &InertialSample, dt: f64) {
        if dt > 0.0 {
            self.step(imu, dt);
        }
    }

    fn propagate(&mut self, _dt: f64) {}

    fn correct(&mut self, obs: &RangeObservation) -> CorrectionOutcome {
        CorrectionOutcome {
            innovation: obs.distance_m - obs.predicted(&self.position),
            gain: 0.0,
        }
    }

    fn position(&self) -> Vector3<f64> {
        self.position
    }

    fn velocity(&self) -> Vector3<f64> {
        Vector3::zeros()
    }

    fn orientation(&self) -> UnitQuaternion<f64> {
        UnitQuaternion::new_unchecked(Quaternion::new(self.q[0], self.q[1], self.q[2], self.q[3]))
    }

    fn covariance(&self) -> Matrix6<f64> {
        self.config.initial_covariance()
    }

    fn box_clone(&self) -> Box<dyn FusionFilter> {
        Box::new(self.clone())
    }

    fn reset(&mut self) {
        self.q = Vector4::new(1.0, 0.0, 0.0, 0.0);
        self.position = Vector3::zeros();
    }
}
