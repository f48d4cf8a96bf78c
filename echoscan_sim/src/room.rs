//! Ground truth for simulation.
//!
//! The Room is the "God's eye view" of a capture session:
//! - Geometry: an axis-aligned box (walls, floor, ceiling)
//! - Device pose over time (constant-velocity trajectory, fixed attitude)
//! - True ranges by ray casting, noisy inertial samples

use nalgebra::{Unit, UnitQuaternion, Vector3};
use rand::Rng;
use rand_distr::StandardNormal;

use echoscan_core::InertialSample;

/// Standard gravity (m/s²)
pub const GRAVITY: f64 = 9.80665;

/// Zero-mean Gaussian sample with the given standard deviation.
pub fn gaussian<R: Rng + ?Sized>(rng: &mut R, sigma: f64) -> f64 {
    let z: f64 = rng.sample(StandardNormal);
    z * sigma
}

/// Device motion: constant velocity for `moving_for_s`, then at rest.
#[derive(Debug, Clone, PartialEq)]
pub struct Trajectory {
    pub start: Vector3<f64>,
    pub velocity: Vector3<f64>,
    pub moving_for_s: f64,
    /// Body → world rotation (held constant)
    pub attitude: UnitQuaternion<f64>,
}

impl Trajectory {
    /// Device held still at `position`, level, boresight along world +X.
    pub fn stationary(position: Vector3<f64>) -> Self {
        Self {
            start: position,
            velocity: Vector3::zeros(),
            moving_for_s: 0.0,
            attitude: UnitQuaternion::identity(),
        }
    }

    /// Device walked from `start` along `velocity` for `duration_s`.
    pub fn linear(start: Vector3<f64>, velocity: Vector3<f64>, duration_s: f64) -> Self {
        Self {
            start,
            velocity,
            moving_for_s: duration_s.max(0.0),
            attitude: UnitQuaternion::identity(),
        }
    }

    pub fn position(&self, t: f64) -> Vector3<f64> {
        self.start + self.velocity * t.clamp(0.0, self.moving_for_s)
    }
}

/// Inertial sensor noise (one sigma).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuNoise {
    pub accel: f64,
    pub gyro: f64,
}

impl Default for ImuNoise {
    fn default() -> Self {
        Self {
            accel: 0.05,
            gyro: 0.002,
        }
    }
}

/// A box-shaped room with one device moving inside it.
#[derive(Debug, Clone)]
pub struct Room {
    /// Extent along x, y, z (meters); the box spans `[0, size]`
    pub size: Vector3<f64>,
    pub trajectory: Trajectory,
    pub imu_noise: ImuNoise,
}

impl Room {
    pub fn new(size: Vector3<f64>, trajectory: Trajectory) -> Self {
        Self {
            size,
            trajectory,
            imu_noise: ImuNoise::default(),
        }
    }

    /// 5 × 4 × 2.6 m room.
    pub fn standard(trajectory: Trajectory) -> Self {
        Self::new(Vector3::new(5.0, 4.0, 2.6), trajectory)
    }

    pub fn device_position(&self, t: f64) -> Vector3<f64> {
        self.trajectory.position(t)
    }

    /// Distance from the device to the first surface along a body-frame
    /// direction. `None` if the device is outside the room.
    pub fn true_range(&self, t: f64, direction_body: &Unit<Vector3<f64>>) -> Option<f64> {
        let origin = self.device_position(t);
        let direction = self.trajectory.attitude * direction_body.into_inner();
        self.cast(&origin, &direction)
    }

    /// Ray/box exit distance for an origin inside the box.
    pub fn cast(&self, origin: &Vector3<f64>, direction: &Vector3<f64>) -> Option<f64> {
        let inside = (0..3).all(|i| origin[i] >= 0.0 && origin[i] <= self.size[i]);
        if !inside {
            return None;
        }

        (0..3)
            .filter(|&i| direction[i].abs() > 1e-12)
            .map(|i| {
                let wall = if direction[i] > 0.0 { self.size[i] } else { 0.0 };
                (wall - origin[i]) / direction[i]
            })
            .filter(|t| *t >= 0.0)
            .min_by(|a, b| a.total_cmp(b))
    }

    /// What the device's IMU reads at time `t`.
    ///
    /// Motion is piecewise constant-velocity, so the specific force is
    /// gravity alone (rotated into the body frame) plus noise.
    pub fn inertial_sample<R: Rng + ?Sized>(&self, t: f64, rng: &mut R) -> InertialSample {
        let up = self.trajectory.attitude.inverse() * Vector3::new(0.0, 0.0, GRAVITY);
        let n = self.imu_noise;
        let accel = up + Vector3::new(gaussian(rng, n.accel), gaussian(rng, n.accel), gaussian(rng, n.accel));
        let gyro = Vector3::new(gaussian(rng, n.gyro), gaussian(rng, n.gyro), gaussian(rng, n.gyro));
        InertialSample::new(t, accel, gyro)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_cast_hits_nearest_wall() {
        let room = Room::standard(Trajectory::stationary(Vector3::new(2.5, 2.0, 1.2)));
        assert_eq!(room.true_range(0.0, &Vector3::x_axis()), Some(2.5));
        assert_eq!(room.true_range(0.0, &Unit::new_normalize(-Vector3::y())), Some(2.0));

        let diagonal = Unit::new_normalize(Vector3::new(1.0, 1.0, 0.0));
        let hit = room.true_range(0.0, &diagonal).unwrap();
        assert!((hit - 2.0 * 2f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn test_outside_room_has_no_range() {
        let room = Room::standard(Trajectory::stationary(Vector3::new(-1.0, 2.0, 1.2)));
        assert_eq!(room.true_range(0.0, &Vector3::x_axis()), None);
    }

    #[test]
    fn test_linear_trajectory_stops() {
        let traj = Trajectory::linear(Vector3::new(2.0, 2.0, 1.0), Vector3::new(0.5, 0.0, 0.0), 2.0);
        assert_eq!(traj.position(1.0).x, 2.5);
        assert_eq!(traj.position(10.0).x, 3.0);
    }

    #[test]
    fn test_inertial_sample_reads_gravity() {
        let room = Room::standard(Trajectory::stationary(Vector3::new(1.0, 1.0, 1.0)));
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let imu = room.inertial_sample(0.5, &mut rng);
        assert_eq!(imu.timestamp, 0.5);
        assert!((imu.accelerometer.z - GRAVITY).abs() < 0.5);
        assert!(imu.gyroscope.norm() < 0.05);
    }

    proptest! {
        #[test]
        fn prop_cast_stays_inside_room(
            x in 0.1f64..4.9, y in 0.1f64..3.9, z in 0.1f64..2.5,
            dx in -1.0f64..1.0, dy in -1.0f64..1.0, dz in -1.0f64..1.0,
        ) {
            prop_assume!(dx * dx + dy * dy + dz * dz > 1e-3);
            let room = Room::standard(Trajectory::stationary(Vector3::new(x, y, z)));
            let direction = Unit::new_normalize(Vector3::new(dx, dy, dz));
            let range = room.true_range(0.0, &direction).unwrap();

            prop_assert!(range >= 0.0);
            prop_assert!(range <= room.size.norm() + 1e-9);
            let hit = Vector3::new(x, y, z) + direction.into_inner() * range;
            for i in 0..3 {
                prop_assert!(hit[i] >= -1e-9 && hit[i] <= room.size[i] + 1e-9);
            }
        }
    }
}
