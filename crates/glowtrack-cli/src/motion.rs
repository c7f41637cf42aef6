//! Synthetic controller motion driving the simulated hardware.
//!
//! Each simulated controller circles a point in front of the cameras while
//! yawing at a constant rate.  The IMU readings are generated from the same
//! trajectory, so a correctly working filter reproduces it.

use std::f32::consts::TAU;

use glowtrack_hal::controller::ImuSample;
use nalgebra::{UnitQuaternion, Vector3};

/// World-frame gravity as the accelerometer reports it at rest (g).
fn gravity() -> Vector3<f32> {
    Vector3::new(0.0, 1.0, 0.0)
}

/// World-frame magnetic field direction.
fn magnetic_north() -> Vector3<f32> {
    Vector3::new(0.0, -0.5, -0.866)
}

#[derive(Debug, Clone, Copy)]
pub struct Orbit {
    /// cm, tracking space.
    pub center: Vector3<f32>,
    /// cm
    pub radius: f32,
    /// Seconds per revolution.
    pub period: f32,
    /// rad/s about the world Y axis.
    pub yaw_rate: f32,
}

impl Orbit {
    /// A distinct orbit per controller so they do not overlap on camera.
    pub fn for_controller(index: usize) -> Self {
        let offset = index as f32;
        Self {
            center: Vector3::new(-30.0 + 30.0 * offset, 0.0, 150.0),
            radius: 10.0,
            period: 4.0 + offset,
            yaw_rate: 0.5,
        }
    }

    pub fn position(&self, t: f32) -> Vector3<f32> {
        let phase = TAU * t / self.period;
        self.center + Vector3::new(phase.cos(), phase.sin(), 0.0) * self.radius
    }

    pub fn orientation(&self, t: f32) -> UnitQuaternion<f32> {
        UnitQuaternion::from_axis_angle(&Vector3::y_axis(), self.yaw_rate * t)
    }

    /// What an ideal IMU riding the orbit reads at `t`.  Linear acceleration
    /// is left out, as if the controller were moving slowly.
    pub fn imu_sample(&self, t: f32) -> ImuSample {
        let orientation = self.orientation(t);
        ImuSample {
            accelerometer: orientation.inverse_transform_vector(&gravity()),
            magnetometer: orientation.inverse_transform_vector(&magnetic_north()),
            gyroscope: orientation.inverse_transform_vector(&Vector3::new(0.0, self.yaw_rate, 0.0)),
        }
    }
}
