//! Madgwick gradient-descent AHRS step (ARG and MARG variants) with gyro bias
//! drift compensation.
//!
//! Each reference direction `d` yields an objective `f(q) = q* ⊗ d ⊗ q − s`,
//! the mismatch between where the reference should appear in the sensor frame
//! and where the sensor measured it (`s`).  The normalized gradient `Jᵀf` is
//! the direction in which the orientation error grows; the step subtracts it,
//! scaled by β, from the gyroscope quaternion derivative.

use nalgebra::{Matrix3x4, Quaternion, UnitQuaternion, Vector3};

use super::{FusionState, Gains, Step, renormalize};
use crate::filter_space::{FilterPacket, FilterSpace, is_absent};

pub(crate) fn step(
    state: &mut FusionState,
    space: &FilterSpace,
    packet: &FilterPacket,
    dt: f32,
    gains: Gains,
    use_magnetometer: bool,
) -> Step {
    let q = state.orientation;

    let mut gradient = Quaternion::new(0.0, 0.0, 0.0, 0.0);
    let gravity = space.gravity_calibration_direction();
    let accel = packet.normalized_accelerometer;
    if !is_absent(&accel) && !is_absent(&gravity) {
        gradient += objective_gradient(q, gravity, accel);
    }
    if use_magnetometer {
        let north = space.magnetometer_calibration_direction();
        let mag = packet.normalized_magnetometer;
        if !is_absent(&mag) && !is_absent(&north) {
            gradient += objective_gradient(q, north, mag);
        }
    }

    let gradient_norm = gradient.norm();
    let correction = if gradient_norm.is_finite() && gradient_norm > f32::EPSILON {
        let q_err_dot = gradient / gradient_norm;
        // Rate of the error expressed in the sensor frame feeds the bias.
        let error_rate = (q.quaternion().conjugate() * q_err_dot * 2.0).imag();
        state.gyro_bias += error_rate * (dt * gains.zeta);
        q_err_dot
    } else {
        Quaternion::new(0.0, 0.0, 0.0, 0.0)
    };

    let body_rate = packet.gyroscope - state.gyro_bias;
    let q_dot = q.quaternion() * Quaternion::from_imag(body_rate) * 0.5 - correction * gains.beta;

    Step {
        orientation: renormalize(q.quaternion() + q_dot * dt, q),
        body_rate,
    }
}

/// `Jᵀ f` for reference `d` and unit measurement `s`, as a quaternion
/// `(w, x, y, z)`.
fn objective_gradient(q: UnitQuaternion<f32>, d: Vector3<f32>, s: Vector3<f32>) -> Quaternion<f32> {
    let f = q.inverse_transform_vector(&d) - s;

    let (q1, q2, q3, q4) = (q.w, q.i, q.j, q.k);
    let (dx, dy, dz) = (d.x, d.y, d.z);

    #[rustfmt::skip]
    let jacobian = Matrix3x4::new(
        2.0 * dy * q4 - 2.0 * dz * q3,
        2.0 * dy * q3 + 2.0 * dz * q4,
        -4.0 * dx * q3 + 2.0 * dy * q2 - 2.0 * dz * q1,
        -4.0 * dx * q4 + 2.0 * dy * q1 + 2.0 * dz * q2,

        -2.0 * dx * q4 + 2.0 * dz * q2,
        2.0 * dx * q3 - 4.0 * dy * q2 + 2.0 * dz * q1,
        2.0 * dx * q2 + 2.0 * dz * q4,
        -2.0 * dx * q1 - 4.0 * dy * q4 + 2.0 * dz * q3,

        2.0 * dx * q3 - 2.0 * dy * q2,
        2.0 * dx * q4 - 2.0 * dy * q1 - 4.0 * dz * q2,
        2.0 * dx * q1 + 2.0 * dy * q4 - 4.0 * dz * q3,
        2.0 * dx * q2 + 2.0 * dy * q3,
    );

    let g = jacobian.transpose() * f;
    Quaternion::new(g[0], g[1], g[2], g[3])
}
