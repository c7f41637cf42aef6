//! Complementary strategies: integrate the gyroscope, then pull the result a
//! fraction of the way toward an absolute attitude.
//!
//! * [`optical_step`] pulls toward the optical orientation hint, weighted by
//!   the hint's quality.
//! * [`marg_step`] pulls toward the attitude solved from the accelerometer
//!   and magnetometer (TRIAD), or toward gravity alone when no usable
//!   magnetic reading exists.
//!
//! Both nudge the gyroscope bias by the body-frame rotation the blend
//! applied.

use nalgebra::{Matrix3, Rotation3, UnitQuaternion, Vector3};

use super::{FusionState, Gains, Step, blend, integrate_body_rate};
use crate::filter_space::{FilterPacket, FilterSpace, OrientationSource, is_absent, normalize_or_zero};

/// Fraction of the way toward the accel/mag attitude taken per update.
pub const COMPLEMENTARY_MARG_BLEND: f32 = 0.02;

pub(crate) fn optical_step(state: &mut FusionState, packet: &FilterPacket, dt: f32, gains: Gains) -> Step {
    let body_rate = packet.gyroscope - state.gyro_bias;
    let predicted = integrate_body_rate(state.orientation, body_rate, dt);

    let quality = packet.orientation_quality;
    let orientation = if packet.orientation_source == OrientationSource::Optical && quality > 0.0 {
        let blended = blend(predicted, packet.orientation, quality.clamp(0.0, 1.0));
        correct_bias(state, predicted, blended, gains);
        blended
    } else {
        predicted
    };

    Step { orientation, body_rate }
}

pub(crate) fn marg_step(
    state: &mut FusionState,
    space: &FilterSpace,
    packet: &FilterPacket,
    dt: f32,
    gains: Gains,
) -> Step {
    let body_rate = packet.gyroscope - state.gyro_bias;
    let predicted = integrate_body_rate(state.orientation, body_rate, dt);

    let orientation = match accel_mag_attitude(space, packet, predicted) {
        Some(target) => {
            let blended = blend(predicted, target, COMPLEMENTARY_MARG_BLEND);
            correct_bias(state, predicted, blended, gains);
            blended
        }
        None => predicted,
    };

    Step { orientation, body_rate }
}

/// The bias absorbs the body-frame rotation the blend had to add on top of
/// the gyro prediction.
fn correct_bias(
    state: &mut FusionState,
    predicted: UnitQuaternion<f32>,
    blended: UnitQuaternion<f32>,
    gains: Gains,
) {
    let correction = (predicted.inverse() * blended).scaled_axis();
    state.gyro_bias -= correction * gains.zeta;
}

/// Absolute attitude implied by the accelerometer (and magnetometer when
/// available).  `None` when there is no gravity reading to work with.
fn accel_mag_attitude(
    space: &FilterSpace,
    packet: &FilterPacket,
    predicted: UnitQuaternion<f32>,
) -> Option<UnitQuaternion<f32>> {
    let accel = packet.normalized_accelerometer;
    let gravity = space.gravity_calibration_direction();
    if is_absent(&accel) || is_absent(&gravity) {
        return None;
    }

    let mag = packet.normalized_magnetometer;
    let north = space.magnetometer_calibration_direction();
    if !is_absent(&mag) && !is_absent(&north) {
        if let Some(attitude) = triad(accel, mag, gravity, north) {
            return Some(attitude);
        }
    }

    // Tilt only: rotate the prediction until the measured gravity lines up.
    let correction = UnitQuaternion::rotation_between(&predicted.transform_vector(&accel), &gravity)?;
    Some(correction * predicted)
}

/// TRIAD: the rotation taking the body triad (a, m) onto the reference
/// triad (g, n).  `None` when either pair is parallel.
fn triad(
    accel: Vector3<f32>,
    mag: Vector3<f32>,
    gravity: Vector3<f32>,
    north: Vector3<f32>,
) -> Option<UnitQuaternion<f32>> {
    let t2 = normalize_or_zero(accel.cross(&mag));
    let r2 = normalize_or_zero(gravity.cross(&north));
    if is_absent(&t2) || is_absent(&r2) {
        return None;
    }
    let body = Matrix3::from_columns(&[accel, t2, accel.cross(&t2)]);
    let reference = Matrix3::from_columns(&[gravity, r2, gravity.cross(&r2)]);
    let rotation = Rotation3::from_matrix_unchecked(reference * body.transpose());
    Some(UnitQuaternion::from_rotation_matrix(&rotation))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter_space::{CalibrationPose, SensorPacket, SensorTransform};
    use crate::orientation::{FusionType, OrientationFilter};
    use approx::assert_relative_eq;

    fn space_with_north() -> FilterSpace {
        FilterSpace::new(
            Vector3::y(),
            Vector3::new(0.0, -0.5, -0.866),
            CalibrationPose::Upright,
            SensorTransform::Identity,
        )
    }

    fn stationary_packet(truth: UnitQuaternion<f32>, space: &FilterSpace) -> SensorPacket {
        SensorPacket {
            accelerometer: truth.inverse_transform_vector(&space.gravity_calibration_direction()) * 9.81,
            magnetometer: truth.inverse_transform_vector(&space.magnetometer_calibration_direction()) * 0.4,
            ..SensorPacket::default()
        }
    }

    fn optical(hint: UnitQuaternion<f32>, quality: f32, gyro: Vector3<f32>) -> SensorPacket {
        SensorPacket {
            orientation: hint,
            orientation_source: OrientationSource::Optical,
            orientation_quality: quality,
            gyroscope: gyro,
            ..SensorPacket::default()
        }
    }

    #[test]
    fn triad_recovers_known_attitude() {
        let space = space_with_north();
        let truth = UnitQuaternion::from_euler_angles(0.3, 1.1, -0.4);
        let a = truth.inverse_transform_vector(&space.gravity_calibration_direction());
        let m = truth.inverse_transform_vector(&space.magnetometer_calibration_direction());
        let solved = triad(
            a,
            m,
            space.gravity_calibration_direction(),
            space.magnetometer_calibration_direction(),
        )
        .unwrap();
        assert_relative_eq!(solved.angle_to(&truth), 0.0, epsilon = 2e-3);
    }

    #[test]
    fn triad_rejects_parallel_readings() {
        assert!(triad(Vector3::y(), Vector3::y(), Vector3::y(), -Vector3::z()).is_none());
    }

    #[test]
    fn full_quality_hint_is_adopted() {
        let mut filter = OrientationFilter::new(space_with_north(), FusionType::ComplementaryOpticalArg);
        let hint = UnitQuaternion::from_euler_angles(0.2, 0.4, -0.1);
        filter.update(0.01, &optical(hint, 1.0, Vector3::new(1.0, 0.0, 0.0)));
        assert_eq!(filter.orientation(0.0), hint);
    }

    #[test]
    fn zero_quality_hint_is_ignored() {
        let gyro = Vector3::new(0.0, 0.0, 1.0);
        let mut filter = OrientationFilter::new(space_with_north(), FusionType::ComplementaryOpticalArg);
        filter.update(0.01, &optical(UnitQuaternion::from_euler_angles(1.0, 0.0, 0.0), 0.0, gyro));
        let expected = integrate_body_rate(UnitQuaternion::identity(), gyro, 0.01);
        assert_relative_eq!(filter.orientation(0.0).angle_to(&expected), 0.0, epsilon = 2e-3);
    }

    #[test]
    fn previous_frame_hint_is_ignored() {
        let mut filter = OrientationFilter::new(space_with_north(), FusionType::ComplementaryOpticalArg);
        let packet = SensorPacket {
            orientation: UnitQuaternion::from_euler_angles(1.0, 0.0, 0.0),
            orientation_source: OrientationSource::PreviousFrame,
            orientation_quality: 1.0,
            ..SensorPacket::default()
        };
        filter.update(0.01, &packet);
        assert_relative_eq!(filter.orientation(0.0).angle(), 0.0, epsilon = 2e-3);
    }

    #[test]
    fn partial_quality_moves_partway() {
        let mut filter = OrientationFilter::new(space_with_north(), FusionType::ComplementaryOpticalArg);
        let hint = UnitQuaternion::from_axis_angle(&Vector3::z_axis(), 1.0);
        filter.update(0.01, &optical(hint, 0.25, Vector3::zeros()));
        assert_relative_eq!(filter.orientation(0.0).angle(), 0.25, epsilon = 1e-4);
    }

    #[test]
    fn optical_bias_absorbs_gyro_offset() {
        let mut filter = OrientationFilter::new(space_with_north(), FusionType::ComplementaryOpticalArg);
        filter.set_gyroscope_drift(0.05);
        // The controller is still; the gyro reads a constant +X rate.
        let packet = optical(UnitQuaternion::identity(), 0.5, Vector3::new(0.1, 0.0, 0.0));
        for _ in 0..2000 {
            filter.update(0.01, &packet);
        }
        assert!(filter.gyro_bias().x > 0.0, "bias {:?}", filter.gyro_bias());
    }

    #[test]
    fn marg_converges_to_accel_mag_attitude() {
        let space = space_with_north();
        let truth = UnitQuaternion::from_euler_angles(0.2, 0.8, 0.1);
        let mut filter = OrientationFilter::new(space.clone(), FusionType::ComplementaryMarg);
        filter.set_gyroscope_drift(0.0);
        let packet = stationary_packet(truth, &space);
        for _ in 0..1000 {
            filter.update(0.01, &packet);
        }
        assert_relative_eq!(filter.orientation(0.0).angle_to(&truth), 0.0, epsilon = 2e-3);
    }

    #[test]
    fn marg_without_magnetometer_corrects_tilt_only() {
        let space = FilterSpace::default();
        let mut filter = OrientationFilter::new(space.clone(), FusionType::ComplementaryMarg);
        filter.set_gyroscope_drift(0.0);
        let yaw = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), 0.7);
        let tilt = UnitQuaternion::from_axis_angle(&Vector3::x_axis(), 0.4);
        filter.reset_orientation(yaw * tilt);

        let packet = stationary_packet(UnitQuaternion::identity(), &space);
        for _ in 0..1000 {
            filter.update(0.01, &packet);
        }
        let q = filter.orientation(0.0);
        // Gravity is aligned again.
        assert_relative_eq!(q.transform_vector(&Vector3::y()), Vector3::y(), epsilon = 1e-3);
        // Heading was never observable.
        assert!(q.angle() > 0.5, "heading collapsed to {}", q.angle());
    }

    #[test]
    fn marg_without_accelerometer_is_pure_gyro() {
        let gyro = Vector3::new(0.2, 0.1, -0.3);
        let mut filter = OrientationFilter::new(space_with_north(), FusionType::ComplementaryMarg);
        let packet = SensorPacket {
            magnetometer: Vector3::new(0.0, -0.5, -0.866),
            gyroscope: gyro,
            ..SensorPacket::default()
        };
        let mut expected = UnitQuaternion::identity();
        for _ in 0..20 {
            filter.update(0.01, &packet);
            expected = integrate_body_rate(expected, gyro, 0.01);
        }
        assert_relative_eq!(filter.orientation(0.0).angle_to(&expected), 0.0, epsilon = 2e-3);
        assert_eq!(filter.gyro_bias(), Vector3::zeros());
    }
}
