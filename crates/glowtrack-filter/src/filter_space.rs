//! Filter space: turns raw IMU readings into the canonical frame the
//! orientation filter works in.
//!
//! Two transforms are applied to every raw vector, in order:
//!
//! 1. the **sensor transform**, which remaps the chip's axes onto the
//!    service's axis convention, and
//! 2. the **calibration transform**, which accounts for the pose the
//!    controller was held in while its reference vectors were recorded
//!    (upright or laying flat).
//!
//! Accelerometer and magnetometer are then normalized.  A reading too short
//! to normalize is passed on as the zero vector, which downstream code reads
//! as "no correction available this frame".
//!
//! # Example
//!
//! ```rust
//! use glowtrack_filter::filter_space::{CalibrationPose, FilterSpace, SensorPacket, SensorTransform};
//! use nalgebra::Vector3;
//!
//! let space = FilterSpace::new(
//!     Vector3::new(0.0, 1.0, 0.0),
//!     Vector3::zeros(),
//!     CalibrationPose::Upright,
//!     SensorTransform::Identity,
//! );
//!
//! let mut packet = SensorPacket::default();
//! packet.accelerometer = Vector3::new(0.0, 9.81, 0.0);
//!
//! let out = space.convert(&packet);
//! assert!((out.normalized_accelerometer.y - 1.0).abs() < 1e-6);
//! assert_eq!(out.normalized_magnetometer, Vector3::zeros());
//! ```

use nalgebra::{Matrix3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

/// Vectors shorter than this are treated as absent rather than normalized.
pub const DEGENERATE_EPSILON: f32 = 1e-6;

// ────────────────────────────────────────────────────────────────────────────
// Packets
// ────────────────────────────────────────────────────────────────────────────

/// Where the orientation hint carried by a packet came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OrientationSource {
    /// The filter's own output from the previous frame (no new information).
    #[default]
    PreviousFrame,
    /// An orientation resolved independently by the optical trackers.
    Optical,
}

/// One frame of raw IMU data plus an absolute orientation hint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorPacket {
    pub orientation: UnitQuaternion<f32>,
    pub orientation_source: OrientationSource,
    /// Confidence in `orientation`, in `[0, 1]`.
    pub orientation_quality: f32,
    pub accelerometer: Vector3<f32>,
    pub magnetometer: Vector3<f32>,
    /// rad/s, sensor frame.
    pub gyroscope: Vector3<f32>,
}

impl Default for SensorPacket {
    fn default() -> Self {
        Self {
            orientation: UnitQuaternion::identity(),
            orientation_source: OrientationSource::PreviousFrame,
            orientation_quality: 0.0,
            accelerometer: Vector3::zeros(),
            magnetometer: Vector3::zeros(),
            gyroscope: Vector3::zeros(),
        }
    }
}

/// A [`SensorPacket`] expressed in filter space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterPacket {
    pub orientation: UnitQuaternion<f32>,
    pub orientation_source: OrientationSource,
    pub orientation_quality: f32,
    /// Unit length, or zero when the raw reading was degenerate.
    pub normalized_accelerometer: Vector3<f32>,
    /// Unit length, or zero when the raw reading was degenerate.
    pub normalized_magnetometer: Vector3<f32>,
    pub gyroscope: Vector3<f32>,
}

// ────────────────────────────────────────────────────────────────────────────
// Named transforms
// ────────────────────────────────────────────────────────────────────────────

/// The pose the controller was held in while its reference vectors were
/// recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationPose {
    /// Held vertically, bulb up.  Identity transform.
    #[default]
    Upright,
    /// Lying on its back on a table.  Rotates +90° about X so the flat
    /// reading lines up with the upright convention.
    LayingFlat,
}

impl CalibrationPose {
    pub fn transform(self) -> Matrix3<f32> {
        match self {
            CalibrationPose::Upright => Matrix3::identity(),
            CalibrationPose::LayingFlat => Matrix3::new(
                1.0, 0.0, 0.0, //
                0.0, 0.0, -1.0, //
                0.0, 1.0, 0.0,
            ),
        }
    }
}

/// Remaps sensor chip axes onto the service's axis convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorTransform {
    #[default]
    Identity,
    /// Chip Z-up to OpenGL Y-up: `(x, y, z) → (x, z, -y)`.
    OpenGl,
}

impl SensorTransform {
    pub fn transform(self) -> Matrix3<f32> {
        match self {
            SensorTransform::Identity => Matrix3::identity(),
            SensorTransform::OpenGl => Matrix3::new(
                1.0, 0.0, 0.0, //
                0.0, 0.0, 1.0, //
                0.0, -1.0, 0.0,
            ),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// FilterSpace
// ────────────────────────────────────────────────────────────────────────────

/// Reference vectors plus the two transforms that map raw readings into the
/// orientation filter's frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterSpace {
    identity_gravity: Vector3<f32>,
    identity_magnetometer: Vector3<f32>,
    calibration_transform: Matrix3<f32>,
    sensor_transform: Matrix3<f32>,
}

impl FilterSpace {
    /// Build a filter space.
    ///
    /// `identity_gravity` and `identity_magnetometer` are the accelerometer and
    /// magnetometer directions observed, in filter space, while the controller
    /// sits in its identity pose.  They are normalized here; a zero vector
    /// disables the correction term that would steer toward it.
    pub fn new(
        identity_gravity: Vector3<f32>,
        identity_magnetometer: Vector3<f32>,
        calibration_pose: CalibrationPose,
        sensor_transform: SensorTransform,
    ) -> Self {
        Self::from_matrices(
            identity_gravity,
            identity_magnetometer,
            calibration_pose.transform(),
            sensor_transform.transform(),
        )
    }

    /// Same as [`FilterSpace::new`] with arbitrary transform matrices.
    pub fn from_matrices(
        identity_gravity: Vector3<f32>,
        identity_magnetometer: Vector3<f32>,
        calibration_transform: Matrix3<f32>,
        sensor_transform: Matrix3<f32>,
    ) -> Self {
        Self {
            identity_gravity: normalize_or_zero(identity_gravity),
            identity_magnetometer: normalize_or_zero(identity_magnetometer),
            calibration_transform,
            sensor_transform,
        }
    }

    /// Reference direction the gravity correction steers toward.
    pub fn gravity_calibration_direction(&self) -> Vector3<f32> {
        self.identity_gravity
    }

    /// Reference direction the magnetic correction steers toward.
    pub fn magnetometer_calibration_direction(&self) -> Vector3<f32> {
        self.identity_magnetometer
    }

    pub fn set_calibration_transform(&mut self, calibration_transform: Matrix3<f32>) {
        self.calibration_transform = calibration_transform;
    }

    pub fn set_sensor_transform(&mut self, sensor_transform: Matrix3<f32>) {
        self.sensor_transform = sensor_transform;
    }

    /// Map a raw packet into filter space.
    ///
    /// The orientation hint, its source and its quality pass through
    /// untouched.
    pub fn convert(&self, packet: &SensorPacket) -> FilterPacket {
        FilterPacket {
            orientation: packet.orientation,
            orientation_source: packet.orientation_source,
            orientation_quality: packet.orientation_quality,
            normalized_accelerometer: normalize_or_zero(self.to_filter_space(packet.accelerometer)),
            normalized_magnetometer: normalize_or_zero(self.to_filter_space(packet.magnetometer)),
            gyroscope: self.to_filter_space(packet.gyroscope),
        }
    }

    fn to_filter_space(&self, v: Vector3<f32>) -> Vector3<f32> {
        self.calibration_transform * (self.sensor_transform * v)
    }
}

impl Default for FilterSpace {
    /// Upright calibration, identity sensor axes, gravity along +Y and no
    /// magnetometer reference.
    fn default() -> Self {
        Self::new(
            Vector3::y(),
            Vector3::zeros(),
            CalibrationPose::Upright,
            SensorTransform::Identity,
        )
    }
}

/// Normalize `v`, or return zero when it is too short (or not finite).
pub fn normalize_or_zero(v: Vector3<f32>) -> Vector3<f32> {
    let norm = v.norm();
    if norm.is_finite() && norm > DEGENERATE_EPSILON {
        v / norm
    } else {
        Vector3::zeros()
    }
}

/// `true` when `v` is the zero vector produced by [`normalize_or_zero`].
pub(crate) fn is_absent(v: &Vector3<f32>) -> bool {
    v.norm_squared() <= DEGENERATE_EPSILON * DEGENERATE_EPSILON
}
