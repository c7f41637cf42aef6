//! Orientation filter: a stateful AHRS that fuses gyroscope, accelerometer,
//! magnetometer and optical orientation hints into one unit quaternion.
//!
//! The filter runs one of several [`FusionType`] strategies.  All of them
//! share the same update contract:
//!
//! 1. a non-positive `delta_time` integrates nothing (only
//!    [`FusionType::PassThrough`] still adopts its hint);
//! 2. the gyroscope rate, minus the running bias estimate, is integrated as a
//!    quaternion derivative;
//! 3. the strategy's correction term is applied when its measurement and
//!    reference vectors are both present, and silently skipped otherwise;
//! 4. the gyroscope bias estimate is nudged by the drift gain;
//! 5. the quaternion is renormalized;
//! 6. angular velocity (world frame) and its finite-difference derivative
//!    are refreshed and the filter is marked valid.
//!
//! # Example
//!
//! ```rust
//! use glowtrack_filter::filter_space::SensorPacket;
//! use glowtrack_filter::orientation::{FusionType, OrientationFilter};
//! use nalgebra::Vector3;
//!
//! let mut filter = OrientationFilter::new(Default::default(), FusionType::MadgwickArg);
//!
//! let mut packet = SensorPacket::default();
//! packet.accelerometer = Vector3::new(0.0, 9.81, 0.0);
//! packet.gyroscope = Vector3::new(0.0, 0.5, 0.0);
//! filter.update(0.01, &packet);
//!
//! assert!(filter.is_valid());
//! assert!((filter.orientation(0.0).quaternion().norm() - 1.0).abs() < 1e-5);
//! ```

mod complementary;
mod madgwick;

pub use complementary::COMPLEMENTARY_MARG_BLEND;

use nalgebra::{Quaternion, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::filter_space::{FilterPacket, FilterSpace, SensorPacket};

/// Default expected gyroscope measurement error (rad/s), about 5°/s.
pub const DEFAULT_GYRO_ERROR: f32 = 0.087;

/// Default expected gyroscope drift rate (rad/s²), about 0.2°/s².
pub const DEFAULT_GYRO_DRIFT: f32 = 0.0035;

// ────────────────────────────────────────────────────────────────────────────
// Strategy selector
// ────────────────────────────────────────────────────────────────────────────

/// Fusion strategy run by [`OrientationFilter::update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FusionType {
    /// Orientation frozen; updates are ignored.
    None,
    /// Orientation is replaced by the packet's hint.
    PassThrough,
    /// Gradient-descent correction against gravity.
    #[default]
    MadgwickArg,
    /// Gradient-descent correction against gravity and magnetic north.
    MadgwickMarg,
    /// Gyro integration blended toward optical orientation by hint quality.
    ComplementaryOpticalArg,
    /// Gyro integration low-pass blended toward an accel/mag attitude.
    ComplementaryMarg,
}

// ────────────────────────────────────────────────────────────────────────────
// State
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct FusionState {
    pub(crate) orientation: UnitQuaternion<f32>,
    /// rad/s, world frame.
    pub(crate) angular_velocity: Vector3<f32>,
    /// rad/s², world frame.
    pub(crate) angular_acceleration: Vector3<f32>,
    /// rad/s, sensor frame.
    pub(crate) gyro_bias: Vector3<f32>,
    pub(crate) is_valid: bool,
}

impl FusionState {
    fn with_orientation(orientation: UnitQuaternion<f32>) -> Self {
        Self {
            orientation,
            angular_velocity: Vector3::zeros(),
            angular_acceleration: Vector3::zeros(),
            gyro_bias: Vector3::zeros(),
            is_valid: false,
        }
    }
}

/// Gains shared by every strategy for one step.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Gains {
    /// Gradient-descent step size.
    pub(crate) beta: f32,
    /// Bias drift integration rate.
    pub(crate) zeta: f32,
}

/// What a strategy hands back to the shared bookkeeping.
pub(crate) struct Step {
    pub(crate) orientation: UnitQuaternion<f32>,
    /// Bias-corrected gyroscope rate, sensor frame.
    pub(crate) body_rate: Vector3<f32>,
}

// ────────────────────────────────────────────────────────────────────────────
// OrientationFilter
// ────────────────────────────────────────────────────────────────────────────

/// Stateful orientation estimator owned by one controller.
#[derive(Debug, Clone)]
pub struct OrientationFilter {
    filter_space: FilterSpace,
    fusion_type: FusionType,
    state: FusionState,
    /// rad/s
    gyro_error: f32,
    /// rad/s²
    gyro_drift: f32,
}

impl OrientationFilter {
    /// Create a filter with identity orientation and default gyro tunables.
    pub fn new(filter_space: FilterSpace, fusion_type: FusionType) -> Self {
        Self {
            filter_space,
            fusion_type,
            state: FusionState::with_orientation(UnitQuaternion::identity()),
            gyro_error: DEFAULT_GYRO_ERROR,
            gyro_drift: DEFAULT_GYRO_DRIFT,
        }
    }

    pub fn filter_space(&self) -> &FilterSpace {
        &self.filter_space
    }

    pub fn filter_space_mut(&mut self) -> &mut FilterSpace {
        &mut self.filter_space
    }

    pub fn set_filter_space(&mut self, filter_space: FilterSpace) {
        self.filter_space = filter_space;
    }

    pub fn fusion_type(&self) -> FusionType {
        self.fusion_type
    }

    /// Switch strategy.  Rates, bias and validity are cleared so the new
    /// strategy does not inherit the old one's state; the orientation is kept.
    pub fn set_fusion_type(&mut self, fusion_type: FusionType) {
        if fusion_type != self.fusion_type {
            debug!(from = ?self.fusion_type, to = ?fusion_type, "Orientation fusion type changed");
            self.fusion_type = fusion_type;
            self.reset_filter_state();
        }
    }

    pub fn set_gyroscope_error(&mut self, gyro_error: f32) {
        self.gyro_error = gyro_error.max(0.0);
    }

    pub fn set_gyroscope_drift(&mut self, gyro_drift: f32) {
        self.gyro_drift = gyro_drift.max(0.0);
    }

    pub fn gyroscope_error(&self) -> f32 {
        self.gyro_error
    }

    pub fn gyroscope_drift(&self) -> f32 {
        self.gyro_drift
    }

    /// `false` until the first update that produced an orientation.
    pub fn is_valid(&self) -> bool {
        self.state.is_valid
    }

    /// World-frame angular velocity (rad/s).
    pub fn angular_velocity(&self) -> Vector3<f32> {
        self.state.angular_velocity
    }

    /// World-frame angular acceleration (rad/s²).
    pub fn angular_acceleration(&self) -> Vector3<f32> {
        self.state.angular_acceleration
    }

    /// Current gyroscope bias estimate (rad/s, sensor frame).
    pub fn gyro_bias(&self) -> Vector3<f32> {
        self.state.gyro_bias
    }

    /// Orientation predicted `time` seconds ahead of the last update.
    ///
    /// `time == 0.0` returns the stored orientation bit-for-bit.
    pub fn orientation(&self, time: f32) -> UnitQuaternion<f32> {
        extrapolate_orientation(self.state.orientation, self.state.angular_velocity, time)
    }

    /// Replace the orientation and drop all derived state.
    pub fn reset_orientation(&mut self, orientation: UnitQuaternion<f32>) {
        debug!(?orientation, "Orientation filter reset to explicit pose");
        self.state = FusionState::with_orientation(orientation);
    }

    /// Drop rates, bias and validity while keeping the current orientation.
    pub fn reset_filter_state(&mut self) {
        debug!("Orientation filter state reset");
        self.state = FusionState::with_orientation(self.state.orientation);
    }

    /// Advance the filter by `delta_time` seconds using `packet`.
    pub fn update(&mut self, delta_time: f32, packet: &SensorPacket) {
        let packet = self.filter_space.convert(packet);

        match self.fusion_type {
            FusionType::None => return,
            FusionType::PassThrough => return self.pass_through(delta_time, &packet),
            _ => {}
        }

        // Covers zero, negative and NaN step times.
        if !(delta_time > 0.0) {
            trace!(delta_time, "Non-positive step time; orientation not integrated");
            return;
        }

        let gains = self.gains();
        let step = match self.fusion_type {
            FusionType::MadgwickArg => {
                madgwick::step(&mut self.state, &self.filter_space, &packet, delta_time, gains, false)
            }
            FusionType::MadgwickMarg => {
                madgwick::step(&mut self.state, &self.filter_space, &packet, delta_time, gains, true)
            }
            FusionType::ComplementaryOpticalArg => {
                complementary::optical_step(&mut self.state, &packet, delta_time, gains)
            }
            FusionType::ComplementaryMarg => complementary::marg_step(
                &mut self.state,
                &self.filter_space,
                &packet,
                delta_time,
                gains,
            ),
            FusionType::None | FusionType::PassThrough => return,
        };

        let angular_velocity = step.orientation.transform_vector(&step.body_rate);
        self.commit(step.orientation, angular_velocity, delta_time);
    }

    fn pass_through(&mut self, delta_time: f32, packet: &FilterPacket) {
        let hint = packet.orientation;
        if delta_time > 0.0 && self.state.is_valid {
            // Rate implied by the change between successive hints.
            let delta = hint * self.state.orientation.inverse();
            let angular_velocity = delta.scaled_axis() / delta_time;
            self.commit(hint, angular_velocity, delta_time);
        } else {
            self.state.orientation = hint;
            self.state.is_valid = true;
        }
    }

    fn commit(&mut self, orientation: UnitQuaternion<f32>, angular_velocity: Vector3<f32>, delta_time: f32) {
        self.state.angular_acceleration = if self.state.is_valid {
            (angular_velocity - self.state.angular_velocity) / delta_time
        } else {
            Vector3::zeros()
        };
        self.state.angular_velocity = angular_velocity;
        self.state.orientation = orientation;
        self.state.is_valid = true;
    }

    fn gains(&self) -> Gains {
        let scale = (3.0_f32 / 4.0).sqrt();
        Gains {
            beta: scale * self.gyro_error,
            zeta: scale * self.gyro_drift,
        }
    }
}

impl Default for OrientationFilter {
    fn default() -> Self {
        Self::new(FilterSpace::default(), FusionType::default())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Shared quaternion helpers
// ────────────────────────────────────────────────────────────────────────────

/// First-order prediction of `orientation` after `time` seconds of rotation
/// at the world-frame rate `angular_velocity`.
pub fn extrapolate_orientation(
    orientation: UnitQuaternion<f32>,
    angular_velocity: Vector3<f32>,
    time: f32,
) -> UnitQuaternion<f32> {
    if time == 0.0 {
        return orientation;
    }
    let q = orientation.into_inner();
    let q_dot = Quaternion::from_imag(angular_velocity) * q * 0.5;
    renormalize(q + q_dot * time, orientation)
}

/// Integrate a sensor-frame rate over `dt` (q̇ = ½ q ⊗ ω).
pub(crate) fn integrate_body_rate(
    orientation: UnitQuaternion<f32>,
    body_rate: Vector3<f32>,
    dt: f32,
) -> UnitQuaternion<f32> {
    let q = orientation.into_inner();
    let q_dot = q * Quaternion::from_imag(body_rate) * 0.5;
    renormalize(q + q_dot * dt, orientation)
}

/// Normalize `q`, falling back to `previous` if the result is degenerate.
pub(crate) fn renormalize(q: Quaternion<f32>, previous: UnitQuaternion<f32>) -> UnitQuaternion<f32> {
    let norm = q.norm();
    if norm.is_finite() && norm > f32::EPSILON {
        UnitQuaternion::new_unchecked(q / norm)
    } else {
        previous
    }
}

/// Spherical interpolation that tolerates opposite inputs.
pub(crate) fn blend(
    from: UnitQuaternion<f32>,
    to: UnitQuaternion<f32>,
    weight: f32,
) -> UnitQuaternion<f32> {
    let weight = weight.clamp(0.0, 1.0);
    if weight <= 0.0 {
        return from;
    }
    if weight >= 1.0 {
        return to;
    }
    from.try_slerp(&to, weight, 1e-6)
        .unwrap_or(if weight < 0.5 { from } else { to })
}
