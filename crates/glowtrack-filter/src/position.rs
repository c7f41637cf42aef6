//! Position filter: smooths the fused optical position and predicts it
//! forward in time.
//!
//! The controller orchestrator talks to position filtering only through the
//! [`PositionFilter`] trait so that alternative estimators (Kalman, IMU-aided)
//! can be dropped in.  [`LowPassPositionFilter`] is the default
//! implementation: an exponential low-pass on the optical position with
//! finite-difference velocity and acceleration.
//!
//! # Example
//!
//! ```rust
//! use glowtrack_filter::position::{LowPassPositionFilter, PositionFilter};
//! use nalgebra::Vector3;
//!
//! let mut filter = LowPassPositionFilter::new(0.0);
//! filter.update(0.0, Some(Vector3::new(0.0, 0.0, 10.0)));
//! filter.update(0.1, Some(Vector3::new(0.0, 0.0, 11.0)));
//!
//! assert!((filter.velocity().z - 10.0).abs() < 1e-4);
//! assert!((filter.position(0.1).z - 12.0).abs() < 0.6);
//! ```

use nalgebra::Vector3;
use tracing::debug;

/// Default fraction of the previous estimate kept on each new hint.
pub const DEFAULT_POSITION_SMOOTHING: f32 = 0.3;

/// Contract the orchestrator uses to drive a controller's position estimate.
///
/// Units are centimetres and seconds throughout.
pub trait PositionFilter: Send {
    /// Advance by `delta_time` seconds.  `hint` is the fused optical position
    /// when the trackers currently see the controller.
    fn update(&mut self, delta_time: f32, hint: Option<Vector3<f32>>);

    /// Position predicted `time` seconds past the last update.  `time == 0.0`
    /// returns the stored position exactly.
    fn position(&self, time: f32) -> Vector3<f32>;

    fn velocity(&self) -> Vector3<f32>;

    fn acceleration(&self) -> Vector3<f32>;

    /// `false` until a position hint has been observed.
    fn is_valid(&self) -> bool;

    /// Forget everything, including validity.
    fn reset(&mut self);
}

// ────────────────────────────────────────────────────────────────────────────
// LowPassPositionFilter
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct LowPassPositionFilter {
    /// In `[0, 1)`; 0 adopts every hint verbatim.
    smoothing: f32,
    position: Vector3<f32>,
    velocity: Vector3<f32>,
    acceleration: Vector3<f32>,
    has_velocity: bool,
    is_valid: bool,
}

impl LowPassPositionFilter {
    pub fn new(smoothing: f32) -> Self {
        Self {
            smoothing: smoothing.clamp(0.0, 0.99),
            position: Vector3::zeros(),
            velocity: Vector3::zeros(),
            acceleration: Vector3::zeros(),
            has_velocity: false,
            is_valid: false,
        }
    }

    pub fn smoothing(&self) -> f32 {
        self.smoothing
    }
}

impl Default for LowPassPositionFilter {
    fn default() -> Self {
        Self::new(DEFAULT_POSITION_SMOOTHING)
    }
}

impl PositionFilter for LowPassPositionFilter {
    fn update(&mut self, delta_time: f32, hint: Option<Vector3<f32>>) {
        let Some(hint) = hint.filter(|h| h.iter().all(|c| c.is_finite())) else {
            // Nothing seen: hold still rather than coast on stale derivatives.
            self.velocity = Vector3::zeros();
            self.acceleration = Vector3::zeros();
            self.has_velocity = false;
            return;
        };

        if !self.is_valid {
            debug!(?hint, "Position filter acquired first hint");
            self.position = hint;
            self.is_valid = true;
            return;
        }
        if !(delta_time > 0.0) {
            return;
        }

        let position = self.position * self.smoothing + hint * (1.0 - self.smoothing);
        let velocity = (position - self.position) / delta_time;
        self.acceleration = if self.has_velocity {
            (velocity - self.velocity) / delta_time
        } else {
            Vector3::zeros()
        };
        self.position = position;
        self.velocity = velocity;
        self.has_velocity = true;
    }

    fn position(&self, time: f32) -> Vector3<f32> {
        extrapolate_position(self.position, self.velocity, self.acceleration, time)
    }

    fn velocity(&self) -> Vector3<f32> {
        self.velocity
    }

    fn acceleration(&self) -> Vector3<f32> {
        self.acceleration
    }

    fn is_valid(&self) -> bool {
        self.is_valid
    }

    fn reset(&mut self) {
        *self = Self::new(self.smoothing);
    }
}

/// Constant-acceleration prediction `p + v·t + ½·a·t²`.
pub fn extrapolate_position(
    position: Vector3<f32>,
    velocity: Vector3<f32>,
    acceleration: Vector3<f32>,
    time: f32,
) -> Vector3<f32> {
    if time == 0.0 {
        return position;
    }
    position + velocity * time + acceleration * (0.5 * time * time)
}
