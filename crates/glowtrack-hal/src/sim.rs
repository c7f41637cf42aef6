//! In-process simulated hardware for tests and the demo daemon.
//!
//! [`SimController`] and [`SimTrackerSource`] keep their state behind a
//! shared lock so a test (or the daemon's motion generator) can keep a
//! handle and drive the device after ownership has moved into the service.
//!
//! # Example
//!
//! ```rust
//! use glowtrack_hal::controller::{ControllerDevice, ImuSample};
//! use glowtrack_hal::sim::SimController;
//! use glowtrack_types::ControllerKind;
//!
//! let device = SimController::new("sim-move-0", ControllerKind::Move);
//! let handle = device.handle();
//!
//! handle.push_sample(ImuSample::default());
//! assert_eq!(device.poll_sequence_number(), 1);
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use glowtrack_types::{
    ControllerKind, Rgb, RumbleChannel, TrackerEstimate, TrackingError, TrackingProjection,
    TrackingShape,
};
use nalgebra::{Vector2, Vector3};
use tracing::trace;

use crate::controller::{ControllerDevice, ImuSample};
use crate::tracker::TrackerSource;

/// Bulb radius of a Move controller (cm).
pub const MOVE_SPHERE_RADIUS: f32 = 2.25;

/// DualShock 4 light bar extents (cm).
pub const DS4_LIGHT_BAR: TrackingShape = TrackingShape::LightBar {
    width: 6.0,
    height: 1.2,
};

fn lock<T>(state: &Mutex<T>) -> MutexGuard<'_, T> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

// ────────────────────────────────────────────────────────────────────────────
// Simulated controller
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct SimControllerState {
    sequence: u32,
    sample: Option<ImuSample>,
    led: Rgb,
    led_writes: usize,
    rumble_left: f32,
    rumble_right: f32,
    fail_led: bool,
    fail_rumble: bool,
}

/// A simulated controller that records every LED and rumble command.
pub struct SimController {
    serial: String,
    kind: ControllerKind,
    state: Arc<Mutex<SimControllerState>>,
}

impl SimController {
    /// Create a new simulated controller with the given serial.
    pub fn new(serial: impl Into<String>, kind: ControllerKind) -> Box<Self> {
        Box::new(Self {
            serial: serial.into(),
            kind,
            state: Arc::default(),
        })
    }

    /// A handle that stays valid after the device has been handed off.
    pub fn handle(&self) -> SimControllerHandle {
        SimControllerHandle {
            state: Arc::clone(&self.state),
        }
    }
}

impl ControllerDevice for SimController {
    fn serial(&self) -> &str {
        &self.serial
    }

    fn kind(&self) -> ControllerKind {
        self.kind
    }

    fn poll_sequence_number(&self) -> u32 {
        lock(&self.state).sequence
    }

    fn latest_sample(&self) -> Option<ImuSample> {
        match self.kind {
            ControllerKind::Navi => None,
            _ => lock(&self.state).sample,
        }
    }

    fn tracking_shape(&self) -> Option<TrackingShape> {
        match self.kind {
            ControllerKind::Move => Some(TrackingShape::Sphere {
                radius: MOVE_SPHERE_RADIUS,
            }),
            ControllerKind::DualShock4 => Some(DS4_LIGHT_BAR),
            ControllerKind::Navi => None,
        }
    }

    fn set_led(&mut self, color: Rgb) -> Result<(), TrackingError> {
        let mut state = lock(&self.state);
        if state.fail_led {
            return Err(TrackingError::HardwareFault {
                component: self.serial.clone(),
                details: "simulated LED write failure".to_string(),
            });
        }
        trace!(serial = %self.serial, ?color, "Sim LED write");
        state.led = color;
        state.led_writes += 1;
        Ok(())
    }

    fn set_rumble(&mut self, amount: f32, channel: RumbleChannel) -> Result<(), TrackingError> {
        let mut state = lock(&self.state);
        if state.fail_rumble {
            return Err(TrackingError::HardwareFault {
                component: self.serial.clone(),
                details: "simulated rumble write failure".to_string(),
            });
        }
        match channel {
            RumbleChannel::All => {
                state.rumble_left = amount;
                state.rumble_right = amount;
            }
            RumbleChannel::Left => state.rumble_left = amount,
            RumbleChannel::Right => state.rumble_right = amount,
        }
        Ok(())
    }
}

/// Test-side view of a [`SimController`].
#[derive(Clone)]
pub struct SimControllerHandle {
    state: Arc<Mutex<SimControllerState>>,
}

impl SimControllerHandle {
    /// Deliver a new input report and return its sequence number.
    pub fn push_sample(&self, sample: ImuSample) -> u32 {
        let mut state = lock(&self.state);
        state.sequence = state.sequence.wrapping_add(1);
        state.sample = Some(sample);
        state.sequence
    }

    pub fn led(&self) -> Rgb {
        lock(&self.state).led
    }

    /// Number of successful LED writes so far.
    pub fn led_writes(&self) -> usize {
        lock(&self.state).led_writes
    }

    /// `(left, right)` motor amplitudes.
    pub fn rumble(&self) -> (f32, f32) {
        let state = lock(&self.state);
        (state.rumble_left, state.rumble_right)
    }

    pub fn fail_led_writes(&self, fail: bool) {
        lock(&self.state).fail_led = fail;
    }

    pub fn fail_rumble_writes(&self, fail: bool) {
        lock(&self.state).fail_rumble = fail;
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Simulated trackers
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct SimTrackerState {
    /// Light sources each camera currently sees, by color.
    visible: Vec<HashMap<Rgb, TrackerEstimate>>,
    last_query_color: Vec<Option<Rgb>>,
    queries: usize,
}

/// A bank of simulated cameras.  Each camera reports the light sources it
/// has been shown, one per color; a query for any other color sees nothing.
#[derive(Clone, Default)]
pub struct SimTrackerSource {
    state: Arc<Mutex<SimTrackerState>>,
}

impl SimTrackerSource {
    pub fn new(tracker_count: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimTrackerState {
                visible: vec![HashMap::new(); tracker_count],
                last_query_color: vec![None; tracker_count],
                queries: 0,
            })),
        }
    }

    /// Tracker `tracker_id` now sees a light source glowing `color`,
    /// replacing any earlier estimate for that color.
    pub fn show(&self, tracker_id: usize, color: Rgb, estimate: TrackerEstimate) {
        if let Some(seen) = lock(&self.state).visible.get_mut(tracker_id) {
            seen.insert(color, estimate);
        }
    }

    /// Tracker `tracker_id` no longer sees anything.
    pub fn hide(&self, tracker_id: usize) {
        if let Some(seen) = lock(&self.state).visible.get_mut(tracker_id) {
            seen.clear();
        }
    }

    pub fn hide_all(&self) {
        lock(&self.state).visible.iter_mut().for_each(HashMap::clear);
    }

    /// Color the detector last searched for on `tracker_id`.
    pub fn last_query_color(&self, tracker_id: usize) -> Option<Rgb> {
        lock(&self.state).last_query_color.get(tracker_id).copied().flatten()
    }

    pub fn query_count(&self) -> usize {
        lock(&self.state).queries
    }
}

impl TrackerSource for SimTrackerSource {
    fn tracker_count(&self) -> usize {
        lock(&self.state).visible.len()
    }

    fn query_estimate(&self, tracker_id: usize, _shape: &TrackingShape, color: Rgb) -> Option<TrackerEstimate> {
        let mut state = lock(&self.state);
        state.queries += 1;
        if let Some(last) = state.last_query_color.get_mut(tracker_id) {
            *last = Some(color);
        }
        state.visible.get(tracker_id)?.get(&color).copied()
    }
}

/// Pinhole focal length (px) used by [`sphere_estimate`].
pub const SIM_FOCAL_LENGTH: f32 = 554.0;

/// Principal point (px) used by [`sphere_estimate`], for a 640×480 sensor.
pub const SIM_PRINCIPAL_POINT: (f32, f32) = (320.0, 240.0);

/// Estimate a camera at the origin looking down +Z would report for a Move
/// sphere at `position` (cm).
pub fn sphere_estimate(position: Vector3<f32>, residual: f32) -> TrackerEstimate {
    let projection = if position.z > f32::EPSILON {
        let radius = SIM_FOCAL_LENGTH * MOVE_SPHERE_RADIUS / position.z;
        TrackingProjection::Ellipse {
            center: Vector2::new(
                SIM_PRINCIPAL_POINT.0 + SIM_FOCAL_LENGTH * position.x / position.z,
                SIM_PRINCIPAL_POINT.1 - SIM_FOCAL_LENGTH * position.y / position.z,
            ),
            half_x_extent: radius,
            half_y_extent: radius,
            angle: 0.0,
        }
    } else {
        TrackingProjection::Invalid
    };
    TrackerEstimate {
        position,
        projection,
        orientation: None,
        residual,
    }
}
