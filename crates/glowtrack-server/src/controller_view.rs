//! [`ControllerView`] – per-controller frame driver.
//!
//! Each frame the service calls, in order:
//!
//! 1. [`ControllerView::update_optical_pose_estimation`] – query every
//!    tracker for the controller's light source and re-fuse the multicam
//!    estimate;
//! 2. [`ControllerView::update_state_and_predict`] – feed the newest IMU
//!    sample plus the fused optical estimate through the orientation and
//!    position filters and publish a pose snapshot.
//!
//! Between frames, [`ControllerView::filtered_pose`] predicts the pose at any
//! later instant without touching filter state, and [`PoseReader`] gives
//! other tasks torn-free access to the latest snapshot.
//!
//! # Tracking lifecycle
//!
//! Optical tracking is reference counted: every listener calls
//! [`start_tracking`][ControllerView::start_tracking] and, when done,
//! [`stop_tracking`][ControllerView::stop_tracking].  Tracking is enabled
//! while the count is positive and the device is open.  The bulb shows the
//! LED override color when one is set, otherwise the tracking color while
//! tracking is enabled, otherwise nothing.

use std::time::Instant;

use chrono::Utc;
use glowtrack_filter::filter_space::{FilterPacket, OrientationSource, SensorPacket};
use glowtrack_filter::orientation::{OrientationFilter, extrapolate_orientation};
use glowtrack_filter::position::{LowPassPositionFilter, PositionFilter, extrapolate_position};
use glowtrack_hal::controller::{ControllerDevice, ImuSample};
use glowtrack_hal::tracker::TrackerSource;
use glowtrack_optical::estimate::OpticalPoseEstimation;
use glowtrack_optical::tracker_bank::{MulticamTransition, OpticalEstimates};
use glowtrack_types::{
    ControllerFrame, ControllerKind, MAX_TRACKERS, Physics, Pose, Rgb, RumbleChannel,
    TrackingColorId, TrackingError,
};
use nalgebra::UnitQuaternion;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::config::ControllerConfig;
use crate::device_view::DeviceView;
use crate::publisher::FramePublisher;

/// Largest per-frame blend weight an optical orientation hint can earn.
pub const OPTICAL_HINT_GAIN: f32 = 0.05;

/// Quality attached to the fused optical orientation hint: a perfect
/// triangulation earns [`OPTICAL_HINT_GAIN`], worse ones proportionally less.
pub fn optical_hint_quality(residual: f32) -> f32 {
    let residual = if residual.is_finite() { residual.abs() } else { return 0.0 };
    (OPTICAL_HINT_GAIN / (1.0 + residual)).clamp(0.0, 1.0)
}

// ────────────────────────────────────────────────────────────────────────────
// Snapshots
// ────────────────────────────────────────────────────────────────────────────

/// Everything a reader needs from one completed update.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PoseSnapshot {
    /// Device sequence number the snapshot was built from.
    pub sequence_num: Option<u32>,
    pub pose: Pose,
    pub physics: Physics,
    pub is_orientation_valid: bool,
    pub is_position_valid: bool,
    pub is_currently_tracking: bool,
}

impl PoseSnapshot {
    /// Pose predicted `time` seconds past the snapshot, from its stored
    /// rates.  `time == 0.0` returns the stored pose exactly.
    pub fn predicted_pose(&self, time: f32) -> Pose {
        Pose {
            orientation: extrapolate_orientation(self.pose.orientation, self.physics.angular_velocity, time),
            position: extrapolate_position(
                self.pose.position,
                self.physics.linear_velocity,
                self.physics.linear_acceleration,
                time,
            ),
        }
    }
}

/// Cloneable read handle on a controller's latest [`PoseSnapshot`].
///
/// Readers always observe one complete snapshot, never a mix of two updates.
#[derive(Debug, Clone)]
pub struct PoseReader {
    receiver: watch::Receiver<PoseSnapshot>,
}

impl PoseReader {
    pub fn latest(&self) -> PoseSnapshot {
        self.receiver.borrow().clone()
    }

    /// Wait for the next snapshot.  Returns `false` once the controller view
    /// has been dropped.
    pub async fn changed(&mut self) -> bool {
        self.receiver.changed().await.is_ok()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// ControllerView
// ────────────────────────────────────────────────────────────────────────────

pub struct ControllerView {
    controller_id: usize,
    config: ControllerConfig,
    device: Option<Box<dyn ControllerDevice>>,
    orientation_filter: OrientationFilter,
    position_filter: Box<dyn PositionFilter>,
    /// Allocated on open, dropped on close.
    optical: Option<Box<OpticalEstimates>>,
    /// Set when the multicam record goes stale; the next reacquisition resets
    /// the filters.
    multicam_invalidated: bool,
    last_sequence_num: Option<u32>,
    last_update: Option<Instant>,
    listener_count: usize,
    tracking_color: Option<TrackingColorId>,
    led_override: Option<Rgb>,
    /// Last color successfully written to the bulb.
    led_shown: Option<Rgb>,
    snapshot: watch::Sender<PoseSnapshot>,
}

impl ControllerView {
    pub fn new(controller_id: usize, config: ControllerConfig) -> Self {
        let orientation_filter = build_orientation_filter(&config);
        let position_filter = Box::new(LowPassPositionFilter::new(config.position_smoothing));
        let (snapshot, _) = watch::channel(PoseSnapshot::default());
        Self {
            controller_id,
            tracking_color: config.tracking_color,
            config,
            device: None,
            orientation_filter,
            position_filter,
            optical: None,
            multicam_invalidated: false,
            last_sequence_num: None,
            last_update: None,
            listener_count: 0,
            led_override: None,
            led_shown: None,
            snapshot,
        }
    }

    /// Swap in a different position estimator.
    pub fn with_position_filter(mut self, position_filter: Box<dyn PositionFilter>) -> Self {
        self.position_filter = position_filter;
        self
    }

    pub fn controller_id(&self) -> usize {
        self.controller_id
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Re-apply tunables.  Filter state is kept unless the fusion strategy
    /// or the position smoothing changes; a smoothing change replaces the
    /// position filter with a fresh [`LowPassPositionFilter`].
    pub fn apply_config(&mut self, config: ControllerConfig) {
        if config.position_smoothing != self.config.position_smoothing {
            debug!(
                controller_id = self.controller_id,
                smoothing = config.position_smoothing,
                "Position filter rebuilt"
            );
            self.position_filter = Box::new(LowPassPositionFilter::new(config.position_smoothing));
        }
        self.orientation_filter.set_fusion_type(config.fusion_type);
        self.orientation_filter.set_gyroscope_error(config.gyro_error);
        self.orientation_filter.set_gyroscope_drift(config.gyro_drift);
        self.orientation_filter.set_filter_space(config.filter_space());
        if let Some(optical) = self.optical.as_mut() {
            optical.set_staleness_threshold(config.staleness_threshold());
        }
        self.config = config;
    }

    /// Device sequence number of the last processed input report.
    pub fn sequence_num(&self) -> Option<u32> {
        self.last_sequence_num
    }

    pub fn kind(&self) -> Option<ControllerKind> {
        self.device.as_ref().map(|d| d.kind())
    }

    pub fn serial(&self) -> Option<&str> {
        self.device.as_deref().map(|d| d.serial())
    }

    // ── Per-frame updates ───────────────────────────────────────────────────

    /// Query every tracker for this controller and refresh the multicam
    /// estimate.  No-op while tracking is disabled.
    pub fn update_optical_pose_estimation(&mut self, tracker: &dyn TrackerSource) {
        self.update_optical_pose_estimation_at(tracker, Instant::now());
    }

    pub fn update_optical_pose_estimation_at(&mut self, tracker: &dyn TrackerSource, now: Instant) {
        if !self.is_tracking_enabled() {
            return;
        }
        let Some(shape) = self.device.as_ref().and_then(|d| d.tracking_shape()) else {
            return;
        };
        let color = self.detection_color();
        let Some(optical) = self.optical.as_mut() else {
            return;
        };

        for tracker_id in 0..tracker.tracker_count().min(MAX_TRACKERS) {
            let estimate = color.and_then(|c| tracker.query_estimate(tracker_id, &shape, c));
            optical.observe(tracker_id, estimate.as_ref(), now);
        }

        match optical.update_multicam(now) {
            MulticamTransition::Invalidated => self.multicam_invalidated = true,
            MulticamTransition::Reacquired if self.multicam_invalidated => {
                self.multicam_invalidated = false;
                debug!(controller_id = self.controller_id, "Tracking reacquired; resetting filters");
                self.orientation_filter.reset_filter_state();
                self.position_filter.reset();
            }
            MulticamTransition::Lost => {
                trace!(controller_id = self.controller_id, "Controller left every tracker's view")
            }
            _ => {}
        }
    }

    /// Advance the filters with the device's newest sample.  Returns `false`
    /// when there was nothing new to process.
    pub fn update_state_and_predict(&mut self) -> bool {
        self.update_state_and_predict_at(Instant::now())
    }

    pub fn update_state_and_predict_at(&mut self, now: Instant) -> bool {
        let Some(device) = self.device.as_ref() else {
            return false;
        };

        let sequence_num = device.poll_sequence_number();
        if self.last_sequence_num == Some(sequence_num) {
            trace!(controller_id = self.controller_id, sequence_num, "No new input report");
            return false;
        }
        let sample = device.latest_sample();

        // Zero on the first frame after (re)connection.
        let delta_time = self
            .last_update
            .map_or(0.0, |previous| now.saturating_duration_since(previous).as_secs_f32());

        let optical = self.fused_optical();

        if let Some(sample) = sample {
            let (orientation, orientation_source, orientation_quality) =
                match optical.as_ref().filter(|m| m.orientation_valid) {
                    Some(multicam) => (
                        multicam.orientation,
                        OrientationSource::Optical,
                        optical_hint_quality(multicam.residual),
                    ),
                    None => (self.orientation_filter.orientation(0.0), OrientationSource::PreviousFrame, 0.0),
                };
            let packet = SensorPacket {
                orientation,
                orientation_source,
                orientation_quality,
                accelerometer: sample.accelerometer,
                magnetometer: sample.magnetometer,
                gyroscope: sample.gyroscope,
            };
            self.orientation_filter.update(delta_time, &packet);
        }

        let position_hint = optical.map(|m| m.position);
        self.position_filter.update(delta_time, position_hint);

        self.last_sequence_num = Some(sequence_num);
        self.last_update = Some(now);

        trace!(controller_id = self.controller_id, sequence_num, delta_time, "Controller state updated");
        self.snapshot.send_replace(self.current_snapshot());
        self.refresh_led();
        true
    }

    /// The multicam estimate, when tracking is enabled and it is current.
    fn fused_optical(&self) -> Option<OpticalPoseEstimation> {
        if !self.is_tracking_enabled() {
            return None;
        }
        self.optical
            .as_ref()
            .map(|o| o.multicam())
            .filter(|m| m.is_currently_tracking())
            .cloned()
    }

    // ── Reads ───────────────────────────────────────────────────────────────

    /// Pose predicted `time` seconds past the last update.
    pub fn filtered_pose(&self, time: f32) -> Pose {
        Pose {
            orientation: self.orientation_filter.orientation(time),
            position: self.position_filter.position(time),
        }
    }

    /// Current rates from both filters, no extrapolation.
    pub fn filtered_physics(&self) -> Physics {
        Physics {
            linear_velocity: self.position_filter.velocity(),
            linear_acceleration: self.position_filter.acceleration(),
            angular_velocity: self.orientation_filter.angular_velocity(),
            angular_acceleration: self.orientation_filter.angular_acceleration(),
        }
    }

    pub fn pose_reader(&self) -> PoseReader {
        PoseReader {
            receiver: self.snapshot.subscribe(),
        }
    }

    fn current_snapshot(&self) -> PoseSnapshot {
        PoseSnapshot {
            sequence_num: self.last_sequence_num,
            pose: self.filtered_pose(0.0),
            physics: self.filtered_physics(),
            is_orientation_valid: self.orientation_filter.is_valid(),
            is_position_valid: self.position_filter.is_valid(),
            is_currently_tracking: self.is_currently_tracking(),
        }
    }

    /// The frame [`DeviceView::publish_frame`] would publish right now.
    pub fn frame(&self) -> Option<ControllerFrame> {
        let kind = self.kind()?;
        Some(ControllerFrame {
            controller_id: self.controller_id,
            kind,
            sequence_num: self.last_sequence_num.unwrap_or(0),
            timestamp: Utc::now(),
            pose: self.filtered_pose(0.0),
            physics: self.filtered_physics(),
            is_orientation_valid: self.orientation_filter.is_valid(),
            is_position_valid: self.position_filter.is_valid(),
            is_tracking_enabled: self.is_tracking_enabled(),
            is_currently_tracking: self.is_currently_tracking(),
            tracking_color: self.tracking_color,
            led_override_active: self.is_led_override_active(),
        })
    }

    /// The device's newest IMU reading, sensor frame.
    pub fn latest_sample(&self) -> Option<ImuSample> {
        self.device.as_ref()?.latest_sample()
    }

    /// [`latest_sample`][Self::latest_sample] expressed in filter space.
    pub fn calibrated_sample(&self) -> Option<FilterPacket> {
        let sample = self.latest_sample()?;
        let packet = SensorPacket {
            orientation: self.orientation_filter.orientation(0.0),
            accelerometer: sample.accelerometer,
            magnetometer: sample.magnetometer,
            gyroscope: sample.gyroscope,
            ..SensorPacket::default()
        };
        Some(self.orientation_filter.filter_space().convert(&packet))
    }

    pub fn orientation_filter(&self) -> &OrientationFilter {
        &self.orientation_filter
    }

    pub fn orientation_filter_mut(&mut self) -> &mut OrientationFilter {
        &mut self.orientation_filter
    }

    pub fn position_filter(&self) -> &dyn PositionFilter {
        self.position_filter.as_ref()
    }

    /// Per-tracker record, `None` when closed or out of range.
    pub fn tracker_pose_estimate(&self, tracker_id: usize) -> Option<&OpticalPoseEstimation> {
        self.optical.as_ref()?.tracker(tracker_id)
    }

    pub fn multicam_pose_estimate(&self) -> Option<&OpticalPoseEstimation> {
        self.optical.as_ref().map(|o| o.multicam())
    }

    // ── Tracking lifecycle ──────────────────────────────────────────────────

    pub fn start_tracking(&mut self) {
        self.listener_count += 1;
        if self.listener_count == 1 {
            info!(controller_id = self.controller_id, "Optical tracking started");
        }
        self.refresh_led();
    }

    /// Never drops the listener count below zero.
    pub fn stop_tracking(&mut self) {
        if self.listener_count == 0 {
            return;
        }
        self.listener_count -= 1;
        if self.listener_count == 0 {
            info!(controller_id = self.controller_id, "Optical tracking stopped");
            self.forget_optical();
        }
        self.refresh_led();
    }

    pub fn listener_count(&self) -> usize {
        self.listener_count
    }

    pub fn is_tracking_enabled(&self) -> bool {
        self.listener_count > 0 && self.optical.is_some()
    }

    pub fn is_currently_tracking(&self) -> bool {
        self.is_tracking_enabled()
            && self
                .optical
                .as_ref()
                .is_some_and(|o| o.multicam().is_currently_tracking())
    }

    /// Change the color the detector searches for from the next frame on.
    pub fn set_tracking_color_id(&mut self, color: Option<TrackingColorId>) {
        if self.tracking_color != color {
            debug!(controller_id = self.controller_id, from = ?self.tracking_color, to = ?color, "Tracking color changed");
            self.tracking_color = color;
            self.refresh_led();
        }
    }

    pub fn tracking_color_id(&self) -> Option<TrackingColorId> {
        self.tracking_color
    }

    /// Color handed to the optical detector.
    pub fn detection_color(&self) -> Option<Rgb> {
        match self.led_override {
            Some(color) if self.config.detect_override_color => Some(color),
            _ => self.tracking_color.map(TrackingColorId::rgb),
        }
    }

    // ── LED and rumble ──────────────────────────────────────────────────────

    pub fn set_led_override(&mut self, color: Rgb) {
        self.led_override = Some(color);
        self.refresh_led();
    }

    pub fn clear_led_override(&mut self) {
        self.led_override = None;
        self.refresh_led();
    }

    pub fn is_led_override_active(&self) -> bool {
        self.led_override.is_some()
    }

    pub fn led_override_color(&self) -> Option<Rgb> {
        self.led_override
    }

    /// Color the bulb should show right now.
    pub fn desired_led_color(&self) -> Rgb {
        match (self.led_override, self.tracking_color) {
            (Some(color), _) => color,
            (None, Some(id)) if self.is_tracking_enabled() => id.rgb(),
            _ => Rgb::OFF,
        }
    }

    /// `amount` is clamped to `[0, 1]`.
    ///
    /// # Errors
    ///
    /// Returns [`TrackingError::DeviceNotOpen`] when closed, or the
    /// transport's error when it rejects the command.
    pub fn set_controller_rumble(&mut self, amount: f32, channel: RumbleChannel) -> Result<(), TrackingError> {
        let device = self.device.as_mut().ok_or(TrackingError::DeviceNotOpen)?;
        let amount = if amount.is_nan() { 0.0 } else { amount.clamp(0.0, 1.0) };
        device.set_rumble(amount, channel)
    }

    /// Push [`desired_led_color`][Self::desired_led_color] to the bulb if it
    /// changed.  Failures are logged and retried on the next call.
    fn refresh_led(&mut self) {
        let desired = self.desired_led_color();
        let Some(device) = self.device.as_mut() else {
            return;
        };
        if !device.kind().has_bulb() || self.led_shown == Some(desired) {
            return;
        }
        match device.set_led(desired) {
            Ok(()) => self.led_shown = Some(desired),
            Err(e) => warn!(controller_id = self.controller_id, error = %e, "LED update failed"),
        }
    }

    fn forget_optical(&mut self) {
        if let Some(optical) = self.optical.as_mut() {
            if optical.multicam().timestamps_valid() {
                self.multicam_invalidated = true;
            }
            optical.invalidate_all();
        }
    }

    fn reset_filters(&mut self) {
        self.orientation_filter.reset_orientation(UnitQuaternion::identity());
        self.position_filter.reset();
        self.multicam_invalidated = false;
        self.last_sequence_num = None;
        self.last_update = None;
        self.snapshot.send_replace(self.current_snapshot());
    }
}

impl DeviceView for ControllerView {
    fn open(&mut self, device: Box<dyn ControllerDevice>) -> Result<(), TrackingError> {
        if self.device.is_some() {
            return Err(TrackingError::AlreadyOpen);
        }
        info!(
            controller_id = self.controller_id,
            serial = device.serial(),
            kind = ?device.kind(),
            "Controller opened"
        );
        self.device = Some(device);
        self.optical = Some(Box::new(OpticalEstimates::new(self.config.staleness_threshold())));
        self.led_shown = None;
        self.reset_filters();
        self.refresh_led();
        Ok(())
    }

    fn close(&mut self) -> Result<(), TrackingError> {
        let Some(mut device) = self.device.take() else {
            return Err(TrackingError::DeviceNotOpen);
        };
        if device.kind().has_bulb() {
            if let Err(e) = device.set_led(Rgb::OFF) {
                warn!(controller_id = self.controller_id, error = %e, "Failed to switch bulb off on close");
            }
        }
        info!(controller_id = self.controller_id, serial = device.serial(), "Controller closed");
        self.optical = None;
        self.listener_count = 0;
        self.led_override = None;
        self.led_shown = None;
        self.reset_filters();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.device.is_some()
    }

    fn publish_frame(&self, publisher: &dyn FramePublisher) -> Result<(), TrackingError> {
        let frame = self.frame().ok_or(TrackingError::DeviceNotOpen)?;
        publisher.publish(frame)
    }
}

fn build_orientation_filter(config: &ControllerConfig) -> OrientationFilter {
    let mut filter = OrientationFilter::new(config.filter_space(), config.fusion_type);
    filter.set_gyroscope_error(config.gyro_error);
    filter.set_gyroscope_drift(config.gyro_drift);
    filter
}
