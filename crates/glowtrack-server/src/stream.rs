//! Per-connection controller streams and inbound controller data frames.
//!
//! A client connection opens a stream per controller it wants data for.
//! Streams that ask for position data hold a tracking listener on the
//! controller, so the bulb lights and the cameras search for it only while
//! somebody is listening.  The remaining flags pick what goes into each
//! outbound [`StreamFrame`].  Inbound data frames carry rumble and LED
//! commands back to the controller.

use std::collections::BTreeMap;

use glowtrack_filter::filter_space::FilterPacket;
use glowtrack_hal::controller::ImuSample;
use glowtrack_optical::estimate::OpticalPoseEstimation;
use glowtrack_types::{
    ControllerKind, MAX_TRACKERS, Physics, Rgb, RumbleChannel, TrackingColorId, TrackingError,
};
use nalgebra::{UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::controller_manager::ControllerManager;
use crate::device_view::DeviceView;

/// What a client asked to receive for one controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StreamFlags {
    pub include_position_data: bool,
    pub include_physics_data: bool,
    pub include_raw_sensor_data: bool,
    pub include_calibrated_sensor_data: bool,
    pub include_raw_tracker_data: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamInfo {
    pub flags: StreamFlags,
    /// Highest inbound sequence number accepted so far.
    pub last_input_sequence_num: Option<u32>,
    /// This stream set the controller's LED override.
    pub led_override_active: bool,
}

/// One controller's state, shaped by the stream's [`StreamFlags`].
#[derive(Debug, Clone, PartialEq)]
pub struct StreamFrame {
    pub controller_id: usize,
    pub kind: ControllerKind,
    pub sequence_num: u32,
    pub orientation: UnitQuaternion<f32>,
    pub is_orientation_valid: bool,
    /// `include_position_data`
    pub position: Option<Vector3<f32>>,
    /// `include_physics_data`
    pub physics: Option<Physics>,
    /// `include_raw_sensor_data`
    pub raw_sensor: Option<ImuSample>,
    /// `include_calibrated_sensor_data`
    pub calibrated_sensor: Option<FilterPacket>,
    /// `include_raw_tracker_data`: `(tracker_id, record)` for every tracker
    /// that currently sees the controller.
    pub raw_trackers: Option<Vec<(usize, OpticalPoseEstimation)>>,
}

/// Inbound client data for one controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerInputFrame {
    pub controller_id: usize,
    pub sequence_num: u32,
    pub rumble_left: u8,
    /// Ignored by single-motor controllers.
    pub rumble_right: u8,
    /// `(0, 0, 0)` clears this stream's LED override.
    pub led: Rgb,
}

/// Stream bookkeeping for one client connection.
#[derive(Debug, Default)]
pub struct ConnectionStreams {
    streams: BTreeMap<usize, StreamInfo>,
}

impl ConnectionStreams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stream_info(&self, controller_id: usize) -> Option<&StreamInfo> {
        self.streams.get(&controller_id)
    }

    pub fn active_streams(&self) -> impl Iterator<Item = usize> + '_ {
        self.streams.keys().copied()
    }

    /// Start (or restart with new flags) the stream for `controller_id`.
    ///
    /// # Errors
    ///
    /// Returns [`TrackingError::InvalidControllerId`] or
    /// [`TrackingError::DeviceNotOpen`].
    pub fn start_controller_stream(
        &mut self,
        manager: &mut ControllerManager,
        controller_id: usize,
        flags: StreamFlags,
    ) -> Result<(), TrackingError> {
        if !manager.view(controller_id)?.is_open() {
            return Err(TrackingError::DeviceNotOpen);
        }
        if self.streams.contains_key(&controller_id) {
            self.stop_controller_stream(manager, controller_id)?;
        }

        if flags.include_position_data {
            manager.view_mut(controller_id)?.start_tracking();
        }
        self.streams.insert(
            controller_id,
            StreamInfo {
                flags,
                ..StreamInfo::default()
            },
        );
        debug!(controller_id, ?flags, "Controller stream started");
        Ok(())
    }

    /// Stop the stream for `controller_id`, releasing its tracking listener
    /// and any LED override it set.  Stopping a stream that is not running is
    /// a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`TrackingError::InvalidControllerId`] for a bad slot.
    pub fn stop_controller_stream(
        &mut self,
        manager: &mut ControllerManager,
        controller_id: usize,
    ) -> Result<(), TrackingError> {
        let view = manager.view_mut(controller_id)?;
        let Some(info) = self.streams.remove(&controller_id) else {
            return Ok(());
        };
        if info.flags.include_position_data {
            view.stop_tracking();
        }
        if info.led_override_active {
            view.clear_led_override();
        }
        debug!(controller_id, "Controller stream stopped");
        Ok(())
    }

    /// Apply an inbound data frame.  Returns `false` when the frame was
    /// dropped: no stream for that controller, or an old sequence number.
    ///
    /// # Errors
    ///
    /// Returns [`TrackingError::DeviceNotOpen`] when the controller closed
    /// under the stream, or the transport's rumble error.
    pub fn handle_input_frame(
        &mut self,
        manager: &mut ControllerManager,
        frame: &ControllerInputFrame,
    ) -> Result<bool, TrackingError> {
        let Some(info) = self.streams.get_mut(&frame.controller_id) else {
            trace!(controller_id = frame.controller_id, "Input frame for controller without a stream");
            return Ok(false);
        };
        if info.last_input_sequence_num.is_some_and(|last| frame.sequence_num <= last) {
            trace!(
                controller_id = frame.controller_id,
                sequence_num = frame.sequence_num,
                "Dropping out-of-order input frame"
            );
            return Ok(false);
        }
        info.last_input_sequence_num = Some(frame.sequence_num);

        let view = manager.view_mut(frame.controller_id)?;
        let kind = view.kind().ok_or(TrackingError::DeviceNotOpen)?;

        if frame.led.is_off() {
            if info.led_override_active {
                view.clear_led_override();
                info.led_override_active = false;
            }
        } else {
            view.set_led_override(frame.led);
            info.led_override_active = true;
        }

        let left = rumble_amount(frame.rumble_left);
        match kind {
            ControllerKind::DualShock4 => {
                view.set_controller_rumble(left, RumbleChannel::Left)?;
                view.set_controller_rumble(rumble_amount(frame.rumble_right), RumbleChannel::Right)?;
            }
            ControllerKind::Move => view.set_controller_rumble(left, RumbleChannel::All)?,
            // No motor.
            ControllerKind::Navi => {}
        }
        Ok(true)
    }

    /// Build the outbound frame for `controller_id`'s stream.  `Ok(None)`
    /// when this connection has no stream for it.
    ///
    /// # Errors
    ///
    /// Returns [`TrackingError::InvalidControllerId`] or
    /// [`TrackingError::DeviceNotOpen`].
    pub fn stream_frame(
        &self,
        manager: &ControllerManager,
        controller_id: usize,
    ) -> Result<Option<StreamFrame>, TrackingError> {
        let view = manager.view(controller_id)?;
        let Some(info) = self.streams.get(&controller_id) else {
            return Ok(None);
        };
        let kind = view.kind().ok_or(TrackingError::DeviceNotOpen)?;
        let flags = info.flags;
        let pose = view.filtered_pose(0.0);

        let raw_trackers = flags.include_raw_tracker_data.then(|| {
            (0..MAX_TRACKERS)
                .filter_map(|tracker_id| {
                    view.tracker_pose_estimate(tracker_id)
                        .filter(|record| record.is_currently_tracking())
                        .map(|record| (tracker_id, record.clone()))
                })
                .collect()
        });

        Ok(Some(StreamFrame {
            controller_id,
            kind,
            sequence_num: view.sequence_num().unwrap_or(0),
            orientation: pose.orientation,
            is_orientation_valid: view.orientation_filter().is_valid(),
            position: flags.include_position_data.then_some(pose.position),
            physics: flags.include_physics_data.then(|| view.filtered_physics()),
            raw_sensor: if flags.include_raw_sensor_data { view.latest_sample() } else { None },
            calibrated_sensor: if flags.include_calibrated_sensor_data { view.calibrated_sample() } else { None },
            raw_trackers,
        }))
    }

    /// Frames for every stream whose controller is still open.
    pub fn stream_frames(&self, manager: &ControllerManager) -> Vec<StreamFrame> {
        self.streams
            .keys()
            .filter_map(|&controller_id| match self.stream_frame(manager, controller_id) {
                Ok(frame) => frame,
                Err(e) => {
                    trace!(controller_id, error = %e, "No frame for stream");
                    None
                }
            })
            .collect()
    }

    /// Change a controller's tracking color on behalf of this connection.
    ///
    /// # Errors
    ///
    /// Returns [`TrackingError::InvalidControllerId`] for a bad slot.
    pub fn set_tracking_color(
        &self,
        manager: &mut ControllerManager,
        controller_id: usize,
        color: TrackingColorId,
    ) -> Result<(), TrackingError> {
        if manager.view(controller_id)?.tracking_color_id() != Some(color) {
            manager.claim_tracking_color_id(controller_id, color)?;
        }
        Ok(())
    }

    /// The connection went away: stop every stream it held.
    pub fn connection_stopped(&mut self, manager: &mut ControllerManager) {
        let controller_ids: Vec<usize> = self.streams.keys().copied().collect();
        for controller_id in controller_ids {
            if let Err(e) = self.stop_controller_stream(manager, controller_id) {
                warn!(controller_id, error = %e, "Failed to stop stream on disconnect");
            }
        }
    }
}

fn rumble_amount(byte: u8) -> f32 {
    f32::from(byte) / 255.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControllerConfig;
    use approx::assert_relative_eq;
    use glowtrack_hal::sim::{SimController, SimControllerHandle, SimTrackerSource, sphere_estimate};
    use std::time::Instant;

    const POSITION: StreamFlags = StreamFlags {
        include_position_data: true,
        include_physics_data: false,
        include_raw_sensor_data: false,
        include_calibrated_sensor_data: false,
        include_raw_tracker_data: false,
    };

    fn manager_with(kind: ControllerKind) -> (ControllerManager, SimControllerHandle) {
        let mut manager = ControllerManager::new();
        let device = SimController::new("sim", kind);
        let handle = device.handle();
        manager.open_controller(device, ControllerConfig::for_kind(kind)).unwrap();
        (manager, handle)
    }

    fn input(sequence_num: u32, rumble_left: u8, rumble_right: u8, led: Rgb) -> ControllerInputFrame {
        ControllerInputFrame {
            controller_id: 0,
            sequence_num,
            rumble_left,
            rumble_right,
            led,
        }
    }

    #[test]
    fn position_stream_holds_a_tracking_listener() {
        let (mut manager, handle) = manager_with(ControllerKind::Move);
        let mut conn = ConnectionStreams::new();
        conn.start_controller_stream(&mut manager, 0, POSITION).unwrap();
        assert!(manager.view(0).unwrap().is_tracking_enabled());
        assert_eq!(handle.led(), TrackingColorId::Magenta.rgb());

        conn.stop_controller_stream(&mut manager, 0).unwrap();
        assert!(!manager.view(0).unwrap().is_tracking_enabled());
        assert!(conn.stream_info(0).is_none());
    }

    #[test]
    fn stream_without_position_does_not_track() {
        let (mut manager, _) = manager_with(ControllerKind::Move);
        let mut conn = ConnectionStreams::new();
        conn.start_controller_stream(&mut manager, 0, StreamFlags::default()).unwrap();
        assert!(!manager.view(0).unwrap().is_tracking_enabled());
    }

    #[test]
    fn restarting_a_stream_does_not_leak_listeners() {
        let (mut manager, _) = manager_with(ControllerKind::Move);
        let mut conn = ConnectionStreams::new();
        conn.start_controller_stream(&mut manager, 0, POSITION).unwrap();
        conn.start_controller_stream(&mut manager, 0, POSITION).unwrap();
        assert_eq!(manager.view(0).unwrap().listener_count(), 1);
    }

    #[test]
    fn stream_on_closed_controller_fails() {
        let mut manager = ControllerManager::new();
        let mut conn = ConnectionStreams::new();
        assert_eq!(
            conn.start_controller_stream(&mut manager, 0, POSITION),
            Err(TrackingError::DeviceNotOpen)
        );
        assert_eq!(
            conn.start_controller_stream(&mut manager, 42, POSITION),
            Err(TrackingError::InvalidControllerId(42))
        );
    }

    #[test]
    fn stale_input_frames_are_dropped() {
        let (mut manager, handle) = manager_with(ControllerKind::Move);
        let mut conn = ConnectionStreams::new();
        conn.start_controller_stream(&mut manager, 0, POSITION).unwrap();

        assert!(conn.handle_input_frame(&mut manager, &input(5, 255, 0, Rgb::OFF)).unwrap());
        assert_eq!(handle.rumble(), (1.0, 1.0));
        assert!(!conn.handle_input_frame(&mut manager, &input(5, 0, 0, Rgb::OFF)).unwrap());
        assert!(!conn.handle_input_frame(&mut manager, &input(4, 0, 0, Rgb::OFF)).unwrap());
        assert_eq!(handle.rumble(), (1.0, 1.0));
        assert_eq!(conn.stream_info(0).unwrap().last_input_sequence_num, Some(5));
    }

    #[test]
    fn input_without_stream_is_ignored() {
        let (mut manager, handle) = manager_with(ControllerKind::Move);
        let mut conn = ConnectionStreams::new();
        assert!(!conn.handle_input_frame(&mut manager, &input(1, 255, 0, Rgb::OFF)).unwrap());
        assert_eq!(handle.rumble(), (0.0, 0.0));
    }

    #[test]
    fn dualshock_rumble_uses_both_motors() {
        let (mut manager, handle) = manager_with(ControllerKind::DualShock4);
        let mut conn = ConnectionStreams::new();
        conn.start_controller_stream(&mut manager, 0, StreamFlags::default()).unwrap();
        conn.handle_input_frame(&mut manager, &input(1, 255, 51, Rgb::OFF)).unwrap();
        let (left, right) = handle.rumble();
        assert_eq!(left, 1.0);
        assert_relative_eq!(right, 0.2, epsilon = 1e-6);
    }

    #[test]
    fn led_triple_sets_and_black_clears_override() {
        let (mut manager, handle) = manager_with(ControllerKind::Move);
        let mut conn = ConnectionStreams::new();
        conn.start_controller_stream(&mut manager, 0, POSITION).unwrap();

        conn.handle_input_frame(&mut manager, &input(1, 0, 0, Rgb::new(0, 0, 80))).unwrap();
        assert!(manager.view(0).unwrap().is_led_override_active());
        assert!(conn.stream_info(0).unwrap().led_override_active);
        assert_eq!(handle.led(), Rgb::new(0, 0, 80));

        conn.handle_input_frame(&mut manager, &input(2, 0, 0, Rgb::OFF)).unwrap();
        assert!(!manager.view(0).unwrap().is_led_override_active());
        assert_eq!(handle.led(), TrackingColorId::Magenta.rgb());
    }

    #[test]
    fn disconnect_releases_everything_the_connection_held() {
        let mut manager = ControllerManager::new();
        for serial in ["a", "b"] {
            manager
                .open_controller(SimController::new(serial, ControllerKind::Move), ControllerConfig::default())
                .unwrap();
        }
        let mut conn = ConnectionStreams::new();
        conn.start_controller_stream(&mut manager, 0, POSITION).unwrap();
        conn.start_controller_stream(&mut manager, 1, POSITION).unwrap();
        conn.handle_input_frame(&mut manager, &input(1, 0, 0, Rgb::new(9, 9, 9))).unwrap();

        conn.connection_stopped(&mut manager);
        assert_eq!(conn.active_streams().count(), 0);
        for id in [0, 1] {
            let view = manager.view(id).unwrap();
            assert!(!view.is_tracking_enabled());
            assert!(!view.is_led_override_active());
        }
    }

    #[test]
    fn navi_input_frames_skip_rumble() {
        let (mut manager, handle) = manager_with(ControllerKind::Navi);
        handle.fail_rumble_writes(true);
        let mut conn = ConnectionStreams::new();
        conn.start_controller_stream(&mut manager, 0, StreamFlags::default()).unwrap();
        assert_eq!(conn.handle_input_frame(&mut manager, &input(1, 255, 255, Rgb::OFF)), Ok(true));
        assert_eq!(handle.rumble(), (0.0, 0.0));
    }

    #[test]
    fn stream_frame_carries_only_requested_data() {
        let (mut manager, handle) = manager_with(ControllerKind::Move);
        let mut conn = ConnectionStreams::new();
        conn.start_controller_stream(&mut manager, 0, StreamFlags::default()).unwrap();
        handle.push_sample(ImuSample::default());
        manager.update_state_and_predict_at(Instant::now());

        let frame = conn.stream_frame(&manager, 0).unwrap().unwrap();
        assert_eq!(frame.sequence_num, 1);
        assert_eq!(frame.position, None);
        assert_eq!(frame.physics, None);
        assert_eq!(frame.raw_sensor, None);
        assert_eq!(frame.calibrated_sensor, None);
        assert_eq!(frame.raw_trackers, None);
        assert!(conn.stream_frame(&manager, 1).unwrap().is_none());
    }

    #[test]
    fn stream_frame_includes_flagged_data() {
        let (mut manager, handle) = manager_with(ControllerKind::Move);
        let mut conn = ConnectionStreams::new();
        let everything = StreamFlags {
            include_position_data: true,
            include_physics_data: true,
            include_raw_sensor_data: true,
            include_calibrated_sensor_data: true,
            include_raw_tracker_data: true,
        };
        conn.start_controller_stream(&mut manager, 0, everything).unwrap();

        let trackers = SimTrackerSource::new(2);
        trackers.show(1, TrackingColorId::Magenta.rgb(), sphere_estimate(Vector3::new(0.0, 0.0, 40.0), 0.2));
        let sample = ImuSample {
            accelerometer: Vector3::new(0.0, 1.0, 0.0),
            ..ImuSample::default()
        };
        handle.push_sample(sample);
        manager.process_frame_at(&trackers, Instant::now());

        let frames = conn.stream_frames(&manager);
        assert_eq!(frames.len(), 1);
        let frame = &frames[0];
        assert_eq!(frame.position, Some(Vector3::new(0.0, 0.0, 40.0)));
        assert!(frame.physics.is_some());
        assert_eq!(frame.raw_sensor, Some(sample));
        assert!(frame.calibrated_sensor.is_some());
        let raw_trackers = frame.raw_trackers.as_ref().unwrap();
        assert_eq!(raw_trackers.len(), 1);
        assert_eq!(raw_trackers[0].0, 1);
        assert_eq!(raw_trackers[0].1.position, Vector3::new(0.0, 0.0, 40.0));
    }

    #[test]
    fn set_tracking_color_claims_through_manager() {
        let mut manager = ControllerManager::new();
        for serial in ["a", "b"] {
            manager
                .open_controller(SimController::new(serial, ControllerKind::Move), ControllerConfig::default())
                .unwrap();
        }
        let conn = ConnectionStreams::new();
        conn.set_tracking_color(&mut manager, 1, TrackingColorId::Magenta).unwrap();
        assert_eq!(manager.view(1).unwrap().tracking_color_id(), Some(TrackingColorId::Magenta));
        assert_eq!(manager.view(0).unwrap().tracking_color_id(), None);
    }
}
