//! [`ControllerManager`] – the fixed set of controller slots and the tracking
//! colors they hold.
//!
//! The manager owns one [`ControllerView`] per slot, hands out tracking
//! colors so that no two controllers glow the same, and drives the per-frame
//! update of every open controller.
//!
//! # Frame order
//!
//! [`process_frame`][ControllerManager::process_frame] runs the optical pass
//! for every controller before any filter update, so each controller fuses
//! the tracker data of the same camera frame.

use std::time::Instant;

use glowtrack_hal::controller::ControllerDevice;
use glowtrack_hal::tracker::TrackerSource;
use glowtrack_types::{MAX_CONTROLLERS, TrackingColorId, TrackingError};
use tracing::{debug, info, warn};

use crate::config::ControllerConfig;
use crate::controller_view::ControllerView;
use crate::device_view::DeviceView;
use crate::publisher::FramePublisher;

pub struct ControllerManager {
    views: Vec<ControllerView>,
}

impl Default for ControllerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ControllerManager {
    /// Create `MAX_CONTROLLERS` closed slots.
    pub fn new() -> Self {
        Self {
            views: (0..MAX_CONTROLLERS)
                .map(|id| ControllerView::new(id, ControllerConfig::default()))
                .collect(),
        }
    }

    /// # Errors
    ///
    /// Returns [`TrackingError::InvalidControllerId`] for an id past the last
    /// slot.
    pub fn view(&self, controller_id: usize) -> Result<&ControllerView, TrackingError> {
        self.views
            .get(controller_id)
            .ok_or(TrackingError::InvalidControllerId(controller_id))
    }

    /// # Errors
    ///
    /// Returns [`TrackingError::InvalidControllerId`] for an id past the last
    /// slot.
    pub fn view_mut(&mut self, controller_id: usize) -> Result<&mut ControllerView, TrackingError> {
        self.views
            .get_mut(controller_id)
            .ok_or(TrackingError::InvalidControllerId(controller_id))
    }

    pub fn open_views(&self) -> impl Iterator<Item = &ControllerView> {
        self.views.iter().filter(|v| v.is_open())
    }

    pub fn open_count(&self) -> usize {
        self.open_views().count()
    }

    // ── Lifecycle ───────────────────────────────────────────────────────────

    /// Open `device` in the first free slot and return its controller id.
    ///
    /// # Errors
    ///
    /// Returns [`TrackingError::HardwareFault`] when every slot is taken.
    pub fn open_controller(
        &mut self,
        device: Box<dyn ControllerDevice>,
        config: ControllerConfig,
    ) -> Result<usize, TrackingError> {
        let controller_id = self
            .views
            .iter()
            .position(|v| !v.is_open())
            .ok_or_else(|| TrackingError::HardwareFault {
                component: device.serial().to_string(),
                details: format!("all {MAX_CONTROLLERS} controller slots are in use"),
            })?;
        self.open_controller_at(controller_id, device, config)?;
        Ok(controller_id)
    }

    /// Open `device` in slot `controller_id`.  Bulb-carrying controllers get
    /// the configured color when it is free, otherwise the first free color
    /// in preset order.
    ///
    /// # Errors
    ///
    /// Returns [`TrackingError::InvalidControllerId`] for a bad slot or
    /// [`TrackingError::AlreadyOpen`] when the slot is in use.
    pub fn open_controller_at(
        &mut self,
        controller_id: usize,
        device: Box<dyn ControllerDevice>,
        config: ControllerConfig,
    ) -> Result<(), TrackingError> {
        let has_bulb = device.kind().has_bulb();
        let requested = config.tracking_color;

        let view = self.view_mut(controller_id)?;
        if view.is_open() {
            return Err(TrackingError::AlreadyOpen);
        }
        view.apply_config(config);
        view.set_tracking_color_id(None);
        view.open(device)?;

        if has_bulb {
            let color = requested
                .filter(|&c| self.holder_of(c).is_none())
                .or_else(|| self.first_free_color());
            match color {
                Some(color) => {
                    self.views[controller_id].set_tracking_color_id(Some(color));
                    info!(controller_id, ?color, "Tracking color assigned");
                }
                None => warn!(controller_id, "No free tracking color; controller cannot be tracked"),
            }
        }
        Ok(())
    }

    /// Close slot `controller_id` and release its color.
    ///
    /// # Errors
    ///
    /// Returns [`TrackingError::InvalidControllerId`] or
    /// [`TrackingError::DeviceNotOpen`].
    pub fn close_controller(&mut self, controller_id: usize) -> Result<(), TrackingError> {
        let view = self.view_mut(controller_id)?;
        view.close()?;
        view.set_tracking_color_id(None);
        Ok(())
    }

    // ── Tracking colors ─────────────────────────────────────────────────────

    /// Give `color` to `controller_id`, taking it from whichever controller
    /// held it before.
    ///
    /// # Errors
    ///
    /// Returns [`TrackingError::InvalidControllerId`] for a bad slot.
    pub fn claim_tracking_color_id(
        &mut self,
        controller_id: usize,
        color: TrackingColorId,
    ) -> Result<(), TrackingError> {
        self.view(controller_id)?;
        if let Some(previous) = self.holder_of(color).filter(|&id| id != controller_id) {
            debug!(from = previous, to = controller_id, ?color, "Tracking color reassigned");
            self.views[previous].set_tracking_color_id(None);
        }
        self.views[controller_id].set_tracking_color_id(Some(color));
        Ok(())
    }

    /// Release `color` from whichever controller holds it.
    pub fn free_tracking_color_id(&mut self, color: TrackingColorId) {
        if let Some(holder) = self.holder_of(color) {
            self.views[holder].set_tracking_color_id(None);
        }
    }

    /// First color in preset order that no controller holds.
    pub fn first_free_color(&self) -> Option<TrackingColorId> {
        TrackingColorId::ALL
            .into_iter()
            .find(|&color| self.holder_of(color).is_none())
    }

    fn holder_of(&self, color: TrackingColorId) -> Option<usize> {
        self.views
            .iter()
            .position(|v| v.tracking_color_id() == Some(color))
    }

    // ── Per-frame drive ─────────────────────────────────────────────────────

    pub fn update_optical_pose_estimations(&mut self, tracker: &dyn TrackerSource) {
        self.update_optical_pose_estimations_at(tracker, Instant::now());
    }

    pub fn update_optical_pose_estimations_at(&mut self, tracker: &dyn TrackerSource, now: Instant) {
        for view in self.views.iter_mut().filter(|v| v.is_open()) {
            view.update_optical_pose_estimation_at(tracker, now);
        }
    }

    /// Returns how many controllers had a new sample.
    pub fn update_state_and_predict(&mut self) -> usize {
        self.update_state_and_predict_at(Instant::now())
    }

    pub fn update_state_and_predict_at(&mut self, now: Instant) -> usize {
        self.views
            .iter_mut()
            .filter(|v| v.is_open())
            .map(|v| v.update_state_and_predict_at(now))
            .filter(|&updated| updated)
            .count()
    }

    /// Optical pass for every controller, then every filter update.
    pub fn process_frame(&mut self, tracker: &dyn TrackerSource) -> usize {
        self.process_frame_at(tracker, Instant::now())
    }

    pub fn process_frame_at(&mut self, tracker: &dyn TrackerSource, now: Instant) -> usize {
        self.update_optical_pose_estimations_at(tracker, now);
        self.update_state_and_predict_at(now)
    }

    /// Publish one frame per open controller.  A failing publish is logged and
    /// the remaining controllers still publish.  Returns the number of frames
    /// handed on.
    pub fn publish_frames(&self, publisher: &dyn FramePublisher) -> usize {
        let mut published = 0;
        for view in self.open_views() {
            match view.publish_frame(publisher) {
                Ok(()) => published += 1,
                Err(e) => warn!(controller_id = view.controller_id(), error = %e, "Frame publish failed"),
            }
        }
        published
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glowtrack_hal::controller::ImuSample;
    use glowtrack_hal::sim::{SimController, SimTrackerSource, sphere_estimate};
    use glowtrack_types::{ControllerFrame, ControllerKind};
    use nalgebra::Vector3;
    use std::sync::Mutex;
    use std::time::Duration;

    fn open_moves(manager: &mut ControllerManager, count: usize) -> Vec<usize> {
        (0..count)
            .map(|i| {
                manager
                    .open_controller(
                        SimController::new(format!("move-{i}"), ControllerKind::Move),
                        ControllerConfig::for_kind(ControllerKind::Move),
                    )
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn open_assigns_slots_and_colors_in_order() {
        let mut manager = ControllerManager::new();
        let ids = open_moves(&mut manager, 3);
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(manager.view(0).unwrap().tracking_color_id(), Some(TrackingColorId::Magenta));
        assert_eq!(manager.view(1).unwrap().tracking_color_id(), Some(TrackingColorId::Cyan));
        assert_eq!(manager.view(2).unwrap().tracking_color_id(), Some(TrackingColorId::Yellow));
        assert_eq!(manager.open_count(), 3);
    }

    #[test]
    fn configured_color_is_honored_when_free() {
        let mut manager = ControllerManager::new();
        let config = ControllerConfig {
            tracking_color: Some(TrackingColorId::Green),
            ..ControllerConfig::default()
        };
        let a = manager
            .open_controller(SimController::new("a", ControllerKind::Move), config.clone())
            .unwrap();
        let b = manager
            .open_controller(SimController::new("b", ControllerKind::Move), config)
            .unwrap();
        assert_eq!(manager.view(a).unwrap().tracking_color_id(), Some(TrackingColorId::Green));
        assert_eq!(manager.view(b).unwrap().tracking_color_id(), Some(TrackingColorId::Magenta));
    }

    #[test]
    fn navi_gets_no_color() {
        let mut manager = ControllerManager::new();
        let id = manager
            .open_controller(
                SimController::new("navi", ControllerKind::Navi),
                ControllerConfig::for_kind(ControllerKind::Navi),
            )
            .unwrap();
        assert_eq!(manager.view(id).unwrap().tracking_color_id(), None);
        assert_eq!(manager.first_free_color(), Some(TrackingColorId::Magenta));
    }

    #[test]
    fn slots_run_out() {
        let mut manager = ControllerManager::new();
        open_moves(&mut manager, MAX_CONTROLLERS);
        let err = manager
            .open_controller(SimController::new("extra", ControllerKind::Move), ControllerConfig::default())
            .unwrap_err();
        assert!(matches!(err, TrackingError::HardwareFault { .. }));
    }

    #[test]
    fn opening_an_open_slot_fails() {
        let mut manager = ControllerManager::new();
        open_moves(&mut manager, 1);
        let err = manager
            .open_controller_at(0, SimController::new("x", ControllerKind::Move), ControllerConfig::default())
            .unwrap_err();
        assert_eq!(err, TrackingError::AlreadyOpen);
    }

    #[test]
    fn close_frees_color_for_next_controller() {
        let mut manager = ControllerManager::new();
        open_moves(&mut manager, 2);
        manager.close_controller(0).unwrap();
        assert_eq!(manager.view(0).unwrap().tracking_color_id(), None);
        assert_eq!(manager.first_free_color(), Some(TrackingColorId::Magenta));

        let id = open_moves(&mut manager, 1)[0];
        assert_eq!(id, 0);
        assert_eq!(manager.view(0).unwrap().tracking_color_id(), Some(TrackingColorId::Magenta));
    }

    #[test]
    fn claiming_a_held_color_takes_it_from_holder() {
        let mut manager = ControllerManager::new();
        open_moves(&mut manager, 2);
        manager.claim_tracking_color_id(1, TrackingColorId::Magenta).unwrap();
        assert_eq!(manager.view(1).unwrap().tracking_color_id(), Some(TrackingColorId::Magenta));
        assert_eq!(manager.view(0).unwrap().tracking_color_id(), None);

        manager.free_tracking_color_id(TrackingColorId::Magenta);
        assert_eq!(manager.view(1).unwrap().tracking_color_id(), None);
    }

    #[test]
    fn bad_controller_id_is_reported() {
        let mut manager = ControllerManager::new();
        assert_eq!(
            manager.claim_tracking_color_id(MAX_CONTROLLERS, TrackingColorId::Red),
            Err(TrackingError::InvalidControllerId(MAX_CONTROLLERS))
        );
        assert!(manager.view(99).is_err());
        assert_eq!(manager.close_controller(0), Err(TrackingError::DeviceNotOpen));
    }

    #[test]
    fn process_frame_updates_every_open_controller() {
        let mut manager = ControllerManager::new();
        let a = SimController::new("a", ControllerKind::Move);
        let b = SimController::new("b", ControllerKind::Move);
        let (ha, hb) = (a.handle(), b.handle());
        manager.open_controller(a, ControllerConfig::default()).unwrap();
        manager.open_controller(b, ControllerConfig::default()).unwrap();
        manager.view_mut(0).unwrap().start_tracking();

        let trackers = SimTrackerSource::new(2);
        trackers.show(0, TrackingColorId::Magenta.rgb(), sphere_estimate(Vector3::new(0.0, 0.0, 1.0), 0.1));

        ha.push_sample(ImuSample::default());
        hb.push_sample(ImuSample::default());
        assert_eq!(manager.process_frame_at(&trackers, Instant::now()), 2);
        assert!(manager.view(0).unwrap().is_currently_tracking());
        assert!(!manager.view(1).unwrap().is_currently_tracking());
        assert_eq!(
            manager.view(0).unwrap().filtered_pose(0.0).position,
            Vector3::new(0.0, 0.0, 1.0)
        );

        assert_eq!(manager.update_state_and_predict_at(Instant::now()), 0);
    }

    #[test]
    fn configured_position_smoothing_applies_to_opened_controllers() {
        let mut manager = ControllerManager::new();
        let device = SimController::new("a", ControllerKind::Move);
        let handle = device.handle();
        let config = ControllerConfig {
            position_smoothing: 0.0,
            ..ControllerConfig::default()
        };
        let id = manager.open_controller(device, config).unwrap();
        manager.view_mut(id).unwrap().start_tracking();

        let trackers = SimTrackerSource::new(1);
        let color = TrackingColorId::Magenta.rgb();
        let t0 = Instant::now();
        for (i, z) in [10.0, 20.0].into_iter().enumerate() {
            trackers.show(0, color, sphere_estimate(Vector3::new(0.0, 0.0, z), 0.1));
            handle.push_sample(ImuSample::default());
            manager.process_frame_at(&trackers, t0 + Duration::from_millis(10 * i as u64));
        }
        let z = manager.view(id).unwrap().filtered_pose(0.0).position.z;
        assert!((z - 20.0).abs() < 1e-4, "{z}");
    }

    struct Recorder(Mutex<Vec<ControllerFrame>>);

    impl FramePublisher for Recorder {
        fn publish(&self, frame: ControllerFrame) -> Result<(), TrackingError> {
            if frame.controller_id == 1 {
                return Err(TrackingError::Publish("sink full".to_string()));
            }
            self.0.lock().unwrap().push(frame);
            Ok(())
        }
    }

    #[test]
    fn publish_continues_past_failures() {
        let mut manager = ControllerManager::new();
        open_moves(&mut manager, 3);
        let recorder = Recorder(Mutex::new(Vec::new()));
        assert_eq!(manager.publish_frames(&recorder), 2);
        let ids: Vec<usize> = recorder.0.lock().unwrap().iter().map(|f| f.controller_id).collect();
        assert_eq!(ids, vec![0, 2]);
    }
}
