//! [`OpticalPoseEstimation`] – one tracker's (or the fused) view of a
//! controller, with staleness bookkeeping.
//!
//! A record is refreshed every frame the tracker sees the controller.  When
//! the tracker loses sight of it the last values are kept and advertised as
//! not-current; once nothing has been seen for longer than the staleness
//! threshold the record is invalidated outright.

use std::time::{Duration, Instant};

use glowtrack_types::{TrackerEstimate, TrackingProjection};
use nalgebra::{UnitQuaternion, Vector3};
use tracing::trace;

/// Default age after which an unrefreshed record is invalidated.
pub const DEFAULT_STALENESS_THRESHOLD: Duration = Duration::from_millis(200);

/// Added to the squared residual before inverting so a perfect triangulation
/// does not produce an infinite weight.
pub const RESIDUAL_EPSILON: f32 = 1e-3;

/// Residuals are clamped here before weighting so the squared residual, and
/// a sum of the resulting weights, stays finite and above zero.
pub const MAX_RESIDUAL: f32 = 1e6;

/// Fusion weight for a triangulation residual: `1 / (residual² + ε)`.
pub fn residual_weight(residual: f32) -> f32 {
    let residual = if residual.is_finite() { residual.abs().min(MAX_RESIDUAL) } else { MAX_RESIDUAL };
    1.0 / (residual * residual + RESIDUAL_EPSILON)
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpticalPoseEstimation {
    /// cm, tracking space.
    pub position: Vector3<f32>,
    pub projection: TrackingProjection,
    pub orientation: UnitQuaternion<f32>,
    pub orientation_valid: bool,
    /// cm
    pub residual: f32,
    currently_tracking: bool,
    last_update: Option<Instant>,
    last_visible: Option<Instant>,
}

impl Default for OpticalPoseEstimation {
    fn default() -> Self {
        Self {
            position: Vector3::zeros(),
            projection: TrackingProjection::Invalid,
            orientation: UnitQuaternion::identity(),
            orientation_valid: false,
            residual: 0.0,
            currently_tracking: false,
            last_update: None,
            last_visible: None,
        }
    }
}

impl OpticalPoseEstimation {
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` only if the controller was seen during the current frame.
    pub fn is_currently_tracking(&self) -> bool {
        self.currently_tracking
    }

    /// `true` while the stored position and timestamps mean something.
    pub fn timestamps_valid(&self) -> bool {
        self.last_visible.is_some()
    }

    pub fn last_update(&self) -> Option<Instant> {
        self.last_update
    }

    pub fn last_visible(&self) -> Option<Instant> {
        self.last_visible
    }

    /// Time since the controller was last seen, `None` if never seen since the
    /// last invalidation.
    pub fn time_since_visible(&self, now: Instant) -> Option<Duration> {
        self.last_visible.map(|t| now.saturating_duration_since(t))
    }

    /// `true` once the record has gone unseen for longer than `threshold`.
    pub fn is_stale(&self, now: Instant, threshold: Duration) -> bool {
        self.time_since_visible(now).is_some_and(|age| age > threshold)
    }

    pub fn weight(&self) -> f32 {
        residual_weight(self.residual)
    }

    /// Refresh from a tracker that sees the controller this frame.
    pub fn observe(&mut self, estimate: &TrackerEstimate, now: Instant) {
        self.position = estimate.position;
        self.projection = estimate.projection;
        self.residual = estimate.residual;
        match estimate.orientation {
            Some(orientation) => {
                self.orientation = orientation;
                self.orientation_valid = true;
            }
            None => self.orientation_valid = false,
        }
        self.currently_tracking = true;
        self.last_update = Some(now);
        self.last_visible = Some(now);
    }

    /// The tracker did not see the controller this frame.  Stored values are
    /// kept until they are older than `threshold`.
    pub fn mark_unseen(&mut self, now: Instant, threshold: Duration) {
        self.currently_tracking = false;
        if self.is_stale(now, threshold) {
            trace!(?threshold, "Optical estimate went stale");
            self.invalidate();
        } else if self.last_visible.is_some() {
            self.last_update = Some(now);
        }
    }

    /// Clear position and orientation and drop the timestamps.
    pub fn invalidate(&mut self) {
        *self = Self::default();
    }

    /// Overwrite this record with fused values seen at `now`.
    pub(crate) fn adopt(
        &mut self,
        position: Vector3<f32>,
        projection: TrackingProjection,
        orientation: Option<UnitQuaternion<f32>>,
        residual: f32,
        now: Instant,
    ) {
        self.observe(
            &TrackerEstimate {
                position,
                projection,
                orientation,
                residual,
            },
            now,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seen_at(z: f32) -> TrackerEstimate {
        TrackerEstimate {
            position: Vector3::new(0.0, 0.0, z),
            projection: TrackingProjection::Invalid,
            orientation: None,
            residual: 0.5,
        }
    }

    #[test]
    fn new_record_is_invalid() {
        let record = OpticalPoseEstimation::new();
        assert!(!record.is_currently_tracking());
        assert!(!record.timestamps_valid());
        assert!(!record.is_stale(Instant::now(), Duration::ZERO));
    }

    #[test]
    fn observe_refreshes_everything() {
        let now = Instant::now();
        let mut record = OpticalPoseEstimation::new();
        record.observe(&seen_at(1.0), now);
        assert!(record.is_currently_tracking());
        assert_eq!(record.position, Vector3::new(0.0, 0.0, 1.0));
        assert_eq!(record.last_update(), Some(now));
        assert_eq!(record.last_visible(), Some(now));
        assert!(!record.orientation_valid);
    }

    #[test]
    fn unseen_keeps_values_until_threshold() {
        let start = Instant::now();
        let threshold = Duration::from_millis(100);
        let mut record = OpticalPoseEstimation::new();
        record.observe(&seen_at(3.0), start);

        let soon = start + Duration::from_millis(50);
        record.mark_unseen(soon, threshold);
        assert!(!record.is_currently_tracking());
        assert!(record.timestamps_valid());
        assert_eq!(record.position.z, 3.0);
        assert_eq!(record.last_visible(), Some(start));
        assert_eq!(record.last_update(), Some(soon));
        assert!(record.last_visible() <= record.last_update());

        record.mark_unseen(start + Duration::from_millis(150), threshold);
        assert!(!record.timestamps_valid());
        assert_eq!(record.position, Vector3::zeros());
        assert!(!record.orientation_valid);
    }

    #[test]
    fn staleness_is_monotone_without_refresh() {
        let start = Instant::now();
        let threshold = Duration::from_millis(100);
        let mut record = OpticalPoseEstimation::new();
        record.observe(&seen_at(1.0), start);

        let mut was_stale = false;
        for ms in (0..400).step_by(10) {
            let now = start + Duration::from_millis(ms);
            let stale = record.is_stale(now, threshold);
            assert!(!was_stale || stale, "record became fresh again at {ms} ms");
            was_stale = stale;
        }
        assert!(was_stale);
    }

    #[test]
    fn missing_orientation_keeps_last_value_but_invalidates() {
        let now = Instant::now();
        let mut record = OpticalPoseEstimation::new();
        let q = UnitQuaternion::from_euler_angles(0.1, 0.2, 0.3);
        record.observe(
            &TrackerEstimate {
                orientation: Some(q),
                ..seen_at(1.0)
            },
            now,
        );
        assert!(record.orientation_valid);
        record.observe(&seen_at(1.0), now);
        assert!(!record.orientation_valid);
        assert_eq!(record.orientation, q);
    }

    #[test]
    fn weight_decreases_with_residual() {
        assert!(residual_weight(0.0) > residual_weight(0.1));
        assert!(residual_weight(0.1) > residual_weight(1.0));
        assert!(residual_weight(0.0).is_finite());
        assert!(residual_weight(f32::NAN) > 0.0);
    }

    #[test]
    fn huge_residual_keeps_a_positive_weight() {
        for residual in [1e20, f32::MAX, f32::INFINITY] {
            let w = residual_weight(residual);
            assert!(w > 0.0 && w.is_finite(), "{residual}: {w}");
        }
        assert_eq!(residual_weight(1e20), residual_weight(MAX_RESIDUAL));
    }
}
