//! [`OpticalEstimates`] – the per-tracker records and the fused multicam
//! record of one controller.
//!
//! The bank is allocated as a unit when a controller opens and dropped as a
//! unit when it closes.  Each frame the orchestrator feeds it one
//! observation per tracker slot and then asks it to refresh the multicam
//! record.

use std::time::{Duration, Instant};

use glowtrack_types::{MAX_TRACKERS, TrackerEstimate};
use tracing::{debug, trace};

use crate::estimate::{DEFAULT_STALENESS_THRESHOLD, OpticalPoseEstimation};
use crate::multicam;

/// What happened to the multicam record during [`OpticalEstimates::update_multicam`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MulticamTransition {
    /// Still seen, or still unseen.
    Unchanged,
    /// Seen again after having been invalidated (or for the first time).
    Reacquired,
    /// No tracker saw the controller this frame; old values are retained.
    Lost,
    /// Unseen for longer than the staleness threshold; values cleared.
    Invalidated,
}

#[derive(Debug, Clone)]
pub struct OpticalEstimates {
    trackers: [OpticalPoseEstimation; MAX_TRACKERS],
    multicam: OpticalPoseEstimation,
    staleness_threshold: Duration,
}

impl Default for OpticalEstimates {
    fn default() -> Self {
        Self::new(DEFAULT_STALENESS_THRESHOLD)
    }
}

impl OpticalEstimates {
    pub fn new(staleness_threshold: Duration) -> Self {
        Self {
            trackers: std::array::from_fn(|_| OpticalPoseEstimation::new()),
            multicam: OpticalPoseEstimation::new(),
            staleness_threshold,
        }
    }

    pub fn staleness_threshold(&self) -> Duration {
        self.staleness_threshold
    }

    pub fn set_staleness_threshold(&mut self, threshold: Duration) {
        self.staleness_threshold = threshold;
    }

    /// Per-tracker record, `None` for an out-of-range id.
    pub fn tracker(&self, tracker_id: usize) -> Option<&OpticalPoseEstimation> {
        self.trackers.get(tracker_id)
    }

    pub fn trackers(&self) -> &[OpticalPoseEstimation] {
        &self.trackers
    }

    pub fn multicam(&self) -> &OpticalPoseEstimation {
        &self.multicam
    }

    /// Record what tracker `tracker_id` saw this frame.  Out-of-range ids are
    /// ignored.
    pub fn observe(&mut self, tracker_id: usize, estimate: Option<&TrackerEstimate>, now: Instant) {
        let threshold = self.staleness_threshold;
        let Some(record) = self.trackers.get_mut(tracker_id) else {
            trace!(tracker_id, "Ignoring observation from tracker beyond capacity");
            return;
        };
        match estimate {
            Some(estimate) => record.observe(estimate, now),
            None => record.mark_unseen(now, threshold),
        }
    }

    /// Re-fuse the multicam record from the per-tracker records.
    pub fn update_multicam(&mut self, now: Instant) -> MulticamTransition {
        let was_valid = self.multicam.timestamps_valid();
        let was_tracking = self.multicam.is_currently_tracking();

        match multicam::fuse(self.trackers.iter()) {
            Some(fused) => {
                self.multicam
                    .adopt(fused.position, fused.projection, fused.orientation, fused.residual, now);
                if was_valid {
                    MulticamTransition::Unchanged
                } else {
                    debug!(position = ?fused.position, "Multicam estimate acquired");
                    MulticamTransition::Reacquired
                }
            }
            None => {
                self.multicam.mark_unseen(now, self.staleness_threshold);
                if was_valid && !self.multicam.timestamps_valid() {
                    debug!("Multicam estimate invalidated after staleness threshold");
                    MulticamTransition::Invalidated
                } else if was_tracking {
                    MulticamTransition::Lost
                } else {
                    MulticamTransition::Unchanged
                }
            }
        }
    }

    /// Clear every record.
    pub fn invalidate_all(&mut self) {
        for record in &mut self.trackers {
            record.invalidate();
        }
        self.multicam.invalidate();
    }
}
