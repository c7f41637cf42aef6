//! Generic `TrackerSource` trait for the camera triangulation pipeline.

use glowtrack_types::{Rgb, TrackerEstimate, TrackingShape};

/// Shared access to the latest completed triangulation of every tracking
/// camera.
///
/// One source serves every controller, possibly from several threads, so
/// queries go through `&self` and must not block on frame capture.
pub trait TrackerSource: Send + Sync {
    /// Number of tracker slots currently driven.
    fn tracker_count(&self) -> usize;

    /// Where tracker `tracker_id` last saw a light source of `shape` glowing
    /// `color`, or `None` if it did not see one.
    fn query_estimate(&self, tracker_id: usize, shape: &TrackingShape, color: Rgb) -> Option<TrackerEstimate>;
}
