//! Multicam fusion: combines every currently-tracking per-tracker record
//! into one estimate.
//!
//! Positions are averaged with inverse-variance weights
//! ([`residual_weight`][crate::estimate::residual_weight]).  Orientations
//! from trackers that resolved one are averaged the same way after aligning
//! quaternion signs.  The projection is taken from the single most trusted
//! tracker.
//!
//! Contributions are sorted into a canonical order before anything is summed,
//! so the result is bit-identical for any permutation of the input.

use std::cmp::Ordering;

use glowtrack_types::TrackingProjection;
use nalgebra::{Quaternion, UnitQuaternion, Vector3};

use crate::estimate::{MAX_RESIDUAL, OpticalPoseEstimation};

/// Result of fusing two or more tracker records.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusedEstimate {
    pub position: Vector3<f32>,
    pub projection: TrackingProjection,
    /// `None` when no contributor resolved orientation.
    pub orientation: Option<UnitQuaternion<f32>>,
    /// Combined residual, `1 / sqrt(Σ w)`.
    pub residual: f32,
}

/// Fuse `records`.  Records that are not currently tracking are ignored;
/// `None` when none are.
///
/// A single tracking record is adopted verbatim.
pub fn fuse<'a, I>(records: I) -> Option<FusedEstimate>
where
    I: IntoIterator<Item = &'a OpticalPoseEstimation>,
{
    let mut tracking: Vec<&OpticalPoseEstimation> = records
        .into_iter()
        .filter(|r| r.is_currently_tracking())
        .collect();

    match tracking.as_slice() {
        [] => None,
        [only] => Some(FusedEstimate {
            position: only.position,
            projection: only.projection,
            orientation: only.orientation_valid.then_some(only.orientation),
            residual: only.residual,
        }),
        _ => {
            tracking.sort_by(|a, b| canonical_order(a, b));
            Some(fuse_sorted(&tracking))
        }
    }
}

fn fuse_sorted(records: &[&OpticalPoseEstimation]) -> FusedEstimate {
    let mut weight_sum = 0.0_f32;
    let mut weighted_position = Vector3::zeros();
    for record in records {
        let w = record.weight();
        weight_sum += w;
        weighted_position += record.position * w;
    }

    // First in canonical order wins weight ties.
    let mut best = records[0];
    for &record in &records[1..] {
        if record.weight() > best.weight() {
            best = record;
        }
    }

    // Unweighted mean if the weights degenerate.
    let (position, residual) = if weight_sum.is_finite() && weight_sum > 0.0 {
        (weighted_position / weight_sum, 1.0 / weight_sum.sqrt())
    } else {
        let mean = records.iter().map(|r| r.position).sum::<Vector3<f32>>() / records.len() as f32;
        (mean, MAX_RESIDUAL)
    };

    FusedEstimate {
        position,
        projection: best.projection,
        orientation: average_orientation(records),
        residual,
    }
}

/// Sign-aligned weighted average of the orientations that are valid.
fn average_orientation(records: &[&OpticalPoseEstimation]) -> Option<UnitQuaternion<f32>> {
    let mut oriented = records.iter().filter(|r| r.orientation_valid);
    let anchor = oriented.next()?;
    let reference = anchor.orientation.into_inner();

    let mut sum = reference * anchor.weight();
    for record in oriented {
        let mut q = record.orientation.into_inner();
        if q.dot(&reference) < 0.0 {
            q = -q;
        }
        sum += q * record.weight();
    }

    let norm = sum.norm();
    if norm.is_finite() && norm > 0.0 {
        Some(UnitQuaternion::new_unchecked(sum / norm))
    } else {
        Some(UnitQuaternion::new_unchecked(reference))
    }
}

/// Total order over records: position x, y, z, then residual.
fn canonical_order(a: &OpticalPoseEstimation, b: &OpticalPoseEstimation) -> Ordering {
    a.position
        .x
        .total_cmp(&b.position.x)
        .then(a.position.y.total_cmp(&b.position.y))
        .then(a.position.z.total_cmp(&b.position.z))
        .then(a.residual.total_cmp(&b.residual))
        .then_with(|| quaternion_order(&a.orientation.into_inner(), &b.orientation.into_inner()))
}

fn quaternion_order(a: &Quaternion<f32>, b: &Quaternion<f32>) -> Ordering {
    a.coords
        .iter()
        .zip(b.coords.iter())
        .map(|(x, y)| x.total_cmp(y))
        .find(|o| o.is_ne())
        .unwrap_or(Ordering::Equal)
}
