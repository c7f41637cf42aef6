//! `glowtrack-optical` – camera-side pose bookkeeping for tracked
//! controllers.
//!
//! # Modules
//!
//! - [`estimate`] – [`OpticalPoseEstimation`][estimate::OpticalPoseEstimation]:
//!   one tracker's latest view of a controller with staleness timestamps.
//! - [`multicam`] – [`fuse`][multicam::fuse]: order-independent,
//!   residual-weighted fusion of every tracker that currently sees the
//!   controller.
//! - [`tracker_bank`] – [`OpticalEstimates`][tracker_bank::OpticalEstimates]:
//!   the fixed-capacity per-tracker array plus the fused multicam record.

pub mod estimate;
pub mod multicam;
pub mod tracker_bank;
