//! `glowtrack-hal` – hardware seams for the controller service.
//!
//! The service only ever talks to these traits, so USB/Bluetooth drivers
//! and camera pipelines can be swapped without touching fusion code.
//!
//! # Modules
//!
//! - [`controller`] – [`ControllerDevice`][controller::ControllerDevice]: poll
//!   counter, latest IMU sample, tracking shape, LED and rumble commands.
//! - [`tracker`] – [`TrackerSource`][tracker::TrackerSource]: shared,
//!   read-mostly access to the latest per-camera triangulation.
//! - [`sim`] – in-process simulated controllers and trackers for tests and
//!   the demo daemon.

pub mod controller;
pub mod sim;
pub mod tracker;
