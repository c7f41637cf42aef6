//! `glowtrack-server` – the controller service.
//!
//! Owns every open controller, runs the per-frame optical and inertial
//! fusion, manages tracking colors and client streams and publishes one
//! frame per controller per tick.
//!
//! # Modules
//!
//! - [`controller_view`] – [`ControllerView`]: per-controller frame driver
//!   combining the optical estimates, the orientation filter and the
//!   position filter, with LED, rumble and tracking lifecycle control.
//! - [`controller_manager`] – [`ControllerManager`]: the fixed set of
//!   controller slots, collision-free tracking color assignment and the
//!   whole-service frame step.
//! - [`device_view`] – [`DeviceView`]: open/close/publish lifecycle shared by
//!   device views.
//! - [`stream`] – [`ConnectionStreams`][stream::ConnectionStreams]: per-client
//!   stream flags, tracking listeners and inbound LED/rumble frames.
//! - [`publisher`] – [`FramePublisher`] and the in-process
//!   [`BroadcastPublisher`][publisher::BroadcastPublisher].
//! - [`config`] – [`ControllerConfig`]: serde-backed per-controller tuning.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: console logs
//!   plus optional OTLP span export.

pub mod config;
pub mod controller_manager;
pub mod controller_view;
pub mod device_view;
pub mod publisher;
pub mod stream;
pub mod telemetry;

pub use config::ControllerConfig;
pub use controller_manager::ControllerManager;
pub use controller_view::{ControllerView, PoseReader, PoseSnapshot};
pub use device_view::DeviceView;
pub use publisher::FramePublisher;
