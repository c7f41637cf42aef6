//! `glowtrackd` – controller tracking daemon.
//!
//! Runs the full tracking pipeline against simulated hardware:
//!
//! 1. Loads `~/.glowtrack/config.toml`, writing a default one on first run.
//! 2. Opens the configured simulated controllers and cameras.
//! 3. Runs optical fusion, filter updates and frame publishing on a fixed
//!    interval, with a subscriber task logging a pose summary.
//! 4. Shuts down cleanly on Ctrl-C.

mod config;
mod motion;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use glowtrack_hal::sim::{SimController, SimControllerHandle, SimTrackerSource, sphere_estimate};
use glowtrack_server::ControllerManager;
use glowtrack_server::publisher::BroadcastPublisher;
use glowtrack_server::stream::{ConnectionStreams, StreamFlags};
use glowtrack_server::telemetry::init_tracing;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, trace, warn};

use crate::config::Config;
use crate::motion::Orbit;

/// Residual reported by the first simulated camera; later cameras are
/// progressively less accurate.
const BASE_RESIDUAL: f32 = 0.5;

struct SimulatedController {
    controller_id: usize,
    handle: SimControllerHandle,
    orbit: Orbit,
}

fn main() {
    let _guard = init_tracing("glowtrackd");

    let cfg = match config::load() {
        Ok(Some(cfg)) => {
            info!(path = %config::config_path().display(), "Config loaded");
            cfg
        }
        Ok(None) => {
            let cfg = Config::default();
            match config::save(&cfg) {
                Ok(()) => info!(path = %config::config_path().display(), "Wrote default config"),
                Err(e) => warn!(error = %e, "Could not write default config"),
            }
            cfg
        }
        Err(e) => {
            warn!(error = %e, "Config error; using defaults");
            Config::default()
        }
    };
    if let Err(e) = cfg.validate() {
        error!(error = %e, "Invalid configuration");
        std::process::exit(2);
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Ctrl-C received; shutting down");
        shutdown_flag.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; stop the daemon with SIGKILL");
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to start tokio runtime");
            std::process::exit(1);
        }
    };
    runtime.block_on(run(cfg, shutdown));
}

async fn run(cfg: Config, shutdown: Arc<AtomicBool>) {
    let mut manager = ControllerManager::new();
    let trackers = SimTrackerSource::new(cfg.tracker_count);
    let publisher = BroadcastPublisher::new(cfg.publish_capacity);

    let mut simulated = Vec::new();
    for (index, entry) in cfg.controllers.iter().enumerate() {
        let device = SimController::new(format!("sim-{:?}-{index}", entry.kind).to_lowercase(), entry.kind);
        let handle = device.handle();
        match manager.open_controller(device, entry.config.clone()) {
            Ok(controller_id) => simulated.push(SimulatedController {
                controller_id,
                handle,
                orbit: Orbit::for_controller(index),
            }),
            Err(e) => warn!(index, error = %e, "Failed to open simulated controller"),
        }
    }

    // The daemon acts as its own client: one position stream per controller.
    let mut connection = ConnectionStreams::new();
    let flags = StreamFlags {
        include_position_data: true,
        include_physics_data: true,
        include_raw_tracker_data: true,
        ..StreamFlags::default()
    };
    for sim in &simulated {
        if let Err(e) = connection.start_controller_stream(&mut manager, sim.controller_id, flags) {
            warn!(controller_id = sim.controller_id, error = %e, "Failed to start stream");
        }
    }

    let summary = tokio::spawn(log_frames(publisher.subscribe(), cfg.frame_rate_hz));

    let mut interval = tokio::time::interval(Duration::from_secs_f64(1.0 / f64::from(cfg.frame_rate_hz)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let started = Instant::now();
    info!(
        controllers = simulated.len(),
        trackers = cfg.tracker_count,
        rate_hz = cfg.frame_rate_hz,
        "Tracking loop running"
    );

    while !shutdown.load(Ordering::SeqCst) {
        interval.tick().await;
        let t = started.elapsed().as_secs_f32();

        trackers.hide_all();
        for sim in &simulated {
            sim.handle.push_sample(sim.orbit.imu_sample(t));
            let Some(color) = manager.view(sim.controller_id).ok().and_then(|v| v.detection_color()) else {
                continue;
            };
            let position = sim.orbit.position(t);
            for tracker_id in 0..cfg.tracker_count {
                let residual = BASE_RESIDUAL * (1.0 + tracker_id as f32);
                trackers.show(tracker_id, color, sphere_estimate(position, residual));
            }
        }

        manager.process_frame(&trackers);
        manager.publish_frames(&publisher);
        for frame in connection.stream_frames(&manager) {
            trace!(
                controller_id = frame.controller_id,
                sequence_num = frame.sequence_num,
                trackers = frame.raw_trackers.as_ref().map_or(0, Vec::len),
                "Stream frame"
            );
        }
    }

    connection.connection_stopped(&mut manager);
    for sim in &simulated {
        if let Err(e) = manager.close_controller(sim.controller_id) {
            warn!(controller_id = sim.controller_id, error = %e, "Failed to close controller");
        }
    }
    drop(publisher);
    if let Err(e) = summary.await {
        warn!(error = %e, "Frame logger task failed");
    }
    info!("glowtrackd stopped");
}

/// Log one pose summary per controller roughly once a second.
async fn log_frames(mut frames: broadcast::Receiver<glowtrack_types::ControllerFrame>, frame_rate_hz: u32) {
    loop {
        match frames.recv().await {
            Ok(frame) => {
                if frame.sequence_num % frame_rate_hz == 0 {
                    let p = frame.pose.position;
                    let (roll, pitch, yaw) = frame.pose.orientation.euler_angles();
                    info!(
                        controller_id = frame.controller_id,
                        x = p.x,
                        y = p.y,
                        z = p.z,
                        roll,
                        pitch,
                        yaw,
                        tracking = frame.is_currently_tracking,
                        "Pose"
                    );
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Frame logger fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
