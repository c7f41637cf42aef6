//! Shared vocabulary for the glowtrack workspace: colors, tracking shapes,
//! pose/physics snapshots, the published controller frame and the global
//! error type.

use chrono::{DateTime, Utc};
use nalgebra::{UnitQuaternion, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum number of tracking cameras the service drives at once.  The
/// per-tracker optical estimate array of every controller has this length.
pub const MAX_TRACKERS: usize = 4;

/// Maximum number of controllers the service manages at once.
pub const MAX_CONTROLLERS: usize = 5;

// ────────────────────────────────────────────────────────────────────────────
// Colors
// ────────────────────────────────────────────────────────────────────────────

/// An 8-bit RGB triple as sent to a controller bulb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    /// Bulb switched off.
    pub const OFF: Rgb = Rgb::new(0, 0, 0);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// `true` for (0, 0, 0).
    pub fn is_off(self) -> bool {
        self == Self::OFF
    }
}

/// Bulb colors the optical detector knows how to segment.
///
/// Every controller that is optically tracked holds at most one of these,
/// and no two controllers hold the same one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackingColorId {
    Magenta,
    Cyan,
    Yellow,
    Red,
    Green,
    Blue,
}

impl TrackingColorId {
    /// Preset order used when handing out colors to newly opened controllers.
    pub const ALL: [TrackingColorId; 6] = [
        TrackingColorId::Magenta,
        TrackingColorId::Cyan,
        TrackingColorId::Yellow,
        TrackingColorId::Red,
        TrackingColorId::Green,
        TrackingColorId::Blue,
    ];

    /// The bulb color emitted for this tracking color.
    pub fn rgb(self) -> Rgb {
        match self {
            TrackingColorId::Magenta => Rgb::new(0xFF, 0x00, 0xFF),
            TrackingColorId::Cyan => Rgb::new(0x00, 0xFF, 0xFF),
            TrackingColorId::Yellow => Rgb::new(0xFF, 0xFF, 0x00),
            TrackingColorId::Red => Rgb::new(0xFF, 0x00, 0x00),
            TrackingColorId::Green => Rgb::new(0x00, 0xFF, 0x00),
            TrackingColorId::Blue => Rgb::new(0x00, 0x00, 0xFF),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Device description
// ────────────────────────────────────────────────────────────────────────────

/// The kinds of handheld controller the service understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControllerKind {
    /// Single glowing sphere, 9-axis IMU, one rumble motor.
    Move,
    /// Navigation sub-controller: buttons only, nothing to track.
    Navi,
    /// Light bar, 6-axis IMU, two rumble motors.
    DualShock4,
}

impl ControllerKind {
    /// Whether this kind carries a bulb the cameras can see.
    pub fn has_bulb(self) -> bool {
        !matches!(self, ControllerKind::Navi)
    }
}

/// Rumble motor selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RumbleChannel {
    All,
    Left,
    Right,
}

/// Physical shape of the light source the optical detector looks for.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum TrackingShape {
    /// A glowing sphere of the given radius (cm).
    Sphere { radius: f32 },
    /// A rectangular light bar (cm).
    LightBar { width: f32, height: f32 },
}

/// Where the controller's light source landed on a tracker's image plane.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub enum TrackingProjection {
    #[default]
    Invalid,
    /// Projected sphere (pixels).
    Ellipse {
        center: Vector2<f32>,
        half_x_extent: f32,
        half_y_extent: f32,
        angle: f32,
    },
    /// Projected light bar corners (pixels).
    Quad { corners: [Vector2<f32>; 4] },
}

impl TrackingProjection {
    pub fn is_valid(&self) -> bool {
        !matches!(self, TrackingProjection::Invalid)
    }
}

/// What one tracker reports for a controller it can currently see.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackerEstimate {
    /// Triangulated position in tracking space (cm).
    pub position: Vector3<f32>,
    pub projection: TrackingProjection,
    /// Present only when the optical system resolved orientation on its own
    /// (light bars do, spheres do not).
    pub orientation: Option<UnitQuaternion<f32>>,
    /// Triangulation residual (cm).  Lower is more trustworthy.
    pub residual: f32,
}

// ────────────────────────────────────────────────────────────────────────────
// Filter outputs
// ────────────────────────────────────────────────────────────────────────────

/// Orientation and position of a controller in tracking space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub orientation: UnitQuaternion<f32>,
    /// Centimetres.
    pub position: Vector3<f32>,
}

impl Pose {
    pub fn identity() -> Self {
        Self {
            orientation: UnitQuaternion::identity(),
            position: Vector3::zeros(),
        }
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self::identity()
    }
}

/// First and second derivatives of a controller's pose.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Physics {
    /// cm/s
    pub linear_velocity: Vector3<f32>,
    /// cm/s²
    pub linear_acceleration: Vector3<f32>,
    /// rad/s, world frame
    pub angular_velocity: Vector3<f32>,
    /// rad/s², world frame
    pub angular_acceleration: Vector3<f32>,
}

// ────────────────────────────────────────────────────────────────────────────
// Published frame
// ────────────────────────────────────────────────────────────────────────────

/// One controller's state as handed to the output collaborator each frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerFrame {
    pub controller_id: usize,
    pub kind: ControllerKind,
    /// Device poll sequence number the frame was built from.
    pub sequence_num: u32,
    pub timestamp: DateTime<Utc>,
    pub pose: Pose,
    pub physics: Physics,
    pub is_orientation_valid: bool,
    pub is_position_valid: bool,
    pub is_tracking_enabled: bool,
    pub is_currently_tracking: bool,
    pub tracking_color: Option<TrackingColorId>,
    pub led_override_active: bool,
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Errors surfaced to callers of the controller service.
///
/// The fusion and prediction path never produces one of these; it degrades
/// instead.  Only device lifecycle, hardware commands and publishing can fail.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TrackingError {
    #[error("Device is not open")]
    DeviceNotOpen,

    #[error("Device is already open")]
    AlreadyOpen,

    #[error("Hardware Fault on {component}: {details}")]
    HardwareFault { component: String, details: String },

    #[error("Invalid controller id {0}")]
    InvalidControllerId(usize),

    #[error("Publish Error: {0}")]
    Publish(String),

    #[error("Configuration Error: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracking_colors_have_distinct_rgb() {
        for (i, a) in TrackingColorId::ALL.iter().enumerate() {
            for b in &TrackingColorId::ALL[i + 1..] {
                assert_ne!(a.rgb(), b.rgb(), "{a:?} and {b:?} share a color");
            }
            assert!(!a.rgb().is_off());
        }
    }

    #[test]
    fn navi_has_no_bulb() {
        assert!(!ControllerKind::Navi.has_bulb());
        assert!(ControllerKind::Move.has_bulb());
        assert!(ControllerKind::DualShock4.has_bulb());
    }

    #[test]
    fn tracking_color_serializes_lowercase() {
        let json = serde_json::to_string(&TrackingColorId::Magenta).unwrap();
        assert_eq!(json, "\"magenta\"");
        let back: TrackingColorId = serde_json::from_str("\"cyan\"").unwrap();
        assert_eq!(back, TrackingColorId::Cyan);
    }

    #[test]
    fn controller_frame_json_contains_pose() {
        let frame = ControllerFrame {
            controller_id: 2,
            kind: ControllerKind::Move,
            sequence_num: 17,
            timestamp: Utc::now(),
            pose: Pose {
                orientation: UnitQuaternion::identity(),
                position: Vector3::new(0.0, 0.0, 1.0),
            },
            physics: Physics::default(),
            is_orientation_valid: true,
            is_position_valid: true,
            is_tracking_enabled: true,
            is_currently_tracking: true,
            tracking_color: Some(TrackingColorId::Blue),
            led_override_active: false,
        };
        let json = serde_json::to_string(&frame).unwrap();
        let back: ControllerFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(back.controller_id, 2);
        assert_eq!(back.pose.position, Vector3::new(0.0, 0.0, 1.0));
        assert_eq!(back.tracking_color, Some(TrackingColorId::Blue));
    }

    #[test]
    fn default_projection_is_invalid() {
        assert!(!TrackingProjection::default().is_valid());
    }

    #[test]
    fn tracking_error_display() {
        let err = TrackingError::HardwareFault {
            component: "rumble".to_string(),
            details: "write failed".to_string(),
        };
        assert!(err.to_string().contains("rumble"));
        assert_eq!(TrackingError::DeviceNotOpen.to_string(), "Device is not open");
    }
}
