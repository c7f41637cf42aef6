//! Per-controller tuning: fusion strategy, gyro tunables, calibration and
//! tracking behavior.
//!
//! Every field has a serde default so a config file only needs to name what
//! it changes.

use std::time::Duration;

use glowtrack_filter::filter_space::{CalibrationPose, FilterSpace, SensorTransform};
use glowtrack_filter::orientation::{DEFAULT_GYRO_DRIFT, DEFAULT_GYRO_ERROR, FusionType};
use glowtrack_filter::position::DEFAULT_POSITION_SMOOTHING;
use glowtrack_optical::estimate::DEFAULT_STALENESS_THRESHOLD;
use glowtrack_types::{ControllerKind, TrackingColorId};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    #[serde(default)]
    pub fusion_type: FusionType,

    /// Expected gyroscope measurement error (rad/s).
    #[serde(default = "default_gyro_error")]
    pub gyro_error: f32,

    /// Expected gyroscope drift rate (rad/s²).
    #[serde(default = "default_gyro_drift")]
    pub gyro_drift: f32,

    #[serde(default)]
    pub calibration_pose: CalibrationPose,

    #[serde(default)]
    pub sensor_transform: SensorTransform,

    /// Accelerometer direction observed in the identity pose.
    #[serde(default = "default_identity_gravity")]
    pub identity_gravity: [f32; 3],

    /// Magnetometer direction observed in the identity pose.  All zeros
    /// disables magnetic correction.
    #[serde(default = "default_identity_magnetometer")]
    pub identity_magnetometer: [f32; 3],

    /// Age after which an unrefreshed optical estimate is dropped.
    #[serde(default = "default_staleness_threshold_ms")]
    pub staleness_threshold_ms: u64,

    /// Fraction of the previous position kept on each optical update.
    #[serde(default = "default_position_smoothing")]
    pub position_smoothing: f32,

    /// Color requested when the controller opens.  Falls back to the first
    /// free color when absent or already taken.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracking_color: Option<TrackingColorId>,

    /// Search for the LED override color instead of the tracking color while
    /// an override is active.
    #[serde(default)]
    pub detect_override_color: bool,
}

fn default_gyro_error() -> f32 {
    DEFAULT_GYRO_ERROR
}
fn default_gyro_drift() -> f32 {
    DEFAULT_GYRO_DRIFT
}
fn default_identity_gravity() -> [f32; 3] {
    [0.0, 1.0, 0.0]
}
fn default_identity_magnetometer() -> [f32; 3] {
    [0.0, -0.5, -0.866]
}
fn default_staleness_threshold_ms() -> u64 {
    DEFAULT_STALENESS_THRESHOLD.as_millis() as u64
}
fn default_position_smoothing() -> f32 {
    DEFAULT_POSITION_SMOOTHING
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            fusion_type: FusionType::default(),
            gyro_error: default_gyro_error(),
            gyro_drift: default_gyro_drift(),
            calibration_pose: CalibrationPose::default(),
            sensor_transform: SensorTransform::default(),
            identity_gravity: default_identity_gravity(),
            identity_magnetometer: default_identity_magnetometer(),
            staleness_threshold_ms: default_staleness_threshold_ms(),
            position_smoothing: default_position_smoothing(),
            tracking_color: None,
            detect_override_color: false,
        }
    }
}

impl ControllerConfig {
    /// Defaults suited to a controller kind: MARG Madgwick for the 9-axis
    /// Move, optical complementary for the 6-axis DualShock 4 and nothing
    /// for the Navi.
    pub fn for_kind(kind: ControllerKind) -> Self {
        let fusion_type = match kind {
            ControllerKind::Move => FusionType::MadgwickMarg,
            ControllerKind::DualShock4 => FusionType::ComplementaryOpticalArg,
            ControllerKind::Navi => FusionType::None,
        };
        Self {
            fusion_type,
            ..Self::default()
        }
    }

    pub fn filter_space(&self) -> FilterSpace {
        FilterSpace::new(
            Vector3::from(self.identity_gravity),
            Vector3::from(self.identity_magnetometer),
            self.calibration_pose,
            self.sensor_transform,
        )
    }

    pub fn staleness_threshold(&self) -> Duration {
        Duration::from_millis(self.staleness_threshold_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let cfg: ControllerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, ControllerConfig::default());
        assert_eq!(cfg.staleness_threshold(), DEFAULT_STALENESS_THRESHOLD);
    }

    #[test]
    fn partial_document_overrides_named_fields() {
        let cfg: ControllerConfig = serde_json::from_str(
            r#"{"fusion_type":"complementary_marg","tracking_color":"cyan","staleness_threshold_ms":50}"#,
        )
        .unwrap();
        assert_eq!(cfg.fusion_type, FusionType::ComplementaryMarg);
        assert_eq!(cfg.tracking_color, Some(TrackingColorId::Cyan));
        assert_eq!(cfg.staleness_threshold(), Duration::from_millis(50));
        assert_eq!(cfg.gyro_error, DEFAULT_GYRO_ERROR);
    }

    #[test]
    fn kind_defaults_pick_fusion_strategy() {
        assert_eq!(ControllerConfig::for_kind(ControllerKind::Move).fusion_type, FusionType::MadgwickMarg);
        assert_eq!(
            ControllerConfig::for_kind(ControllerKind::DualShock4).fusion_type,
            FusionType::ComplementaryOpticalArg
        );
        assert_eq!(ControllerConfig::for_kind(ControllerKind::Navi).fusion_type, FusionType::None);
    }

    #[test]
    fn filter_space_uses_normalized_references() {
        let cfg = ControllerConfig {
            identity_gravity: [0.0, 9.81, 0.0],
            ..ControllerConfig::default()
        };
        let space = cfg.filter_space();
        assert!((space.gravity_calibration_direction() - Vector3::y()).norm() < 1e-6);
    }
}
