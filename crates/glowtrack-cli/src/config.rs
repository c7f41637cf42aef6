//! Daemon configuration – reads/writes `~/.glowtrack/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use glowtrack_server::ControllerConfig;
use glowtrack_types::{ControllerKind, MAX_CONTROLLERS, MAX_TRACKERS};
use serde::{Deserialize, Serialize};

/// One simulated controller the daemon opens at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerEntry {
    pub kind: ControllerKind,
    #[serde(flatten)]
    pub config: ControllerConfig,
}

impl ControllerEntry {
    pub fn for_kind(kind: ControllerKind) -> Self {
        Self {
            kind,
            config: ControllerConfig::for_kind(kind),
        }
    }
}

/// Persisted daemon configuration stored in `~/.glowtrack/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Tracking loop rate.
    #[serde(default = "default_frame_rate_hz")]
    pub frame_rate_hz: u32,

    /// Number of simulated cameras.
    #[serde(default = "default_tracker_count")]
    pub tracker_count: usize,

    /// Frames buffered per subscriber before it starts lagging.
    #[serde(default = "default_publish_capacity")]
    pub publish_capacity: usize,

    #[serde(default = "default_controllers", rename = "controller")]
    pub controllers: Vec<ControllerEntry>,
}

fn default_frame_rate_hz() -> u32 {
    60
}
fn default_tracker_count() -> usize {
    2
}
fn default_publish_capacity() -> usize {
    glowtrack_server::publisher::DEFAULT_CAPACITY
}
fn default_controllers() -> Vec<ControllerEntry> {
    vec![ControllerEntry::for_kind(ControllerKind::Move)]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            frame_rate_hz: default_frame_rate_hz(),
            tracker_count: default_tracker_count(),
            publish_capacity: default_publish_capacity(),
            controllers: default_controllers(),
        }
    }
}

impl Config {
    /// Reject settings the service cannot run with.
    pub fn validate(&self) -> Result<(), String> {
        if self.frame_rate_hz == 0 || self.frame_rate_hz > 1000 {
            return Err(format!("frame_rate_hz must be within 1..=1000, got {}", self.frame_rate_hz));
        }
        if self.tracker_count > MAX_TRACKERS {
            return Err(format!(
                "tracker_count {} exceeds the supported maximum of {MAX_TRACKERS}",
                self.tracker_count
            ));
        }
        if self.controllers.len() > MAX_CONTROLLERS {
            return Err(format!(
                "{} controllers configured; at most {MAX_CONTROLLERS} are supported",
                self.controllers.len()
            ));
        }
        if self.publish_capacity == 0 {
            return Err("publish_capacity must be positive".to_string());
        }
        Ok(())
    }
}

/// Return the path to `~/.glowtrack/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".glowtrack").join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let mut cfg: Config = toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `GLOWTRACK_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `GLOWTRACK_FRAME_RATE_HZ` | `frame_rate_hz` |
/// | `GLOWTRACK_TRACKER_COUNT` | `tracker_count` |
/// | `GLOWTRACK_STALENESS_MS` | `staleness_threshold_ms` of every controller |
///
/// Unparseable values are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("GLOWTRACK_FRAME_RATE_HZ")
        && let Ok(rate) = v.parse::<u32>()
    {
        cfg.frame_rate_hz = rate;
    }
    if let Ok(v) = std::env::var("GLOWTRACK_TRACKER_COUNT")
        && let Ok(count) = v.parse::<usize>()
    {
        cfg.tracker_count = count;
    }
    if let Ok(v) = std::env::var("GLOWTRACK_STALENESS_MS")
        && let Ok(ms) = v.parse::<u64>()
    {
        for entry in &mut cfg.controllers {
            entry.config.staleness_threshold_ms = ms;
        }
    }
}

/// Save the config to disk, creating `~/.glowtrack/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw = toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use glowtrack_filter::orientation::FusionType;
    use glowtrack_types::TrackingColorId;

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path).expect("save");

        let file_mode = std::fs::metadata(&path).expect("file metadata").permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);
        let dir_mode = std::fs::metadata(path.parent().unwrap())
            .expect("dir metadata")
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(dir_mode, 0o700);
    }

    #[test]
    fn roundtrip_default_config() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path).expect("save");
        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.frame_rate_hz, 60);
        assert_eq!(loaded.tracker_count, 2);
        assert_eq!(loaded.controllers.len(), 1);
        assert_eq!(loaded.controllers[0].kind, ControllerKind::Move);
        assert_eq!(loaded.controllers[0].config.fusion_type, FusionType::MadgwickMarg);
    }

    #[test]
    fn controller_tables_fill_in_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
frame_rate_hz = 90

[[controller]]
kind = "DualShock4"
fusion_type = "complementary_optical_arg"
tracking_color = "cyan"

[[controller]]
kind = "Navi"
"#,
        )
        .unwrap();

        let cfg = load_from(&path).unwrap().unwrap();
        assert_eq!(cfg.frame_rate_hz, 90);
        assert_eq!(cfg.tracker_count, 2);
        assert_eq!(cfg.controllers.len(), 2);
        assert_eq!(cfg.controllers[0].config.tracking_color, Some(TrackingColorId::Cyan));
        assert_eq!(cfg.controllers[1].kind, ControllerKind::Navi);
        assert_eq!(cfg.controllers[1].config.staleness_threshold_ms, 200);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "frame_rate_hz = \"fast\"").unwrap();
        assert!(load_from(&path).unwrap_err().contains("parse"));
    }

    #[test]
    fn config_path_points_to_glowtrack_dir() {
        let p = config_path_for_home("/home/testuser");
        assert!(p.to_string_lossy().contains(".glowtrack"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn validation_rejects_unusable_settings() {
        assert!(Config::default().validate().is_ok());
        let zero_rate = Config {
            frame_rate_hz: 0,
            ..Config::default()
        };
        assert!(zero_rate.validate().is_err());
        let too_many_trackers = Config {
            tracker_count: MAX_TRACKERS + 1,
            ..Config::default()
        };
        assert!(too_many_trackers.validate().is_err());
        let too_many_controllers = Config {
            controllers: vec![ControllerEntry::for_kind(ControllerKind::Move); MAX_CONTROLLERS + 1],
            ..Config::default()
        };
        assert!(too_many_controllers.validate().is_err());
    }

    #[test]
    fn apply_env_overrides_changes_frame_rate_and_staleness() {
        // SAFETY: only this test touches these variables.
        unsafe {
            std::env::set_var("GLOWTRACK_FRAME_RATE_HZ", "120");
            std::env::set_var("GLOWTRACK_STALENESS_MS", "75");
        }
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.frame_rate_hz, 120);
        assert_eq!(cfg.controllers[0].config.staleness_threshold_ms, 75);
        unsafe {
            std::env::remove_var("GLOWTRACK_FRAME_RATE_HZ");
            std::env::remove_var("GLOWTRACK_STALENESS_MS");
        }
    }

    #[test]
    fn apply_env_overrides_ignores_invalid_tracker_count() {
        // SAFETY: only this test touches this variable.
        unsafe { std::env::set_var("GLOWTRACK_TRACKER_COUNT", "several") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.tracker_count, 2);
        unsafe { std::env::remove_var("GLOWTRACK_TRACKER_COUNT") };
    }
}
