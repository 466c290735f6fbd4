//! Configuration shared by the daemon and the CLI.
//!
//! Values come from, lowest precedence first: built-in defaults, the TOML
//! file named by `ROLLCALL_CONFIG` (if set), then `ROLLCALL_*` environment
//! variables.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::matcher::{DEFAULT_CONFIDENCE_THRESHOLD, DEFAULT_SIMILARITY_SCALE};
use crate::schedule::{AttendanceSchedule, ScheduleError};

const CONFIG_PATH_VAR: &str = "ROLLCALL_CONFIG";
const DATA_DIR_NAME: &str = "rollcall";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid schedule: {0}")]
    Schedule(#[from] ScheduleError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub schedule: ScheduleConfig,
    pub matcher: MatcherConfig,
    pub device: DeviceConfig,
    pub storage: StorageConfig,
    pub daemon: DaemonConfig,
}

/// Daily attendance window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub start_hour: u32,
    pub start_minute: u32,
    /// Minutes after start before an arrival counts as late.
    pub late_threshold_minutes: u32,
    /// Minutes after start before an arrival counts as absent.
    pub absent_threshold_minutes: u32,
    pub max_absences_before_drop: u32,
    /// Device-local offset from UTC, in seconds. Defines the calendar day.
    pub utc_offset_secs: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    /// Minimum sample confidence and template similarity for a match.
    pub confidence_threshold: f32,
    /// Euclidean distance that maps to zero similarity.
    pub similarity_scale: f32,
}

/// Capture device link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Serial device path (`/dev/ttyUSB0`) or `tcp://host:port`.
    pub path: String,
    pub baud_rate: u32,
    pub header_timeout_ms: u64,
    pub payload_timeout_ms: u64,
    /// Sleep between availability checks while waiting on the link.
    pub poll_interval_ms: u64,
    /// Wait after opening the link before the first command.
    pub boot_delay_ms: u64,
    /// Wait after a reset is acknowledged.
    pub reset_settle_ms: u64,
    pub init_attempts: u32,
    pub max_user_id_len: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Defaults to `$XDG_DATA_HOME/rollcall`.
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Interval between checks for device notifications.
    pub capture_poll_ms: u64,
    /// Interval between absence sweeps. Must be shorter than the absent window.
    pub sweep_interval_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            start_hour: 8,
            start_minute: 0,
            late_threshold_minutes: 15,
            absent_threshold_minutes: 30,
            max_absences_before_drop: 3,
            utc_offset_secs: 0,
        }
    }
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            similarity_scale: DEFAULT_SIMILARITY_SCALE,
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            path: "/dev/ttyUSB0".to_string(),
            baud_rate: 115_200,
            header_timeout_ms: 5000,
            payload_timeout_ms: 5000,
            poll_interval_ms: 10,
            boot_delay_ms: 2000,
            reset_settle_ms: 2000,
            init_attempts: 3,
            max_user_id_len: 64,
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            capture_poll_ms: 200,
            sweep_interval_secs: 60,
        }
    }
}

impl Config {
    /// Load from the optional TOML file and `ROLLCALL_*` environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(CONFIG_PATH_VAR) {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Overlay values from `lookup` (normally the process environment).
    /// Unparseable values are ignored with a warning.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let env = Overrides(&lookup);
        let s = &mut self.schedule;
        env.set("ROLLCALL_START_HOUR", &mut s.start_hour);
        env.set("ROLLCALL_START_MINUTE", &mut s.start_minute);
        env.set("ROLLCALL_LATE_THRESHOLD_MINUTES", &mut s.late_threshold_minutes);
        env.set("ROLLCALL_ABSENT_THRESHOLD_MINUTES", &mut s.absent_threshold_minutes);
        env.set("ROLLCALL_MAX_ABSENCES", &mut s.max_absences_before_drop);
        env.set("ROLLCALL_UTC_OFFSET_SECS", &mut s.utc_offset_secs);

        let m = &mut self.matcher;
        env.set("ROLLCALL_CONFIDENCE_THRESHOLD", &mut m.confidence_threshold);
        env.set("ROLLCALL_SIMILARITY_SCALE", &mut m.similarity_scale);

        let d = &mut self.device;
        env.set("ROLLCALL_DEVICE", &mut d.path);
        env.set("ROLLCALL_BAUD_RATE", &mut d.baud_rate);
        env.set("ROLLCALL_HEADER_TIMEOUT_MS", &mut d.header_timeout_ms);
        env.set("ROLLCALL_PAYLOAD_TIMEOUT_MS", &mut d.payload_timeout_ms);
        env.set("ROLLCALL_BOOT_DELAY_MS", &mut d.boot_delay_ms);

        if let Some(dir) = lookup("ROLLCALL_DATA_DIR") {
            self.storage.data_dir = Some(PathBuf::from(dir));
        }

        let daemon = &mut self.daemon;
        env.set("ROLLCALL_CAPTURE_POLL_MS", &mut daemon.capture_poll_ms);
        env.set("ROLLCALL_SWEEP_INTERVAL_SECS", &mut daemon.sweep_interval_secs);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.schedule.start_hour >= 24 || self.schedule.start_minute >= 60 {
            return Err(ConfigError::Invalid(format!(
                "start time {}:{:02} is not a time of day",
                self.schedule.start_hour, self.schedule.start_minute
            )));
        }
        let schedule = self.schedule()?;
        let m = &self.matcher;
        if !(0.0..=1.0).contains(&m.confidence_threshold) {
            return Err(ConfigError::Invalid(format!(
                "confidence_threshold {} outside [0, 1]",
                m.confidence_threshold
            )));
        }
        if m.similarity_scale.is_nan() || m.similarity_scale <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "similarity_scale {} must be positive",
                m.similarity_scale
            )));
        }
        if self.device.path.is_empty() {
            return Err(ConfigError::Invalid("device path is empty".into()));
        }
        if self.device.max_user_id_len == 0 || self.device.max_user_id_len > 255 {
            return Err(ConfigError::Invalid(format!(
                "max_user_id_len {} must be within 1..=255",
                self.device.max_user_id_len
            )));
        }
        let window_secs = u64::from(schedule.absent_threshold_minutes()) * 60;
        if window_secs > 0 && self.daemon.sweep_interval_secs >= window_secs {
            tracing::warn!(
                sweep_interval_secs = self.daemon.sweep_interval_secs,
                window_secs,
                "sweep interval is not finer than the absent window"
            );
        }
        Ok(())
    }

    pub fn schedule(&self) -> Result<AttendanceSchedule, ScheduleError> {
        let s = &self.schedule;
        AttendanceSchedule::new(
            s.start_hour * 60 + s.start_minute,
            s.late_threshold_minutes,
            s.absent_threshold_minutes,
            s.max_absences_before_drop,
            s.utc_offset_secs,
        )
    }

    /// Directory holding the roster, ledger and templates.
    pub fn data_dir(&self) -> PathBuf {
        if let Some(dir) = &self.storage.data_dir {
            return dir.clone();
        }
        std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join(DATA_DIR_NAME)
    }
}

struct Overrides<'a, F>(&'a F);

impl<F: Fn(&str) -> Option<String>> Overrides<'_, F> {
    fn set<T: std::str::FromStr>(&self, key: &str, slot: &mut T) {
        let Some(raw) = (self.0)(key) else {
            return;
        };
        match raw.parse() {
            Ok(value) => *slot = value,
            Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable override"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        let schedule = config.schedule().unwrap();
        assert_eq!(schedule.start_minutes(), 480);
        assert_eq!(config.device.header_timeout_ms, 5000);
        assert_eq!(config.device.baud_rate, 115_200);
        assert_eq!(config.matcher.confidence_threshold, 0.7);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [schedule]
            start_hour = 9
            late_threshold_minutes = 10

            [device]
            path = "tcp://10.0.0.5:3333"
            "#,
        )
        .unwrap();
        assert_eq!(config.schedule.start_hour, 9);
        assert_eq!(config.schedule.absent_threshold_minutes, 30);
        assert_eq!(config.device.path, "tcp://10.0.0.5:3333");
        assert_eq!(config.device.payload_timeout_ms, 5000);
        assert_eq!(config.schedule().unwrap().start_minutes(), 540);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[matcher]\nsimilarity_scale = 50.0\n").unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.matcher.similarity_scale, 50.0);

        std::fs::write(&path, "[matcher\n").unwrap();
        assert!(matches!(Config::from_file(&path), Err(ConfigError::Parse { .. })));
        assert!(matches!(
            Config::from_file(&dir.path().join("missing.toml")),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_overrides(lookup(&[
            ("ROLLCALL_START_HOUR", "7"),
            ("ROLLCALL_DEVICE", "/dev/ttyS1"),
            ("ROLLCALL_CONFIDENCE_THRESHOLD", "0.8"),
            ("ROLLCALL_DATA_DIR", "/var/lib/rollcall"),
            ("ROLLCALL_MAX_ABSENCES", "not-a-number"),
        ]));
        assert_eq!(config.schedule.start_hour, 7);
        assert_eq!(config.device.path, "/dev/ttyS1");
        assert_eq!(config.matcher.confidence_threshold, 0.8);
        assert_eq!(config.data_dir(), PathBuf::from("/var/lib/rollcall"));
        assert_eq!(config.schedule.max_absences_before_drop, 3);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.matcher.similarity_scale = 0.0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.schedule.late_threshold_minutes = 45;
        assert!(matches!(config.validate(), Err(ConfigError::Schedule(_))));

        let mut config = Config::default();
        config.device.max_user_id_len = 300;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
