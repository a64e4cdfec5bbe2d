// src/settings.rs
//
// Application settings and the validator's parameter configuration.
// Both are JSON; every application setting has a default so a partial file
// (or none at all) is valid.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::io::SerialSettings;
use crate::session::identity::IdentitySettings;

pub const APP_NAME: &str = "tcu-logger";
pub const DEFAULT_VALIDATOR_CONFIG: &str = "./config/ota_config.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// Application settings
// ============================================================================

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AppSettings {
    /// Root of the capture log tree
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// Application diagnostic logs
    #[serde(default = "default_reports_dir")]
    pub reports_dir: PathBuf,
    #[serde(default = "default_validator_config")]
    pub validator_config: PathBuf,
    #[serde(default)]
    pub serial: SerialSettings,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_probe_window_ms")]
    pub probe_window_ms: u64,
    #[serde(default = "default_settle_delay_secs")]
    pub settle_delay_secs: u64,
    #[serde(default = "default_recent_lines_capacity")]
    pub recent_lines_capacity: usize,
    #[serde(default = "default_drain_interval_ms")]
    pub drain_interval_ms: u64,
    #[serde(default)]
    pub identity: IdentitySettings,
    /// Host identifier for identified log names (default: host name)
    #[serde(default)]
    pub host_id: Option<String>,
    /// Only ports whose name contains this substring are probed
    #[serde(default)]
    pub port_filter: Option<String>,
}

fn app_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join(APP_NAME))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn default_log_dir() -> PathBuf {
    app_data_dir().join("logs")
}
fn default_reports_dir() -> PathBuf {
    app_data_dir().join("reports")
}
fn default_validator_config() -> PathBuf {
    PathBuf::from(DEFAULT_VALIDATOR_CONFIG)
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_probe_window_ms() -> u64 {
    500
}
fn default_settle_delay_secs() -> u64 {
    30
}
fn default_recent_lines_capacity() -> usize {
    crate::session::recent::DEFAULT_RECENT_CAPACITY
}
fn default_drain_interval_ms() -> u64 {
    50
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            reports_dir: default_reports_dir(),
            validator_config: default_validator_config(),
            serial: SerialSettings::default(),
            poll_interval_ms: default_poll_interval_ms(),
            probe_window_ms: default_probe_window_ms(),
            settle_delay_secs: default_settle_delay_secs(),
            recent_lines_capacity: default_recent_lines_capacity(),
            drain_interval_ms: default_drain_interval_ms(),
            identity: IdentitySettings::default(),
            host_id: None,
            port_filter: None,
        }
    }
}

impl AppSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn probe_window(&self) -> Duration {
        Duration::from_millis(self.probe_window_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.settle_delay_secs)
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }

    /// Configured host id, else the machine's host name.
    pub fn resolved_host_id(&self) -> String {
        self.host_id
            .clone()
            .filter(|h| !h.trim().is_empty())
            .or_else(sysinfo::System::host_name)
            .unwrap_or_else(|| "unknown-host".to_string())
    }
}

/// Default location of the settings file.
pub fn default_settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
        .join("settings.json")
}

/// Load settings from `path`, or from the default location.
///
/// An explicit path must exist. At the default location a missing file means
/// first run: defaults are written there and returned.
pub fn load_settings(path: Option<&Path>) -> Result<AppSettings, ConfigError> {
    let settings_path = match path {
        Some(p) => p.to_path_buf(),
        None => {
            let p = default_settings_path();
            if !p.exists() {
                let settings = AppSettings::default();
                if let Err(e) = save_settings(&p, &settings) {
                    tlog!("[settings] Could not write default settings: {}", e);
                }
                return Ok(settings);
            }
            p
        }
    };

    let content = std::fs::read_to_string(&settings_path).map_err(|source| ConfigError::Read {
        path: settings_path.clone(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
        path: settings_path,
        source,
    })
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| ConfigError::Read {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let json = serde_json::to_string_pretty(settings)
        .map_err(|e| ConfigError::Invalid(format!("Failed to serialize settings: {}", e)))?;
    std::fs::write(path, json).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })
}

// ============================================================================
// Validator configuration
// ============================================================================

/// One verified parameter: its GET command maps to this entry.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct ParameterCheck {
    /// Substring a correct response contains
    pub expected: String,
    #[serde(default)]
    pub set_command: Option<String>,
    /// Substring confirming the SET took effect
    #[serde(default)]
    pub set_expected: Option<String>,
    /// Marker identifying the response line (default: derived from the GET command)
    #[serde(default)]
    pub keyword: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ValidatorConfig {
    #[serde(default)]
    pub uin_commands: Vec<String>,
    /// Response timeout in seconds
    #[serde(default = "default_response_timeout")]
    pub timeout: f64,
    /// Attempts per GET (and per UIN command)
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Device type -> GET command -> check
    #[serde(default)]
    pub device_profiles: BTreeMap<String, BTreeMap<String, ParameterCheck>>,
    /// Overrides the application settle delay (seconds)
    #[serde(default)]
    pub settle_delay: Option<f64>,
    #[serde(default = "default_response_poll_ms")]
    pub poll_interval_ms: u64,
    /// Profile used when the UIN response does not name a device type
    #[serde(default)]
    pub default_device_type: Option<String>,
}

fn default_response_timeout() -> f64 {
    10.0
}
fn default_retries() -> u32 {
    1
}
fn default_response_poll_ms() -> u64 {
    250
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            uin_commands: Vec::new(),
            timeout: default_response_timeout(),
            retries: default_retries(),
            device_profiles: BTreeMap::new(),
            settle_delay: None,
            poll_interval_ms: default_response_poll_ms(),
            default_device_type: None,
        }
    }
}

impl ValidatorConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&content).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let parse_error = |source: serde_json::Error| ConfigError::Parse {
            path: PathBuf::new(),
            source,
        };
        let value: serde_json::Value = serde_json::from_str(content).map_err(parse_error)?;
        // Every field has a default, so only an object is a configuration
        if !value.is_object() {
            return Err(parse_error(serde::de::Error::custom(
                "validator configuration must be a JSON object",
            )));
        }
        let config: ValidatorConfig = serde_json::from_value(value).map_err(parse_error)?;
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<(), ConfigError> {
        if !self.timeout.is_finite() || self.timeout <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "timeout must be a positive number of seconds, got {}",
                self.timeout
            )));
        }
        if let Some(delay) = self.settle_delay {
            if !delay.is_finite() || delay < 0.0 {
                return Err(ConfigError::Invalid(format!("settle_delay must be >= 0, got {}", delay)));
            }
        }
        if self.device_profiles.is_empty() {
            return Err(ConfigError::Invalid("no device profiles configured".to_string()));
        }
        if let Some(default) = &self.default_device_type {
            if !self.device_profiles.contains_key(default) {
                return Err(ConfigError::Invalid(format!(
                    "default_device_type '{}' has no profile",
                    default
                )));
            }
        }
        for (device, profile) in &self.device_profiles {
            for (get_command, check) in profile {
                if check.expected.is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "{} / {}: expected value is empty",
                        device, get_command
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout)
    }

    /// Total attempts per exchange; never less than one.
    pub fn attempts(&self) -> u32 {
        self.retries.max(1)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn settle_delay_override(&self) -> Option<Duration> {
        self.settle_delay.map(Duration::from_secs_f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"{
        "uin_commands": ["*GET#UIN#"],
        "timeout": 5,
        "retries": 3,
        "device_profiles": {
            "TCU 4G": {
                "*GET#APN#": { "expected": "internet", "set_command": "*SET#APN#internet#" }
            }
        }
    }"#;

    #[test]
    fn test_partial_settings_fill_defaults() {
        let settings: AppSettings =
            serde_json::from_str(r#"{ "poll_interval_ms": 200, "port_filter": "ACM" }"#).unwrap();
        assert_eq!(settings.poll_interval(), Duration::from_millis(200));
        assert_eq!(settings.port_filter.as_deref(), Some("ACM"));
        assert_eq!(settings.probe_window_ms, 500);
        assert_eq!(settings.serial.baud_rate, 115_200);
        assert_eq!(settings.validator_config, PathBuf::from(DEFAULT_VALIDATOR_CONFIG));
    }

    #[test]
    fn test_settings_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let settings = AppSettings {
            host_id: Some("bench-01".into()),
            ..AppSettings::default()
        };
        save_settings(&path, &settings).unwrap();
        assert_eq!(load_settings(Some(&path)).unwrap(), settings);
        assert_eq!(settings.resolved_host_id(), "bench-01");
    }

    #[test]
    fn test_explicit_settings_path_must_exist() {
        let dir = TempDir::new().unwrap();
        let err = load_settings(Some(&dir.path().join("missing.json"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_validator_config_parses() {
        let config = ValidatorConfig::from_json(SAMPLE).unwrap();
        assert_eq!(config.response_timeout(), Duration::from_secs(5));
        assert_eq!(config.attempts(), 3);
        let check = &config.device_profiles["TCU 4G"]["*GET#APN#"];
        assert_eq!(check.expected, "internet");
        assert_eq!(check.set_command.as_deref(), Some("*SET#APN#internet#"));
        assert_eq!(check.set_expected, None);
    }

    #[test]
    fn test_validator_config_rejects_bad_values() {
        assert!(matches!(
            ValidatorConfig::from_json(r#"{ "timeout": 0 }"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            ValidatorConfig::from_json(r#"{ "default_device_type": "TCU 2G" }"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            ValidatorConfig::from_json("{ not json"),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_validator_config_load_reports_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ota_config.json");
        std::fs::write(&path, "[]").unwrap();
        match ValidatorConfig::load(&path) {
            Err(ConfigError::Parse { path: p, .. }) => assert_eq!(p, path),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_empty_validator_config_is_rejected() {
        assert!(matches!(
            ValidatorConfig::from_json("{}"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            ValidatorConfig::from_json(r#"{ "uin_commands": ["*GET#UIN#"], "device_profiles": {} }"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            ValidatorConfig::from_json(r#"["*GET#UIN#"]"#),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_zero_retries_still_attempts_once() {
        let config = ValidatorConfig::from_json(
            r#"{ "retries": 0, "device_profiles": { "TCU 2G": { "*GET#APN#": { "expected": "internet" } } } }"#,
        )
        .unwrap();
        assert_eq!(config.attempts(), 1);
    }
}
