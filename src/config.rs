//! Connection and timeout settings.
//!
//! Values come from defaults, then an optional TOML file, then the
//! `LOGIC_AUTOMATION_HOST` / `LOGIC_AUTOMATION_PORT` environment variables.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Port the automation service listens on unless configured otherwise.
pub const DEFAULT_PORT: u16 = 10430;

pub const HOST_ENV: &str = "LOGIC_AUTOMATION_HOST";
pub const PORT_ENV: &str = "LOGIC_AUTOMATION_PORT";

#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutomationConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout_secs: f64,
    /// Bound for requests that should answer right away.
    pub request_timeout_secs: f64,
    /// Added on top of the expected recording time when waiting for a capture.
    pub wait_grace_secs: f64,
    /// How long an armed trigger may wait for its edge.
    pub trigger_timeout_secs: f64,
    pub export_timeout_secs: f64,
    /// Where capture-and-analyze writes its raw exports.
    pub export_directory: PathBuf,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            connect_timeout_secs: 5.0,
            request_timeout_secs: 10.0,
            wait_grace_secs: 10.0,
            trigger_timeout_secs: 30.0,
            export_timeout_secs: 30.0,
            export_directory: env::temp_dir().join("logic-automation"),
        }
    }
}

impl AutomationConfig {
    /// Defaults, overlaid with `path` if given, then with the environment.
    pub fn load_from(path: Option<&Path>) -> Result<Self, ConfigFileError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides(|key| env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigFileError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigFileError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config = Self::from_toml(&contents).map_err(|message| ConfigFileError::Parse {
            path: path.to_path_buf(),
            message,
        })?;
        log::debug!("Loaded automation config from {}", path.display());
        config.validate()?;
        Ok(config)
    }

    fn from_toml(contents: &str) -> Result<Self, String> {
        toml::from_str(contents).map_err(|e: toml::de::Error| e.to_string())
    }

    /// Apply overrides looked up through `lookup`, normally `std::env::var`.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigFileError> {
        if let Some(host) = lookup(HOST_ENV) {
            let host = host.trim();
            if host.is_empty() {
                return Err(ConfigFileError::InvalidValue {
                    key: HOST_ENV.to_string(),
                    value: host.to_string(),
                    reason: "host must not be empty".to_string(),
                });
            }
            log::debug!("{} overrides host with {}", HOST_ENV, host);
            self.host = host.to_string();
        }
        if let Some(port) = lookup(PORT_ENV) {
            self.port = port.trim().parse().map_err(|e: std::num::ParseIntError| {
                ConfigFileError::InvalidValue {
                    key: PORT_ENV.to_string(),
                    value: port.clone(),
                    reason: e.to_string(),
                }
            })?;
            log::debug!("{} overrides port with {}", PORT_ENV, self.port);
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigFileError> {
        let timeouts = [
            ("connect_timeout_secs", self.connect_timeout_secs),
            ("request_timeout_secs", self.request_timeout_secs),
            ("wait_grace_secs", self.wait_grace_secs),
            ("trigger_timeout_secs", self.trigger_timeout_secs),
            ("export_timeout_secs", self.export_timeout_secs),
        ];
        for (key, value) in timeouts {
            if !value.is_finite() || value <= 0.0 {
                return Err(ConfigFileError::InvalidValue {
                    key: key.to_string(),
                    value: value.to_string(),
                    reason: "must be a positive number of seconds".to_string(),
                });
            }
        }
        Ok(())
    }

    /// `host:port` of the automation service.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        secs(self.request_timeout_secs)
    }

    pub fn wait_grace(&self) -> Duration {
        secs(self.wait_grace_secs)
    }

    pub fn trigger_timeout(&self) -> Duration {
        secs(self.trigger_timeout_secs)
    }

    pub fn export_timeout(&self) -> Duration {
        secs(self.export_timeout_secs)
    }
}

/// Non-finite or negative values collapse to zero.
pub(crate) fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}
