//! Named device and capture configurations.
//!
//! Configurations are validated once, when they enter a [`ConfigRegistry`], and
//! are immutable afterwards: the registry hands out `Arc`s and offers no way to
//! edit an entry in place. Replacing a configuration means removing it and
//! creating it again.

use crate::device::DeviceType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::{Arc, PoisonError, RwLock};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("A {kind} configuration named '{name}' already exists")]
    DuplicateName { kind: &'static str, name: String },

    #[error("No {kind} configuration named '{name}'")]
    NotFound { kind: &'static str, name: String },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("{device_type} has a fixed digital threshold; digital_threshold_volts must be omitted")]
    ThresholdNotSupported { device_type: DeviceType },
}

/// Entries kept by a [`ConfigRegistry`].
pub trait NamedConfig {
    const KIND: &'static str;

    fn name(&self) -> &str;

    fn validate(&self) -> Result<(), ConfigError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfiguration {
    pub name: String,
    pub digital_channels: BTreeSet<u32>,
    pub digital_sample_rate: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analog_channels: Option<BTreeSet<u32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analog_sample_rate: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digital_threshold_volts: Option<f64>,
    /// Hardware class this configuration targets. When absent the first
    /// enumerated device is used at capture time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_type: Option<DeviceType>,
}

impl DeviceConfiguration {
    pub fn new(
        name: impl Into<String>,
        digital_channels: impl IntoIterator<Item = u32>,
        digital_sample_rate: u64,
    ) -> Self {
        Self {
            name: name.into(),
            digital_channels: digital_channels.into_iter().collect(),
            digital_sample_rate,
            analog_channels: None,
            analog_sample_rate: None,
            digital_threshold_volts: None,
            device_type: None,
        }
    }

    pub fn with_analog(
        mut self,
        analog_channels: impl IntoIterator<Item = u32>,
        analog_sample_rate: u64,
    ) -> Self {
        self.analog_channels = Some(analog_channels.into_iter().collect());
        self.analog_sample_rate = Some(analog_sample_rate);
        self
    }

    pub fn with_digital_threshold(mut self, volts: f64) -> Self {
        self.digital_threshold_volts = Some(volts);
        self
    }

    pub fn for_device(mut self, device_type: DeviceType) -> Self {
        self.device_type = Some(device_type);
        self
    }

    pub fn has_digital_channel(&self, channel: u32) -> bool {
        self.digital_channels.contains(&channel)
    }

    pub fn has_analog_channel(&self, channel: u32) -> bool {
        self.analog_channels
            .as_ref()
            .is_some_and(|channels| channels.contains(&channel))
    }

    pub fn analog_channel_set(&self) -> BTreeSet<u32> {
        self.analog_channels.clone().unwrap_or_default()
    }

    /// Check this configuration against a concrete hardware class.
    pub fn check_hardware(&self, device_type: DeviceType) -> Result<(), ConfigError> {
        if self.digital_threshold_volts.is_some() && !device_type.supports_variable_threshold() {
            return Err(ConfigError::ThresholdNotSupported { device_type });
        }

        let limit = device_type.channel_count();
        let analog = self.analog_channels.iter().flatten();
        if let Some(channel) = self.digital_channels.iter().chain(analog).find(|c| **c >= limit) {
            return Err(ConfigError::InvalidParameter(format!(
                "channel {channel} does not exist on {device_type} ({limit} channels)"
            )));
        }
        Ok(())
    }
}

impl NamedConfig for DeviceConfiguration {
    const KIND: &'static str = "device";

    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self) -> Result<(), ConfigError> {
        validate_name(&self.name)?;

        let analog_channels = self.analog_channel_set();
        if self.digital_channels.is_empty() && analog_channels.is_empty() {
            return Err(ConfigError::InvalidParameter(
                "at least one digital or analog channel must be enabled".into(),
            ));
        }
        if !self.digital_channels.is_empty() && self.digital_sample_rate == 0 {
            return Err(ConfigError::InvalidParameter(
                "digital_sample_rate must be greater than zero".into(),
            ));
        }
        if !analog_channels.is_empty() && !self.analog_sample_rate.is_some_and(|rate| rate > 0) {
            return Err(ConfigError::InvalidParameter(
                "analog channels require a non-zero analog_sample_rate".into(),
            ));
        }
        if let Some(volts) = self.digital_threshold_volts {
            if !volts.is_finite() || volts <= 0.0 {
                return Err(ConfigError::InvalidParameter(format!(
                    "digital_threshold_volts must be a positive voltage, got {volts}"
                )));
            }
        }

        match self.device_type {
            Some(device_type) => self.check_hardware(device_type),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureConfiguration {
    pub name: String,
    pub duration_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer_size_megabytes: Option<u32>,
}

impl CaptureConfiguration {
    pub fn new(name: impl Into<String>, duration_seconds: f64) -> Self {
        Self {
            name: name.into(),
            duration_seconds,
            buffer_size_megabytes: None,
        }
    }

    pub fn with_buffer_size(mut self, megabytes: u32) -> Self {
        self.buffer_size_megabytes = Some(megabytes);
        self
    }
}

impl NamedConfig for CaptureConfiguration {
    const KIND: &'static str = "capture";

    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self) -> Result<(), ConfigError> {
        validate_name(&self.name)?;
        if !self.duration_seconds.is_finite() || self.duration_seconds <= 0.0 {
            return Err(ConfigError::InvalidParameter(format!(
                "duration_seconds must be positive, got {}",
                self.duration_seconds
            )));
        }
        if self.buffer_size_megabytes == Some(0) {
            return Err(ConfigError::InvalidParameter(
                "buffer_size_megabytes must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

fn validate_name(name: &str) -> Result<(), ConfigError> {
    if name.trim().is_empty() {
        return Err(ConfigError::InvalidParameter("configuration name must not be empty".into()));
    }
    if name.contains(['\t', '\n', '\r']) {
        return Err(ConfigError::InvalidParameter(
            "configuration name must not contain tabs or line breaks".into(),
        ));
    }
    Ok(())
}

/// Insertion-ordered map from configuration name to configuration.
///
/// Reads take a shared lock; `create` and `remove` take the single write lock.
#[derive(Debug)]
pub struct ConfigRegistry<T> {
    entries: RwLock<Vec<Arc<T>>>,
}

impl<T: NamedConfig> ConfigRegistry<T> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    pub fn create(&self, config: T) -> Result<Arc<T>, ConfigError> {
        config.validate()?;

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.iter().any(|e| e.name() == config.name()) {
            return Err(ConfigError::DuplicateName {
                kind: T::KIND,
                name: config.name().to_string(),
            });
        }

        log::debug!("Created {} configuration '{}'", T::KIND, config.name());
        let config = Arc::new(config);
        entries.push(Arc::clone(&config));
        Ok(config)
    }

    pub fn get(&self, name: &str) -> Result<Arc<T>, ConfigError> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .iter()
            .find(|e| e.name() == name)
            .cloned()
            .ok_or_else(|| ConfigError::NotFound {
                kind: T::KIND,
                name: name.to_string(),
            })
    }

    /// Names in creation order.
    pub fn list(&self) -> Vec<String> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.iter().map(|e| e.name().to_string()).collect()
    }

    /// Returns whether an entry existed.
    pub fn remove(&self, name: &str) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|e| e.name() != name);
        let removed = entries.len() != before;
        if removed {
            log::debug!("Removed {} configuration '{}'", T::KIND, name);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: NamedConfig> Default for ConfigRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_then_get_returns_same_configuration() {
        let registry = ConfigRegistry::new();
        let config = DeviceConfiguration::new("cfg1", [0, 1], 1_000_000)
            .with_analog([2], 50_000)
            .with_digital_threshold(1.8)
            .for_device(DeviceType::LogicPro8);

        registry.create(config.clone()).unwrap();
        assert_eq!(*registry.get("cfg1").unwrap(), config);
    }

    #[test]
    fn test_duplicate_name_does_not_touch_existing_entry() {
        let registry = ConfigRegistry::new();
        registry.create(CaptureConfiguration::new("cap1", 1.0)).unwrap();

        let err = registry.create(CaptureConfiguration::new("cap1", 5.0)).unwrap_err();
        assert_eq!(
            err,
            ConfigError::DuplicateName {
                kind: "capture",
                name: "cap1".into()
            }
        );
        assert_eq!(registry.get("cap1").unwrap().duration_seconds, 1.0);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_list_keeps_creation_order() {
        let registry = ConfigRegistry::new();
        for name in ["zeta", "alpha", "mid"] {
            registry.create(CaptureConfiguration::new(name, 0.5)).unwrap();
        }
        assert_eq!(registry.list(), vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry = ConfigRegistry::new();
        registry.create(CaptureConfiguration::new("cap1", 1.0)).unwrap();

        assert!(registry.remove("cap1"));
        assert!(!registry.remove("cap1"));
        assert!(!registry.remove("never-created"));
        assert!(registry.is_empty());
        assert!(matches!(
            registry.get("cap1"),
            Err(ConfigError::NotFound { .. })
        ));
    }

    #[test]
    fn test_threshold_rejected_on_fixed_threshold_hardware() {
        let registry = ConfigRegistry::new();
        let config = DeviceConfiguration::new("cfg", [0], 1_000_000)
            .with_digital_threshold(3.3)
            .for_device(DeviceType::Logic16);

        assert_eq!(
            registry.create(config).unwrap_err(),
            ConfigError::ThresholdNotSupported {
                device_type: DeviceType::Logic16
            }
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn test_channel_outside_device_is_rejected() {
        let config = DeviceConfiguration::new("cfg", [0, 9], 1_000_000).for_device(DeviceType::Logic8);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_invalid_parameters() {
        assert!(DeviceConfiguration::new("cfg", [], 1_000_000).validate().is_err());
        assert!(DeviceConfiguration::new("cfg", [0], 0).validate().is_err());
        assert!(DeviceConfiguration::new("", [0], 1).validate().is_err());

        let mut analog_without_rate = DeviceConfiguration::new("cfg", [0], 1_000_000);
        analog_without_rate.analog_channels = Some([1].into_iter().collect());
        assert!(analog_without_rate.validate().is_err());

        assert!(CaptureConfiguration::new("cap", 0.0).validate().is_err());
        assert!(CaptureConfiguration::new("cap", f64::NAN).validate().is_err());
        assert!(CaptureConfiguration::new("cap", 1.0).with_buffer_size(0).validate().is_err());
    }

    #[test]
    fn test_analog_only_configuration_is_valid() {
        let config = DeviceConfiguration::new("analog", [], 0).with_analog([0, 1], 1_000_000);
        assert!(config.validate().is_ok());
        assert!(config.has_analog_channel(1));
        assert!(!config.has_digital_channel(0));
    }
}
