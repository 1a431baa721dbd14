//! Protocol decoders that can be attached to a completed capture.
//!
//! The automation service owns the decoder implementations. This module only
//! knows enough about the common ones to reject obviously incomplete settings
//! before a request is sent.

use crate::registry::DeviceConfiguration;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identifier the automation service gave to an attached decoder.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct AnalyzerId(pub String);

impl fmt::Display for AnalyzerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl SettingValue {
    /// Channel index carried by this value, if it is a non-negative integer.
    pub fn as_channel(&self) -> Option<u32> {
        match self {
            SettingValue::Int(v) => u32::try_from(*v).ok(),
            SettingValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

impl fmt::Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingValue::Bool(v) => write!(f, "{v}"),
            SettingValue::Int(v) => write!(f, "{v}"),
            SettingValue::Float(v) => write!(f, "{v}"),
            SettingValue::Text(v) => f.write_str(v),
        }
    }
}

impl From<i64> for SettingValue {
    fn from(v: i64) -> Self {
        SettingValue::Int(v)
    }
}

impl From<u32> for SettingValue {
    fn from(v: u32) -> Self {
        SettingValue::Int(i64::from(v))
    }
}

impl From<f64> for SettingValue {
    fn from(v: f64) -> Self {
        SettingValue::Float(v)
    }
}

impl From<bool> for SettingValue {
    fn from(v: bool) -> Self {
        SettingValue::Bool(v)
    }
}

impl From<&str> for SettingValue {
    fn from(v: &str) -> Self {
        SettingValue::Text(v.to_string())
    }
}

/// Decoder settings by their display name, e.g. `"Bit Rate (Bits/s)"`.
pub type AnalyzerSettings = BTreeMap<String, SettingValue>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SettingsError {
    #[error("{decoder} requires setting '{setting}'")]
    Missing { decoder: &'static str, setting: &'static str },

    #[error("{decoder} requires at least one of {settings}")]
    MissingOneOf { decoder: &'static str, settings: String },

    #[error("Setting '{setting}' must be a channel index, got '{value}'")]
    NotAChannel { setting: String, value: String },

    #[error("Setting '{setting}' uses channel {channel}, which is not enabled in device configuration '{config}'")]
    ChannelNotEnabled {
        setting: String,
        channel: u32,
        config: String,
    },

    #[error("Setting name '{0}' must not be empty or contain '=', tabs or line breaks")]
    InvalidName(String),
}

/// Decoders known locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecoderKind {
    AsyncSerial,
    I2c,
    Spi,
    Can,
    OneWire,
}

/// Settings whose value names a digital channel.
const CHANNEL_SETTINGS: &[&str] = &["Input Channel", "SDA", "SCL", "Clock", "MISO", "MOSI", "Enable"];

impl DecoderKind {
    pub const ALL: [Self; 5] = [Self::AsyncSerial, Self::I2c, Self::Spi, Self::Can, Self::OneWire];

    /// Look a decoder up by name or alias, ignoring case.
    pub fn lookup(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "async serial" | "serial" | "uart" | "async_serial" => Some(Self::AsyncSerial),
            "i2c" => Some(Self::I2c),
            "spi" => Some(Self::Spi),
            "can" => Some(Self::Can),
            "1-wire" | "onewire" | "one-wire" | "1wire" => Some(Self::OneWire),
            _ => None,
        }
    }

    /// Name the automation service knows the decoder by.
    pub fn remote_name(&self) -> &'static str {
        match self {
            Self::AsyncSerial => "Async Serial",
            Self::I2c => "I2C",
            Self::Spi => "SPI",
            Self::Can => "CAN",
            Self::OneWire => "1-Wire",
        }
    }

    pub fn required_settings(&self) -> &'static [&'static str] {
        match self {
            Self::AsyncSerial | Self::Can => &["Input Channel", "Bit Rate (Bits/s)"],
            Self::I2c => &["SDA", "SCL"],
            Self::Spi => &["Clock"],
            Self::OneWire => &["Input Channel"],
        }
    }

    /// Groups where at least one member must be present.
    fn any_of(&self) -> &'static [&'static str] {
        match self {
            Self::Spi => &["MISO", "MOSI"],
            _ => &[],
        }
    }

    pub fn validate(&self, settings: &AnalyzerSettings) -> Result<(), SettingsError> {
        for &setting in self.required_settings() {
            if !settings.contains_key(setting) {
                return Err(SettingsError::Missing {
                    decoder: self.remote_name(),
                    setting,
                });
            }
        }
        let any_of = self.any_of();
        if !any_of.is_empty() && !any_of.iter().any(|s| settings.contains_key(*s)) {
            return Err(SettingsError::MissingOneOf {
                decoder: self.remote_name(),
                settings: any_of.join(", "),
            });
        }
        Ok(())
    }
}

/// Name to send to the service: the canonical name for known decoders,
/// anything else unchanged.
pub fn remote_decoder_name(decoder_type: &str) -> String {
    DecoderKind::lookup(decoder_type).map_or_else(|| decoder_type.trim().to_string(), |k| k.remote_name().to_string())
}

/// Check settings before an attach request is sent.
///
/// Known decoders must carry their required settings. For every decoder,
/// channel-valued settings must point at a digital channel the capture
/// actually recorded.
pub fn validate_settings(
    decoder_type: &str,
    settings: &AnalyzerSettings,
    device: &DeviceConfiguration,
) -> Result<(), SettingsError> {
    if let Some(name) = settings
        .keys()
        .find(|k| k.trim().is_empty() || k.contains(['=', '\t', '\n', '\r']))
    {
        return Err(SettingsError::InvalidName(name.clone()));
    }

    if let Some(kind) = DecoderKind::lookup(decoder_type) {
        kind.validate(settings)?;
    }

    for (setting, value) in settings {
        if !CHANNEL_SETTINGS.contains(&setting.as_str()) {
            continue;
        }
        let channel = value.as_channel().ok_or_else(|| SettingsError::NotAChannel {
            setting: setting.clone(),
            value: value.to_string(),
        })?;
        if !device.has_digital_channel(channel) {
            return Err(SettingsError::ChannelNotEnabled {
                setting: setting.clone(),
                channel,
                config: device.name.clone(),
            });
        }
    }
    Ok(())
}

/// A decoder attached to one capture session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalyzerAttachment {
    pub decoder_type: String,
    pub label: String,
    pub settings: AnalyzerSettings,
    pub analyzer_id: AnalyzerId,
}
