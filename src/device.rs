use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Hardware classes reported by the automation service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceType {
    #[serde(rename = "LOGIC")]
    Logic,
    #[serde(rename = "LOGIC_4")]
    Logic4,
    #[serde(rename = "LOGIC_8")]
    Logic8,
    #[serde(rename = "LOGIC_16")]
    Logic16,
    #[serde(rename = "LOGIC_PRO_8")]
    LogicPro8,
    #[serde(rename = "LOGIC_PRO_16")]
    LogicPro16,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown device type '{0}'")]
pub struct UnknownDeviceType(pub String);

impl DeviceType {
    pub const ALL: [Self; 6] = [
        Self::Logic,
        Self::Logic4,
        Self::Logic8,
        Self::Logic16,
        Self::LogicPro8,
        Self::LogicPro16,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Logic => "LOGIC",
            Self::Logic4 => "LOGIC_4",
            Self::Logic8 => "LOGIC_8",
            Self::Logic16 => "LOGIC_16",
            Self::LogicPro8 => "LOGIC_PRO_8",
            Self::LogicPro16 => "LOGIC_PRO_16",
        }
    }

    /// Number of physical channels, shared by the digital and analog inputs.
    pub fn channel_count(&self) -> u32 {
        match self {
            Self::Logic4 => 4,
            Self::Logic | Self::Logic8 | Self::LogicPro8 => 8,
            Self::Logic16 | Self::LogicPro16 => 16,
        }
    }

    /// Only the Pro models can move their digital input threshold.
    pub fn supports_variable_threshold(&self) -> bool {
        matches!(self, Self::LogicPro8 | Self::LogicPro16)
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceType {
    type Err = UnknownDeviceType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace([' ', '-'], "_");
        let normalized = normalized.strip_prefix("DEVICETYPE.").unwrap_or(&normalized);
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| UnknownDeviceType(s.to_string()))
    }
}

/// A device as enumerated by the automation service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_id: String,
    pub device_type: DeviceType,
    pub is_simulation: bool,
}

impl DeviceInfo {
    pub fn new(device_id: String, device_type: DeviceType, is_simulation: bool) -> Self {
        Self {
            device_id,
            device_type,
            is_simulation,
        }
    }

    /// Device id with everything but the first and last four characters hidden.
    pub fn masked_id(&self) -> String {
        let chars: Vec<char> = self.device_id.chars().collect();
        if chars.len() > 8 {
            let head: String = chars[..4].iter().collect();
            let tail: String = chars[chars.len() - 4..].iter().collect();
            format!("{head}...{tail}")
        } else {
            "****".to_string()
        }
    }
}

/// First device of the given type, in enumeration order.
pub fn find_device_by_type(devices: &[DeviceInfo], device_type: DeviceType) -> Option<&DeviceInfo> {
    devices.iter().find(|d| d.device_type == device_type)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_type_round_trips_through_wire_name() {
        for t in DeviceType::ALL {
            assert_eq!(t.as_str().parse::<DeviceType>().unwrap(), t);
        }
        assert_eq!("logic pro 16".parse::<DeviceType>().unwrap(), DeviceType::LogicPro16);
        assert_eq!("DeviceType.LOGIC_8".parse::<DeviceType>().unwrap(), DeviceType::Logic8);
        assert!("LOGIC_32".parse::<DeviceType>().is_err());
    }

    #[test]
    fn test_threshold_support() {
        assert!(DeviceType::LogicPro8.supports_variable_threshold());
        assert!(DeviceType::LogicPro16.supports_variable_threshold());
        assert!(!DeviceType::Logic8.supports_variable_threshold());
        assert!(!DeviceType::Logic16.supports_variable_threshold());
    }

    #[test]
    fn test_masked_id() {
        let device = DeviceInfo::new("F4241A7D0E3B".into(), DeviceType::LogicPro8, false);
        assert_eq!(device.masked_id(), "F424...0E3B");
        let short = DeviceInfo::new("ABC".into(), DeviceType::Logic8, true);
        assert_eq!(short.masked_id(), "****");
    }

    #[test]
    fn test_find_device_by_type() {
        let devices = vec![
            DeviceInfo::new("a".into(), DeviceType::Logic8, false),
            DeviceInfo::new("b".into(), DeviceType::LogicPro16, false),
            DeviceInfo::new("c".into(), DeviceType::LogicPro16, true),
        ];
        assert_eq!(
            find_device_by_type(&devices, DeviceType::LogicPro16).map(|d| d.device_id.as_str()),
            Some("b")
        );
        assert!(find_device_by_type(&devices, DeviceType::Logic4).is_none());
    }
}
