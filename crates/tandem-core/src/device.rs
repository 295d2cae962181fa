//! # Device Identity
//!
//! Per-device profile used to tag provenance and to scope settings that only
//! make sense between devices of the same class.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

// =============================================================================
// Device Class
// =============================================================================

/// Broad hardware category of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    Desktop,
    Laptop,
    Phone,
    Tablet,
    Server,
    #[default]
    Unknown,
}

impl DeviceClass {
    /// Stable position, used to derive settings ids.
    pub fn ordinal(&self) -> u8 {
        match self {
            DeviceClass::Desktop => 0,
            DeviceClass::Laptop => 1,
            DeviceClass::Phone => 2,
            DeviceClass::Tablet => 3,
            DeviceClass::Server => 4,
            DeviceClass::Unknown => 5,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceClass::Desktop => "desktop",
            DeviceClass::Laptop => "laptop",
            DeviceClass::Phone => "phone",
            DeviceClass::Tablet => "tablet",
            DeviceClass::Server => "server",
            DeviceClass::Unknown => "unknown",
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeviceClass {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "desktop" | "mac" | "imac" | "workstation" => Ok(DeviceClass::Desktop),
            "laptop" | "macbook" | "notebook" => Ok(DeviceClass::Laptop),
            "phone" | "iphone" | "mobile" => Ok(DeviceClass::Phone),
            "tablet" | "ipad" => Ok(DeviceClass::Tablet),
            "server" | "headless" => Ok(DeviceClass::Server),
            "unknown" => Ok(DeviceClass::Unknown),
            other => Err(CoreError::InvalidValue {
                field: "device_class".into(),
                value: other.into(),
            }),
        }
    }
}

// =============================================================================
// Device Profile
// =============================================================================

/// Identity of this device. The id is generated once and persisted locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceProfile {
    pub device_id: String,
    pub display_name: String,
    pub device_class: DeviceClass,
    pub last_active_at: DateTime<Utc>,
}

impl DeviceProfile {
    /// Creates a profile with a freshly generated id.
    pub fn generate(display_name: impl Into<String>, device_class: DeviceClass) -> Self {
        DeviceProfile {
            device_id: Uuid::new_v4().to_string(),
            display_name: display_name.into(),
            device_class,
            last_active_at: Utc::now(),
        }
    }

    /// Records activity.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_active_at {
            self.last_active_at = now;
        }
    }

    /// True if both devices share a class, and the class is known.
    pub fn same_class_as(&self, class: DeviceClass) -> bool {
        self.device_class != DeviceClass::Unknown && self.device_class == class
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_class_aliases() {
        assert_eq!("MacBook".parse::<DeviceClass>().unwrap(), DeviceClass::Laptop);
        assert_eq!("iphone".parse::<DeviceClass>().unwrap(), DeviceClass::Phone);
        assert_eq!("headless".parse::<DeviceClass>().unwrap(), DeviceClass::Server);
        assert!("toaster".parse::<DeviceClass>().is_err());
    }

    #[test]
    fn test_unknown_class_never_matches() {
        let profile = DeviceProfile::generate("Mystery", DeviceClass::Unknown);
        assert!(!profile.same_class_as(DeviceClass::Unknown));

        let laptop = DeviceProfile::generate("Work", DeviceClass::Laptop);
        assert!(laptop.same_class_as(DeviceClass::Laptop));
        assert!(!laptop.same_class_as(DeviceClass::Phone));
    }
}
