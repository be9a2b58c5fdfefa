//! Device records and the ordered device list

use serde::{Deserialize, Serialize};

/// Firmware variants known to the companion apps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppType {
    Weather,
    HomeWeather,
    MatrixClock,
    ThermalWorld,
    BigClock,
    #[default]
    Unknown,
}

impl AppType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppType::Weather => "weather",
            AppType::HomeWeather => "homeweather",
            AppType::MatrixClock => "matrixclock",
            AppType::ThermalWorld => "thermalworld",
            AppType::BigClock => "bigclock",
            AppType::Unknown => "",
        }
    }

    /// Resolve a firmware tag: current short names, or the UUID tags written by
    /// early app releases and still present in migrated device files.
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "weather" | "761ddc8c-e7f5-40d4-87ac-9b06d91a672d" => AppType::Weather,
            "homeweather" | "8b6b3a11-00b4-4304-be27-abd11db1b774" => AppType::HomeWeather,
            "matrixclock" | "0028c36b-444a-408d-b862-f8e4c17cb6d6" => AppType::MatrixClock,
            "thermalworld" | "0b5d0687-6095-4f1d-897c-04664b143702" => AppType::ThermalWorld,
            "bigclock" | "1bd51c33-9f34-48a9-95ea-c3f589a8136c" => AppType::BigClock,
            _ => AppType::Unknown,
        }
    }
}

/// Transient status bridging a user install toggle and its sync resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InstallState {
    #[default]
    None,
    Installing,
    Removing,
}

/// One controllable unit, addressed by its agent code
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Device {
    pub name: String,
    pub code: String,
    pub app_type: AppType,
    pub watch_supported: bool,
    pub is_installed: bool,
    #[serde(skip)]
    pub install_state: InstallState,
    #[serde(skip)]
    pub changed: bool,
}

impl Device {
    pub fn new() -> Self {
        Self::default()
    }

    /// An all-blank record created by the add-device flow but never filled in.
    /// These are pruned before every persist.
    pub fn is_placeholder(&self) -> bool {
        self.name.is_empty() && self.code.is_empty() && self.app_type == AppType::Unknown
    }
}

/// Ordered device sequence plus the advisory last-viewed pointer.
/// Exactly one authoritative instance exists per process, owned by the event
/// loop and passed by explicit handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceList {
    pub devices: Vec<Device>,
    pub current_device: i64,
}

impl Default for DeviceList {
    fn default() -> Self {
        Self {
            devices: Vec::new(),
            current_device: -1,
        }
    }
}
