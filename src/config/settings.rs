use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::devices::axis::AxisCalibration;
use crate::devices::syringe_pump::SyringeCalibration;
use crate::utils::error::DeviceError;

/// Typed instrument configuration.
///
/// Relay board, rotary valve and drives may share a serial port path; the
/// controller hands every driver on the same path one shared bus handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub device_id: String,
    /// Probe each drive for a status response during initialization.
    pub verify_on_connect: bool,
    pub relay: RelayConfig,
    pub rotary_valve: RotaryValveConfig,
    pub syringe: SyringeConfig,
    pub vertical_axis: AxisConfig,
    pub horizontal_axis: AxisConfig,
    pub safety: SafetyConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_id: "device3".to_string(),
            verify_on_connect: false,
            relay: RelayConfig::default(),
            rotary_valve: RotaryValveConfig::default(),
            syringe: SyringeConfig::default(),
            vertical_axis: AxisConfig::default(),
            horizontal_axis: AxisConfig::horizontal(),
            safety: SafetyConfig::default(),
        }
    }
}

impl Config {
    /// Read a TOML config file into a typed `Config` with defaults for
    /// missing sections.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, DeviceError> {
        let raw = std::fs::read_to_string(&path).map_err(|e| {
            DeviceError::ConfigError(format!(
                "cannot read {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Ok(toml::from_str(&raw)?)
    }

    pub fn to_toml_string(&self) -> Result<String, DeviceError> {
        toml::to_string_pretty(self)
            .map_err(|e| DeviceError::SerializationError(format!("TOML error: {}", e)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub port: String,
    pub address: u8,
    pub baud_rate: u32,
    pub timeout_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttySC2".to_string(),
            address: 0x02,
            baud_rate: 9600,
            timeout_ms: 300,
        }
    }
}

impl RelayConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RotaryValveConfig {
    pub port: String,
    pub address: u8,
    pub baud_rate: u32,
    pub timeout_ms: u64,
}

impl Default for RotaryValveConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttySC3".to_string(),
            address: 0x01,
            baud_rate: 9600,
            timeout_ms: 300,
        }
    }
}

impl RotaryValveConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyringeConfig {
    pub port: String,
    pub address: u8,
    pub baud_rate: u32,
    pub timeout_ms: u64,
    pub steps_per_ml: f64,
    pub velocity_calib: f64,
}

impl Default for SyringeConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttySC2".to_string(),
            address: 0x4C,
            baud_rate: 9600,
            timeout_ms: 1000,
            steps_per_ml: 304_457.5314,
            velocity_calib: 304.457_53,
        }
    }
}

impl SyringeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn calibration(&self) -> SyringeCalibration {
        SyringeCalibration {
            steps_per_ml: self.steps_per_ml,
            velocity_calib: self.velocity_calib,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AxisConfig {
    pub name: String,
    pub port: String,
    pub address: u8,
    pub baud_rate: u32,
    pub timeout_ms: u64,
    pub steps_per_ml: f64,
    pub velocity_calib: f64,
    pub steps_per_mm: f64,
    pub min_mm: Option<f64>,
    pub max_mm: Option<f64>,
    /// Named quick-move targets in millimetres.
    pub presets: BTreeMap<String, f64>,
}

impl Default for AxisConfig {
    fn default() -> Self {
        let mut presets = BTreeMap::new();
        presets.insert("open".to_string(), 0.0);
        presets.insert("close".to_string(), 33.0);
        Self {
            name: "Vertical Axis".to_string(),
            port: "/dev/ttySC3".to_string(),
            address: 0x4E,
            baud_rate: 9600,
            timeout_ms: 1000,
            steps_per_ml: 2000.0,
            velocity_calib: 1000.0,
            steps_per_mm: 2000.0,
            min_mm: Some(0.0),
            max_mm: Some(33.0),
            presets,
        }
    }
}

impl AxisConfig {
    /// Horizontal axis defaults mirroring the instrument's preset table.
    pub fn horizontal() -> Self {
        let mut presets = BTreeMap::new();
        presets.insert("filtering".to_string(), 133.0);
        presets.insert("filter out".to_string(), 26.0);
        presets.insert("filter in".to_string(), 0.0);
        Self {
            name: "Horizontal Axis".to_string(),
            port: "/dev/ttySC3".to_string(),
            address: 0x4D,
            baud_rate: 9600,
            timeout_ms: 1000,
            steps_per_ml: 2000.0,
            velocity_calib: 1000.0,
            steps_per_mm: 2000.0,
            min_mm: None,
            max_mm: None,
            presets,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn preset(&self, key: &str) -> Option<f64> {
        let key = key.trim().to_ascii_lowercase();
        self.presets.get(&key).copied()
    }

    pub fn calibration(&self) -> AxisCalibration {
        AxisCalibration {
            steps_per_ml: self.steps_per_ml,
            velocity_calib: self.velocity_calib,
            steps_per_mm: self.steps_per_mm,
            min_mm: self.min_mm,
            max_mm: self.max_mm,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Horizontal motion is blocked while the vertical axis sits above
    /// this height.
    pub vertical_guard_mm: f64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            vertical_guard_mm: 10.0,
        }
    }
}
