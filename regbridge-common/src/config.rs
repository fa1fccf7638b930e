use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{Error, Result};
use crate::registry::DeviceId;

/// Highest unit address a Modbus RTU device may use.
pub const MAX_DEVICE_ID: DeviceId = 247;

/// Highest display precision accepted in configuration.
pub const MAX_DISPLAY_PRECISION: u32 = 6;

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text format (default).
    #[default]
    Text,
    /// Structured JSON format.
    Json,
}

/// Common logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log output format: "text" or "json".
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// A logical device served on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Modbus unit address (1-247).
    pub id: DeviceId,

    /// Metric names, in register order.
    pub metrics: Vec<String>,
}

impl DeviceConfig {
    pub fn new(id: DeviceId, metrics: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            id,
            metrics: metrics.into_iter().map(Into::into).collect(),
        }
    }
}

/// Acceptance rules for externally ingested values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Smallest accepted value (inclusive).
    #[serde(default = "default_min")]
    pub min: f64,

    /// Largest accepted value (inclusive).
    #[serde(default = "default_max")]
    pub max: f64,

    /// Decimal places kept for display and storage.
    #[serde(default = "default_display_precision")]
    pub display_precision: u32,
}

fn default_min() -> f64 {
    0.01
}

fn default_max() -> f64 {
    200.0
}

fn default_display_precision() -> u32 {
    2
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            min: default_min(),
            max: default_max(),
            display_precision: default_display_precision(),
        }
    }
}

impl IngestConfig {
    /// Validate the acceptance range and precision.
    pub fn validate(&self) -> Result<()> {
        if !self.min.is_finite() || !self.max.is_finite() {
            return Err(Error::Config(
                "ingest range bounds must be finite numbers".to_string(),
            ));
        }
        if self.min > self.max {
            return Err(Error::Config(format!(
                "ingest range is empty: min {} > max {}",
                self.min, self.max
            )));
        }
        if self.display_precision > MAX_DISPLAY_PRECISION {
            return Err(Error::Config(format!(
                "display_precision must be at most {}",
                MAX_DISPLAY_PRECISION
            )));
        }
        Ok(())
    }
}

/// Validate the configured device set.
///
/// Ids must be valid unit addresses and unique, and every device needs at
/// least one uniquely named metric.
pub fn validate_devices(devices: &[DeviceConfig]) -> Result<()> {
    if devices.is_empty() {
        return Err(Error::Config(
            "At least one device must be configured".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    for device in devices {
        if device.id == 0 || device.id > MAX_DEVICE_ID {
            return Err(Error::Config(format!(
                "Device {}: id must be 1-{}",
                device.id, MAX_DEVICE_ID
            )));
        }
        if !seen.insert(device.id) {
            return Err(Error::Config(format!(
                "Device {}: id configured more than once",
                device.id
            )));
        }
        if device.metrics.is_empty() {
            return Err(Error::Config(format!(
                "Device {}: at least one metric is required",
                device.id
            )));
        }

        let mut names = HashSet::new();
        for name in &device.metrics {
            if name.is_empty() {
                return Err(Error::Config(format!(
                    "Device {}: metric names cannot be empty",
                    device.id
                )));
            }
            if !names.insert(name.as_str()) {
                return Err(Error::Config(format!(
                    "Device {}: duplicate metric '{}'",
                    device.id, name
                )));
            }
        }
    }

    Ok(())
}
