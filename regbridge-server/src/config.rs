//! Configuration for the regbridge server.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use thiserror::Error;

use regbridge_common::{DeviceConfig, IngestConfig, LoggingConfig, validate_devices};
use regbridge_rtu::{RegisterConfig, RegisterLayout, SerialConfig};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] json5::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

impl From<regbridge_common::Error> for ConfigError {
    fn from(e: regbridge_common::Error) -> Self {
        match e {
            regbridge_common::Error::Config(msg) => ConfigError::Validation(msg),
        }
    }
}

/// Complete server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Serial line the Modbus master polls
    pub serial: SerialConfig,

    /// Register layout served on the line
    #[serde(default)]
    pub registers: RegisterConfig,

    /// Acceptance rules for ingested values
    #[serde(default)]
    pub ingest: IngestConfig,

    /// HTTP ingestion and monitor endpoint
    #[serde(default)]
    pub http: HttpConfig,

    /// Devices served on the line
    pub devices: Vec<DeviceConfig>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP endpoint configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Listen address (default: "0.0.0.0:5000")
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_listen() -> String {
    "0.0.0.0:5000".to_string()
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl HttpConfig {
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen.parse().map_err(|e| {
            ConfigError::Validation(format!("invalid listen address '{}': {}", self.listen, e))
        })
    }
}

impl BridgeConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json5(&content)
    }

    /// Parse and validate configuration from a JSON5 string.
    pub fn from_json5(content: &str) -> Result<Self, ConfigError> {
        let config: BridgeConfig = json5::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_devices(&self.devices)?;
        self.serial.validate()?;
        self.registers.validate()?;
        self.ingest.validate()?;
        self.http.listen_addr()?;

        let layout = RegisterLayout::from(&self.registers);
        for device in &self.devices {
            let registers = layout.register_count(device.metrics.len());
            if registers > u16::MAX as usize + 1 {
                return Err(ConfigError::Validation(format!(
                    "Device {}: {} registers do not fit the address space",
                    device.id, registers
                )));
            }
        }

        Ok(())
    }
}
