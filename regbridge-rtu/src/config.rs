//! Configuration for the serial line and the register layout.

use std::time::Duration;

use regbridge_common::{Error, Result};
use serde::{Deserialize, Serialize};

/// Serial line settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Serial port path (e.g., "/dev/ttyUSB0" or "COM3")
    pub port: String,

    /// Baud rate (default: 9600)
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Data bits (default: 8)
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,

    /// Parity: "none", "even", or "odd" (default: "none")
    #[serde(default = "default_parity")]
    pub parity: String,

    /// Stop bits: 1 or 2 (default: 1)
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,

    /// How long to wait for a request before re-arming, in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_parity() -> String {
    "none".to_string()
}

fn default_stop_bits() -> u8 {
    1
}

fn default_timeout_ms() -> u64 {
    2000
}

impl SerialConfig {
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud_rate: default_baud_rate(),
            data_bits: default_data_bits(),
            parity: default_parity(),
            stop_bits: default_stop_bits(),
            timeout_ms: default_timeout_ms(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Silence that terminates a frame: 3.5 character times, fixed above 19200 baud.
    pub fn inter_frame_gap(&self) -> Duration {
        inter_frame_gap(self.baud_rate)
    }

    pub fn validate(&self) -> Result<()> {
        if self.port.is_empty() {
            return Err(Error::Config("serial port cannot be empty".to_string()));
        }
        if self.baud_rate == 0 {
            return Err(Error::Config("baud_rate must be positive".to_string()));
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(Error::Config(format!(
                "invalid data_bits {} (use 5-8)",
                self.data_bits
            )));
        }
        match self.parity.to_lowercase().as_str() {
            "none" | "even" | "odd" => {}
            _ => {
                return Err(Error::Config(format!(
                    "invalid parity '{}' (use none, even, or odd)",
                    self.parity
                )));
            }
        }
        if !matches!(self.stop_bits, 1 | 2) {
            return Err(Error::Config(format!(
                "invalid stop_bits {} (use 1 or 2)",
                self.stop_bits
            )));
        }
        if self.timeout_ms == 0 {
            return Err(Error::Config("timeout_ms must be positive".to_string()));
        }
        Ok(())
    }
}

/// Silence that terminates an RTU frame at the given baud rate.
pub fn inter_frame_gap(baud_rate: u32) -> Duration {
    if baud_rate > 19_200 || baud_rate == 0 {
        return Duration::from_micros(1750);
    }
    // 11 bits per character on the wire.
    let micros = 3.5 * 11.0 * 1_000_000.0 / baud_rate as f64;
    Duration::from_micros(micros.ceil() as u64)
}

/// How bank values are laid out in 16-bit registers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterEncoding {
    /// One unsigned register per value, scaled (default)
    #[default]
    U16,
    /// One signed register per value, scaled
    I16,
    /// 32-bit float in two registers, big-endian word order
    F32,
}

/// Register layout served to the master.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegisterConfig {
    #[serde(default)]
    pub encoding: RegisterEncoding,

    /// Multiplier applied before storing a value in a 16-bit register
    #[serde(default = "default_scale")]
    pub scale: f64,

    /// Accept write requests (function codes 0x06 and 0x10)
    #[serde(default = "default_allow_writes")]
    pub allow_writes: bool,
}

fn default_scale() -> f64 {
    100.0
}

fn default_allow_writes() -> bool {
    true
}

impl Default for RegisterConfig {
    fn default() -> Self {
        Self {
            encoding: RegisterEncoding::default(),
            scale: default_scale(),
            allow_writes: default_allow_writes(),
        }
    }
}

impl RegisterConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.scale.is_finite() || self.scale <= 0.0 {
            return Err(Error::Config(format!(
                "register scale must be a positive number, got {}",
                self.scale
            )));
        }
        Ok(())
    }
}
