//! regbridge Common Library
//!
//! Shared state of the register bridge:
//!
//! - [`registry`] - Per-device register banks (`RegisterBank`, `DeviceRegistry`)
//! - [`cache`] - Display projection of the banks (`DisplayCache`)
//! - [`ingest`] - Validated value updates (`IngestionGateway`)
//! - [`config`] - Configuration primitives (JSON5 format)
//! - [`error`] - Error types

pub mod cache;
pub mod config;
pub mod error;
pub mod ingest;
pub mod registry;

// Re-export commonly used types at the crate root
pub use cache::{DeviceDisplay, DisplayCache, MetricDisplay, Snapshot};
pub use config::{DeviceConfig, IngestConfig, LogFormat, LoggingConfig, validate_devices};
pub use error::{Error, Result};
pub use ingest::{Accepted, IngestError, IngestionGateway, RejectReason};
pub use registry::{DeviceId, DeviceRegistry, RegisterBank, RegistryError, round_to};

/// Initialize tracing with the given configuration.
///
/// Supports two output formats:
/// - `LogFormat::Text` (default): Human-readable text format
/// - `LogFormat::Json`: Structured JSON format for log aggregation systems
///
/// `RUST_LOG`, when set, takes precedence over the configured level.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match config.format {
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer())
                .with(filter)
                .try_init()
                .map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))?;
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json())
                .with(filter)
                .try_init()
                .map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))?;
        }
    }

    Ok(())
}
