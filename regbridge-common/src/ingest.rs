//! Validation and application of externally sourced values.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::debug;

use crate::config::IngestConfig;
use crate::registry::{DeviceId, DeviceRegistry, RegistryError, round_to};

/// Reason an update was refused.
///
/// Every variant is returned before anything is written.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IngestError {
    #[error("device {device_id} is not configured (valid: {valid:?})")]
    InvalidDevice {
        device_id: i64,
        valid: Vec<DeviceId>,
    },

    #[error("index {index} is out of range for device {device_id} (0-{max})")]
    IndexOutOfRange {
        device_id: DeviceId,
        index: i64,
        max: usize,
    },

    #[error("value {0} is not a finite number")]
    InvalidValue(f64),

    #[error("value {value} is outside {min}-{max}")]
    ValueOutOfRange { value: f64, min: f64, max: f64 },

    #[error("service is stopping")]
    ServiceStopping,
}

/// Machine-readable rejection reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RejectReason {
    InvalidDevice,
    IndexOutOfRange,
    InvalidValue,
    ValueOutOfRange,
    ServiceStopping,
}

impl IngestError {
    pub fn reason(&self) -> RejectReason {
        match self {
            IngestError::InvalidDevice { .. } => RejectReason::InvalidDevice,
            IngestError::IndexOutOfRange { .. } => RejectReason::IndexOutOfRange,
            IngestError::InvalidValue(_) => RejectReason::InvalidValue,
            IngestError::ValueOutOfRange { .. } => RejectReason::ValueOutOfRange,
            IngestError::ServiceStopping => RejectReason::ServiceStopping,
        }
    }
}

/// Confirmation of an applied update.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Accepted {
    pub device_id: DeviceId,
    pub index: usize,
    pub metric: String,
    /// Value as stored, rounded to the display precision.
    pub value: f64,
    pub message: String,
}

/// Entry point for values arriving from outside the Modbus link.
#[derive(Debug, Clone)]
pub struct IngestionGateway {
    registry: Arc<DeviceRegistry>,
    config: IngestConfig,
    shutdown: Option<watch::Receiver<bool>>,
}

impl IngestionGateway {
    pub fn new(registry: Arc<DeviceRegistry>, config: IngestConfig) -> Self {
        Self {
            registry,
            config,
            shutdown: None,
        }
    }

    /// Reject updates with [`IngestError::ServiceStopping`] once `shutdown` reads `true`.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Validate an update and write it to the device's bank.
    ///
    /// Checks run in order: service running, device configured, index in
    /// range, value finite, value within the configured bounds.
    pub fn ingest(&self, device_id: i64, index: i64, value: f64) -> Result<Accepted, IngestError> {
        if self.is_stopping() {
            return Err(IngestError::ServiceStopping);
        }

        let device = DeviceId::try_from(device_id)
            .ok()
            .filter(|id| self.registry.contains(*id))
            .ok_or_else(|| IngestError::InvalidDevice {
                device_id,
                valid: self.registry.device_ids().collect(),
            })?;

        let len = self
            .registry
            .bank_len(device)
            .map_err(|e| self.map_registry_error(device_id, index, e))?;
        let slot = usize::try_from(index)
            .ok()
            .filter(|i| *i < len)
            .ok_or(IngestError::IndexOutOfRange {
                device_id: device,
                index,
                max: len.saturating_sub(1),
            })?;

        if !value.is_finite() {
            return Err(IngestError::InvalidValue(value));
        }
        if value < self.config.min || value > self.config.max {
            return Err(IngestError::ValueOutOfRange {
                value,
                min: self.config.min,
                max: self.config.max,
            });
        }

        let normalized = round_to(value, self.config.display_precision);
        self.registry
            .write(device, slot, normalized)
            .map_err(|e| self.map_registry_error(device_id, index, e))?;

        let metric = self
            .registry
            .metric_name(device, slot)
            .unwrap_or_default()
            .to_string();
        debug!(device, index = slot, metric = %metric, value = normalized, "Value ingested");

        Ok(Accepted {
            device_id: device,
            index: slot,
            message: format!("Updated #{} | {}", device, metric),
            metric,
            value: normalized,
        })
    }

    fn is_stopping(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    fn map_registry_error(&self, device_id: i64, index: i64, error: RegistryError) -> IngestError {
        match error {
            RegistryError::InvalidDevice(_) => IngestError::InvalidDevice {
                device_id,
                valid: self.registry.device_ids().collect(),
            },
            RegistryError::IndexOutOfRange { device, len, .. } => IngestError::IndexOutOfRange {
                device_id: device,
                index,
                max: len.saturating_sub(1),
            },
            RegistryError::InvalidValue(value) => IngestError::InvalidValue(value),
        }
    }
}
