//! Per-device register banks.
//!
//! Every device owns a [`RegisterBank`] and the matching display values behind
//! a single lock, so a write updates both or neither as seen by any reader.
//! The device map itself is fixed at construction and needs no lock, which
//! keeps writes to different devices independent of each other.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::trace;

use crate::config::{DeviceConfig, validate_devices};

/// Modbus unit address of a logical device.
pub type DeviceId = u8;

/// Errors returned by registry reads and writes.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegistryError {
    #[error("device {0} is not configured")]
    InvalidDevice(DeviceId),

    #[error("index {index} is out of range for device {device} (0-{})", .len.saturating_sub(1))]
    IndexOutOfRange {
        device: DeviceId,
        index: usize,
        len: usize,
    },

    #[error("value {0} is not a finite number")]
    InvalidValue(f64),
}

/// Fixed-size array of values for one device.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterBank {
    values: Box<[f64]>,
}

impl RegisterBank {
    /// Create a bank of `len` slots, all zero.
    pub fn new(len: usize) -> Self {
        Self {
            values: vec![0.0; len].into_boxed_slice(),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<f64> {
        self.values.get(index).copied()
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    fn set(&mut self, index: usize, value: f64) {
        self.values[index] = value;
    }
}

/// Bank and display values guarded together.
#[derive(Debug)]
struct DeviceState {
    bank: RegisterBank,
    display: Vec<f64>,
}

#[derive(Debug)]
struct DeviceSlot {
    metrics: Vec<String>,
    state: Mutex<DeviceState>,
}

/// Owner of every configured device's register bank.
#[derive(Debug)]
pub struct DeviceRegistry {
    devices: BTreeMap<DeviceId, DeviceSlot>,
    display_precision: u32,
}

impl DeviceRegistry {
    /// Build the registry from the configured device set.
    pub fn new(devices: &[DeviceConfig], display_precision: u32) -> crate::Result<Self> {
        validate_devices(devices)?;

        let devices = devices
            .iter()
            .map(|device| {
                let len = device.metrics.len();
                let slot = DeviceSlot {
                    metrics: device.metrics.clone(),
                    state: Mutex::new(DeviceState {
                        bank: RegisterBank::new(len),
                        display: vec![0.0; len],
                    }),
                };
                (device.id, slot)
            })
            .collect();

        Ok(Self {
            devices,
            display_precision,
        })
    }

    /// Configured device ids in ascending order.
    pub fn device_ids(&self) -> impl Iterator<Item = DeviceId> + '_ {
        self.devices.keys().copied()
    }

    pub fn contains(&self, device: DeviceId) -> bool {
        self.devices.contains_key(&device)
    }

    pub fn metric_name(&self, device: DeviceId, index: usize) -> Option<&str> {
        self.devices
            .get(&device)
            .and_then(|slot| slot.metrics.get(index))
            .map(String::as_str)
    }

    /// Number of slots in a device's bank.
    pub fn bank_len(&self, device: DeviceId) -> Result<usize, RegistryError> {
        Ok(self.slot(device)?.metrics.len())
    }

    /// Copy of a device's bank as of this call.
    pub fn get_bank(&self, device: DeviceId) -> Result<RegisterBank, RegistryError> {
        Ok(self.slot(device)?.state.lock().bank.clone())
    }

    /// Write one slot and its display value.
    pub fn write(
        &self,
        device: DeviceId,
        index: usize,
        value: f64,
    ) -> Result<(), RegistryError> {
        self.write_many(device, index, std::slice::from_ref(&value))
    }

    /// Write consecutive slots starting at `start` in a single critical section.
    ///
    /// Nothing is written unless every value is finite and every index is in range.
    pub fn write_many(
        &self,
        device: DeviceId,
        start: usize,
        values: &[f64],
    ) -> Result<(), RegistryError> {
        let slot = self.slot(device)?;
        let len = slot.metrics.len();

        let end = start.checked_add(values.len()).unwrap_or(usize::MAX);
        if start >= len || end > len {
            let index = if start >= len { start } else { len };
            return Err(RegistryError::IndexOutOfRange { device, index, len });
        }
        if let Some(bad) = values.iter().find(|v| !v.is_finite()) {
            return Err(RegistryError::InvalidValue(*bad));
        }

        let mut state = slot.state.lock();
        for (offset, value) in values.iter().enumerate() {
            state.bank.set(start + offset, *value);
            state.display[start + offset] = round_to(*value, self.display_precision);
        }
        drop(state);

        trace!(device, start, count = values.len(), "Registers written");
        Ok(())
    }

    /// Display values of a device, paired with their metric names.
    pub(crate) fn display_values(&self, device: DeviceId) -> Option<Vec<(&str, f64)>> {
        let slot = self.devices.get(&device)?;
        let display = slot.state.lock().display.clone();
        Some(
            slot.metrics
                .iter()
                .map(String::as_str)
                .zip(display)
                .collect(),
        )
    }

    fn slot(&self, device: DeviceId) -> Result<&DeviceSlot, RegistryError> {
        self.devices
            .get(&device)
            .ok_or(RegistryError::InvalidDevice(device))
    }
}

/// Round `value` to `precision` decimal places.
pub fn round_to(value: f64, precision: u32) -> f64 {
    let factor = 10f64.powi(precision as i32);
    (value * factor).round() / factor
}
