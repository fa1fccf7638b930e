//! Read projection of the last displayed value per device and metric.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use crate::registry::{DeviceId, DeviceRegistry};

/// Device id to metric name to display value.
pub type Snapshot = BTreeMap<DeviceId, BTreeMap<String, f64>>;

/// One metric as shown on a monitor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricDisplay {
    pub index: usize,
    pub name: String,
    pub value: f64,
}

/// All metrics of one device, in register order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceDisplay {
    pub device_id: DeviceId,
    pub metrics: Vec<MetricDisplay>,
}

/// Display values written alongside each register bank.
///
/// The cache has no write path of its own; its entries change only through
/// [`DeviceRegistry::write`] and [`DeviceRegistry::write_many`].
#[derive(Debug, Clone)]
pub struct DisplayCache {
    registry: Arc<DeviceRegistry>,
}

impl DisplayCache {
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        Self { registry }
    }

    /// Current display values for every device.
    ///
    /// Each device is read under its own lock, so a device's entries never
    /// show half of a write. Different devices may be read at slightly
    /// different instants.
    pub fn snapshot(&self) -> Snapshot {
        self.registry
            .device_ids()
            .filter_map(|id| {
                let values = self.registry.display_values(id)?;
                let metrics = values
                    .into_iter()
                    .map(|(name, value)| (name.to_string(), value))
                    .collect();
                Some((id, metrics))
            })
            .collect()
    }

    /// Display values of one device, in register order.
    pub fn device(&self, device: DeviceId) -> Option<DeviceDisplay> {
        let values = self.registry.display_values(device)?;
        Some(DeviceDisplay {
            device_id: device,
            metrics: values
                .into_iter()
                .enumerate()
                .map(|(index, (name, value))| MetricDisplay {
                    index,
                    name: name.to_string(),
                    value,
                })
                .collect(),
        })
    }

    /// Display values of every device, ordered by id then metric index.
    pub fn devices(&self) -> Vec<DeviceDisplay> {
        self.registry
            .device_ids()
            .filter_map(|id| self.device(id))
            .collect()
    }
}
