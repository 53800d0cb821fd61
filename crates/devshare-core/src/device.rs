//! Device types, units and inventory summaries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use uuid::Uuid;

use crate::allocation::Allocation;
use crate::error::DevshareError;

/// Class of specialized hardware
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Gpu,
    Rdma,
    Fpga,
}

impl DeviceType {
    /// Every supported device type, in normalization order
    pub const ALL: [DeviceType; 3] = [DeviceType::Gpu, DeviceType::Rdma, DeviceType::Fpga];

    /// Whether a request larger than one unit must be covered by completely
    /// free units (a GPU share cannot straddle partially used cards)
    pub fn splits_whole_units(&self) -> bool {
        matches!(self, DeviceType::Gpu)
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Gpu => write!(f, "gpu"),
            DeviceType::Rdma => write!(f, "rdma"),
            DeviceType::Fpga => write!(f, "fpga"),
        }
    }
}

impl FromStr for DeviceType {
    type Err = DevshareError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "gpu" => Ok(DeviceType::Gpu),
            "rdma" => Ok(DeviceType::Rdma),
            "fpga" => Ok(DeviceType::Fpga),
            other => Err(DevshareError::Config(format!(
                "unknown device type: {}",
                other
            ))),
        }
    }
}

/// One device instance on a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceUnit {
    /// Device type
    pub device_type: DeviceType,
    /// Minor number, unique within node and type
    pub minor: u32,
    /// Total capacity on the type's normalized scale
    pub total: u64,
    /// Capacity consumed by reservations
    pub used: u64,
    /// Whether the device may be selected
    pub healthy: bool,
}

impl DeviceUnit {
    /// Create an unused, healthy unit
    pub fn new(device_type: DeviceType, minor: u32, total: u64) -> Self {
        Self {
            device_type,
            minor,
            total,
            used: 0,
            healthy: true,
        }
    }

    /// Capacity still available
    pub fn free(&self) -> u64 {
        self.total.saturating_sub(self.used)
    }
}

/// Device unit as reported by the inventory source (no usage)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSpec {
    pub device_type: DeviceType,
    pub minor: u32,
    pub total: u64,
    #[serde(default = "default_healthy")]
    pub healthy: bool,
}

fn default_healthy() -> bool {
    true
}

/// Capacity, health or removal of one device unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum InventoryChange {
    /// Upsert a unit with the given capacity
    Capacity {
        minor: u32,
        total: u64,
        #[serde(default = "default_healthy")]
        healthy: bool,
    },
    /// Flip health of an existing unit
    Health { minor: u32, healthy: bool },
    /// Remove a unit
    Removal { minor: u32 },
}

/// Inventory change delivered by the device watch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryEvent {
    pub node: String,
    pub device_type: DeviceType,
    pub change: InventoryChange,
}

/// Workload change delivered by the workload watch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum WorkloadEvent {
    /// A committed allocation, replayed from durable state
    Assigned {
        workload_id: Uuid,
        node: String,
        allocation: Allocation,
    },
    /// The workload is gone; release what it holds
    Deleted { workload_id: Uuid, node: String },
}

/// Per-type totals in a node summary
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceTypeSummary {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub healthy_units: u32,
    pub unhealthy_units: u32,
}

/// Read-only snapshot of a node's device accounting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDeviceSummary {
    /// Node name
    pub node: String,
    /// Totals per device type
    pub totals: BTreeMap<DeviceType, DeviceTypeSummary>,
    /// Unit detail per device type, ordered by minor
    pub units: BTreeMap<DeviceType, Vec<DeviceUnit>>,
    /// Committed allocations by workload
    pub allocations: BTreeMap<Uuid, Allocation>,
    /// When the snapshot was taken
    pub taken_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_type_display_and_parse() {
        for ty in DeviceType::ALL {
            assert_eq!(ty.to_string().parse::<DeviceType>().unwrap(), ty);
        }
        assert!("tpu".parse::<DeviceType>().is_err());
    }

    #[test]
    fn test_unit_free_saturates() {
        let mut unit = DeviceUnit::new(DeviceType::Gpu, 0, 100);
        unit.used = 40;
        assert_eq!(unit.free(), 60);
        unit.total = 20;
        assert_eq!(unit.free(), 0);
    }

    #[test]
    fn test_inventory_event_json() {
        let json = r#"{"node":"n1","device_type":"rdma","change":{"kind":"capacity","minor":3,"total":1}}"#;
        let event: InventoryEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.device_type, DeviceType::Rdma);
        assert_eq!(
            event.change,
            InventoryChange::Capacity {
                minor: 3,
                total: 1,
                healthy: true
            }
        );
    }
}
