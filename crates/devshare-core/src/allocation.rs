//! Normalized requests and device allocations

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::device::DeviceType;

/// Device ask reduced to one quantity per device type
///
/// GPU quantities are percent-of-card (100 is one whole card); RDMA and
/// FPGA quantities are unit counts. Zero entries are never stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NormalizedRequest {
    quantities: BTreeMap<DeviceType, u64>,
}

impl NormalizedRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style pointwise addition
    pub fn with(mut self, device_type: DeviceType, quantity: u64) -> Self {
        self.add(device_type, quantity);
        self
    }

    pub(crate) fn add(&mut self, device_type: DeviceType, quantity: u64) {
        if quantity == 0 {
            return;
        }
        let entry = self.quantities.entry(device_type).or_insert(0);
        *entry = entry.saturating_add(quantity);
    }

    /// Pointwise sum of two requests
    pub fn merge(mut self, other: &NormalizedRequest) -> Self {
        for (ty, q) in &other.quantities {
            self.add(*ty, *q);
        }
        self
    }

    pub fn get(&self, device_type: DeviceType) -> u64 {
        self.quantities.get(&device_type).copied().unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (DeviceType, u64)> + '_ {
        self.quantities.iter().map(|(ty, q)| (*ty, *q))
    }

    pub fn is_empty(&self) -> bool {
        self.quantities.is_empty()
    }
}

/// Amount taken from one device unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceAllocationItem {
    pub minor: u32,
    pub amount: u64,
}

/// Concrete device units selected for a workload on one node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    devices: BTreeMap<DeviceType, Vec<DeviceAllocationItem>>,
}

impl Allocation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the items selected for one device type
    pub fn insert(&mut self, device_type: DeviceType, items: Vec<DeviceAllocationItem>) {
        if items.is_empty() {
            self.devices.remove(&device_type);
        } else {
            self.devices.insert(device_type, items);
        }
    }

    pub fn get(&self, device_type: DeviceType) -> &[DeviceAllocationItem] {
        self.devices
            .get(&device_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = (DeviceType, &[DeviceAllocationItem])> + '_ {
        self.devices.iter().map(|(ty, items)| (*ty, items.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Total amount taken for a device type
    pub fn total(&self, device_type: DeviceType) -> u64 {
        self.get(device_type).iter().map(|item| item.amount).sum()
    }

    /// Flatten into the durable form attached to the workload
    pub fn to_records(&self) -> Vec<DeviceAllocationRecord> {
        self.iter()
            .flat_map(|(device_type, items)| {
                items.iter().map(move |item| DeviceAllocationRecord {
                    device_type,
                    minor: item.minor,
                    amount: item.amount,
                })
            })
            .collect()
    }

    /// Rebuild from the durable form, preserving record order per type
    pub fn from_records(records: &[DeviceAllocationRecord]) -> Self {
        let mut allocation = Allocation::new();
        for record in records {
            allocation
                .devices
                .entry(record.device_type)
                .or_default()
                .push(DeviceAllocationItem {
                    minor: record.minor,
                    amount: record.amount,
                });
        }
        allocation
    }
}

/// Durable allocation entry: `{deviceType, minor, amount}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceAllocationRecord {
    pub device_type: DeviceType,
    pub minor: u32,
    pub amount: u64,
}
