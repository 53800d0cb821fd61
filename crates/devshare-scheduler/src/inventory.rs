//! Per-node device inventory
//!
//! [`DeviceInventory`] maps node names to [`NodeDevice`] records. The map
//! itself sits behind a coarse lock that is only taken for writing when a
//! node appears or disappears. Each node carries its own lock around its
//! [`NodeDeviceRecord`], reachable only through the scoped [`NodeDevice::read`]
//! and crate-internal [`NodeDevice::write`] accessors, so the guard is
//! released on every exit path.

use chrono::Utc;
use devshare_core::{
    Allocation, DeviceSpec, DeviceType, DeviceTypeSummary, DeviceUnit, DevshareError,
    DevshareResult, InventoryChange, InventoryEvent, NodeDeviceSummary, WorkloadEvent,
};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Device accounting for one node
#[derive(Debug, Clone, Default)]
pub struct NodeDeviceRecord {
    units: BTreeMap<DeviceType, BTreeMap<u32, DeviceUnit>>,
    allocations: HashMap<Uuid, Allocation>,
}

impl NodeDeviceRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up one unit
    pub fn unit(&self, device_type: DeviceType, minor: u32) -> Option<&DeviceUnit> {
        self.units.get(&device_type).and_then(|units| units.get(&minor))
    }

    /// Units of one type, ascending by minor
    pub fn units(&self, device_type: DeviceType) -> impl Iterator<Item = &DeviceUnit> + '_ {
        self.units
            .get(&device_type)
            .into_iter()
            .flat_map(|units| units.values())
    }

    /// Committed allocation of a workload on this node
    pub fn allocation(&self, workload_id: &Uuid) -> Option<&Allocation> {
        self.allocations.get(workload_id)
    }

    pub fn allocation_count(&self) -> usize {
        self.allocations.len()
    }

    /// Sum of amounts that recorded allocations take from one unit
    fn reserved_on(&self, device_type: DeviceType, minor: u32) -> u64 {
        self.allocations
            .values()
            .flat_map(|allocation| allocation.get(device_type).iter())
            .filter(|item| item.minor == minor)
            .map(|item| item.amount)
            .sum()
    }

    /// Insert or update a unit; returns whether anything changed.
    ///
    /// An existing unit keeps its usage. A new unit takes its usage from
    /// allocations already recorded against its minor.
    pub(crate) fn upsert_unit(
        &mut self,
        device_type: DeviceType,
        minor: u32,
        total: u64,
        healthy: bool,
    ) -> bool {
        let reserved = self.reserved_on(device_type, minor);
        let units = self.units.entry(device_type).or_default();
        match units.get_mut(&minor) {
            Some(unit) if unit.total == total && unit.healthy == healthy => false,
            Some(unit) => {
                unit.total = total;
                unit.healthy = healthy;
                if unit.used > unit.total {
                    warn!(
                        device_type = %device_type,
                        minor = minor,
                        used = unit.used,
                        total = unit.total,
                        "Device capacity shrank below current usage"
                    );
                }
                true
            }
            None => {
                let mut unit = DeviceUnit::new(device_type, minor, total);
                unit.healthy = healthy;
                unit.used = reserved;
                units.insert(minor, unit);
                true
            }
        }
    }

    pub(crate) fn set_health(&mut self, device_type: DeviceType, minor: u32, healthy: bool) -> bool {
        match self
            .units
            .get_mut(&device_type)
            .and_then(|units| units.get_mut(&minor))
        {
            Some(unit) if unit.healthy != healthy => {
                unit.healthy = healthy;
                true
            }
            Some(_) => false,
            None => {
                warn!(
                    device_type = %device_type,
                    minor = minor,
                    "Health update for unknown device ignored"
                );
                false
            }
        }
    }

    pub(crate) fn remove_unit(&mut self, device_type: DeviceType, minor: u32) -> bool {
        let Some(units) = self.units.get_mut(&device_type) else {
            return false;
        };
        let removed = units.remove(&minor).is_some();
        if units.is_empty() {
            self.units.remove(&device_type);
        }
        removed
    }

    /// Check that `allocation` fits, treating the workload's current
    /// allocation on this node as already released
    pub(crate) fn validate(
        &self,
        node: &str,
        workload_id: &Uuid,
        allocation: &Allocation,
    ) -> DevshareResult<()> {
        let previous = self.allocations.get(workload_id);
        let insufficient = |device_type| DevshareError::InsufficientDevices {
            node: node.to_string(),
            device_type,
        };
        for (device_type, items) in allocation.iter() {
            for item in items {
                let unit = self
                    .unit(device_type, item.minor)
                    .ok_or_else(|| insufficient(device_type))?;
                let held = previous
                    .map(|p| {
                        p.get(device_type)
                            .iter()
                            .filter(|i| i.minor == item.minor)
                            .map(|i| i.amount)
                            .sum::<u64>()
                    })
                    .unwrap_or(0);
                let requested: u64 = items
                    .iter()
                    .filter(|i| i.minor == item.minor)
                    .map(|i| i.amount)
                    .sum();
                if !unit.healthy || unit.free().saturating_add(held) < requested {
                    return Err(insufficient(device_type));
                }
            }
        }
        Ok(())
    }

    /// Add an allocation's amounts to unit usage and record it.
    /// Callers release any previous allocation of the workload first.
    pub(crate) fn apply_allocation(&mut self, workload_id: Uuid, allocation: Allocation) {
        for (device_type, items) in allocation.iter() {
            for item in items {
                match self
                    .units
                    .get_mut(&device_type)
                    .and_then(|units| units.get_mut(&item.minor))
                {
                    Some(unit) => unit.used = unit.used.saturating_add(item.amount),
                    None => debug!(
                        workload_id = %workload_id,
                        device_type = %device_type,
                        minor = item.minor,
                        "Allocation references a device not yet in inventory"
                    ),
                }
            }
        }
        self.allocations.insert(workload_id, allocation);
    }

    /// Remove a workload's allocation and give its amounts back
    pub(crate) fn release_allocation(&mut self, workload_id: &Uuid) -> Option<Allocation> {
        let allocation = self.allocations.remove(workload_id)?;
        for (device_type, items) in allocation.iter() {
            for item in items {
                if let Some(unit) = self
                    .units
                    .get_mut(&device_type)
                    .and_then(|units| units.get_mut(&item.minor))
                {
                    unit.used = unit.used.saturating_sub(item.amount);
                }
            }
        }
        Some(allocation)
    }

    /// Verify that every unit's usage equals the sum of recorded
    /// allocations referencing it
    pub fn verify_accounting(&self) -> DevshareResult<()> {
        for (device_type, units) in &self.units {
            for (minor, unit) in units {
                let reserved = self.reserved_on(*device_type, *minor);
                if unit.used != reserved {
                    return Err(DevshareError::Internal(format!(
                        "{} minor {} has used {} but reservations sum to {}",
                        device_type, minor, unit.used, reserved
                    )));
                }
            }
        }
        Ok(())
    }

    fn summary(&self, node: &str) -> NodeDeviceSummary {
        let mut totals = BTreeMap::new();
        let mut units = BTreeMap::new();
        for (device_type, by_minor) in &self.units {
            let mut summary = DeviceTypeSummary::default();
            for unit in by_minor.values() {
                summary.total += unit.total;
                summary.used += unit.used;
                if unit.healthy {
                    summary.healthy_units += 1;
                    summary.free += unit.free();
                } else {
                    summary.unhealthy_units += 1;
                }
            }
            totals.insert(*device_type, summary);
            units.insert(*device_type, by_minor.values().cloned().collect());
        }
        NodeDeviceSummary {
            node: node.to_string(),
            totals,
            units,
            allocations: self
                .allocations
                .iter()
                .map(|(id, allocation)| (*id, allocation.clone()))
                .collect(),
            taken_at: Utc::now(),
        }
    }
}

/// A node's device record behind its own reader/writer lock
#[derive(Debug)]
pub struct NodeDevice {
    node: String,
    record: RwLock<NodeDeviceRecord>,
}

impl NodeDevice {
    fn new(node: String) -> Self {
        Self {
            node,
            record: RwLock::new(NodeDeviceRecord::new()),
        }
    }

    /// Node name
    pub fn name(&self) -> &str {
        &self.node
    }

    /// Run `f` under the shared guard
    pub fn read<R>(&self, f: impl FnOnce(&NodeDeviceRecord) -> R) -> R {
        let record = self.record.read();
        f(&record)
    }

    /// Run `f` under the exclusive guard
    pub(crate) fn write<R>(&self, f: impl FnOnce(&mut NodeDeviceRecord) -> R) -> R {
        let mut record = self.record.write();
        f(&mut record)
    }

    /// Read-only copy for inspection
    pub fn summary(&self) -> NodeDeviceSummary {
        self.read(|record| record.summary(&self.node))
    }
}

type NodesMap = HashMap<String, Arc<NodeDevice>>;

/// Device inventory for every known node
#[derive(Debug, Default)]
pub struct DeviceInventory {
    nodes: RwLock<NodesMap>,
}

impl DeviceInventory {
    /// Create an empty inventory
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a node's record
    pub fn get(&self, node: &str) -> Option<Arc<NodeDevice>> {
        self.nodes.read().get(node).cloned()
    }

    fn get_or_create(&self, node: &str) -> Arc<NodeDevice> {
        if let Some(existing) = self.get(node) {
            return existing;
        }
        let mut nodes = self.nodes.write();
        nodes
            .entry(node.to_string())
            .or_insert_with(|| {
                info!(node = %node, "Tracking devices for node");
                Arc::new(NodeDevice::new(node.to_string()))
            })
            .clone()
    }

    /// Names of all tracked nodes, sorted
    pub fn node_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.nodes.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    /// Read-only copy of one node
    pub fn snapshot(&self, node: &str) -> Option<NodeDeviceSummary> {
        self.get(node).map(|device| device.summary())
    }

    /// Read-only copies of every node
    pub fn snapshot_all(&self) -> BTreeMap<String, NodeDeviceSummary> {
        let devices: Vec<Arc<NodeDevice>> = self.nodes.read().values().cloned().collect();
        devices
            .into_iter()
            .map(|device| (device.name().to_string(), device.summary()))
            .collect()
    }

    /// Apply one device change. Re-applying an event is a no-op.
    pub fn apply_inventory_event(&self, event: &InventoryEvent) {
        let device = match &event.change {
            InventoryChange::Capacity { .. } => self.get_or_create(&event.node),
            InventoryChange::Health { .. } | InventoryChange::Removal { .. } => {
                match self.get(&event.node) {
                    Some(device) => device,
                    None => {
                        debug!(node = %event.node, "Device event for unknown node ignored");
                        return;
                    }
                }
            }
        };

        let changed = device.write(|record| match event.change {
            InventoryChange::Capacity {
                minor,
                total,
                healthy,
            } => record.upsert_unit(event.device_type, minor, total, healthy),
            InventoryChange::Health { minor, healthy } => {
                record.set_health(event.device_type, minor, healthy)
            }
            InventoryChange::Removal { minor } => record.remove_unit(event.device_type, minor),
        });

        if changed {
            debug!(
                node = %event.node,
                device_type = %event.device_type,
                change = ?event.change,
                "Applied device inventory event"
            );
        }
    }

    /// Replace a node's device list, keeping usage of units that stay
    pub fn sync_node(&self, node: &str, devices: &[DeviceSpec]) {
        let device = self.get_or_create(node);
        device.write(|record| {
            let stale: Vec<(DeviceType, u32)> = record
                .units
                .iter()
                .flat_map(|(ty, units)| units.keys().map(move |minor| (*ty, *minor)))
                .filter(|(ty, minor)| {
                    !devices
                        .iter()
                        .any(|d| d.device_type == *ty && d.minor == *minor)
                })
                .collect();
            for (ty, minor) in stale {
                record.remove_unit(ty, minor);
            }
            for spec in devices {
                record.upsert_unit(spec.device_type, spec.minor, spec.total, spec.healthy);
            }
        });
        debug!(node = %node, devices = devices.len(), "Synced node devices");
    }

    /// Forget a node and everything recorded on it
    pub fn remove_node(&self, node: &str) -> bool {
        let removed = self.nodes.write().remove(node).is_some();
        if removed {
            info!(node = %node, "Removed node from device inventory");
        }
        removed
    }

    /// Replay or release a workload's committed allocation. Idempotent.
    pub fn apply_workload_event(&self, event: &WorkloadEvent) {
        match event {
            WorkloadEvent::Assigned {
                workload_id,
                node,
                allocation,
            } => {
                let device = self.get_or_create(node);
                device.write(|record| {
                    if record.allocation(workload_id) == Some(allocation) {
                        return;
                    }
                    record.release_allocation(workload_id);
                    record.apply_allocation(*workload_id, allocation.clone());
                    for (device_type, items) in allocation.iter() {
                        for item in items {
                            if let Some(unit) = record.unit(device_type, item.minor) {
                                if unit.used > unit.total {
                                    warn!(
                                        node = %node,
                                        workload_id = %workload_id,
                                        device_type = %device_type,
                                        minor = item.minor,
                                        used = unit.used,
                                        total = unit.total,
                                        "Replayed allocation over-commits device"
                                    );
                                }
                            }
                        }
                    }
                    debug!(node = %node, workload_id = %workload_id, "Replayed workload allocation");
                });
            }
            WorkloadEvent::Deleted { workload_id, node } => {
                let Some(device) = self.get(node) else {
                    return;
                };
                if device
                    .write(|record| record.release_allocation(workload_id))
                    .is_some()
                {
                    debug!(node = %node, workload_id = %workload_id, "Released workload allocation");
                }
            }
        }
    }
}
