//! Device allocator for selecting and reserving device units

use devshare_core::{Allocation, DevshareError, DevshareResult, NormalizedRequest};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::inventory::{NodeDevice, NodeDeviceRecord};
use crate::policy::{BestFitPolicy, Candidate, SelectionPolicy};

/// Allocator that picks device units and commits them to a node record
#[derive(Clone)]
pub struct Allocator {
    /// Unit selection policy
    policy: Arc<dyn SelectionPolicy>,
}

impl Default for Allocator {
    fn default() -> Self {
        Self::new(Arc::new(BestFitPolicy))
    }
}

impl std::fmt::Debug for Allocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocator")
            .field("policy", &self.policy.name())
            .finish()
    }
}

impl Allocator {
    /// Create an allocator with the given selection policy
    pub fn new(policy: Arc<dyn SelectionPolicy>) -> Self {
        Self { policy }
    }

    /// Name of the selection policy
    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    /// Select units for `request` on one node without changing usage.
    ///
    /// Capacity the workload already holds on the node counts as free, so a
    /// workload can be re-placed on the node it occupies. Fails with
    /// `InsufficientDevices` if any device type cannot be covered; nothing
    /// is returned for the types that could.
    pub fn allocate(
        &self,
        node: &str,
        workload_id: &Uuid,
        request: &NormalizedRequest,
        record: &NodeDeviceRecord,
    ) -> DevshareResult<Allocation> {
        let held = record.allocation(workload_id);
        let mut allocation = Allocation::new();

        for (device_type, need) in request.iter() {
            let candidates: Vec<Candidate> = record
                .units(device_type)
                .filter(|unit| unit.healthy)
                .map(|unit| {
                    let own: u64 = held
                        .map(|a| {
                            a.get(device_type)
                                .iter()
                                .filter(|item| item.minor == unit.minor)
                                .map(|item| item.amount)
                                .sum()
                        })
                        .unwrap_or(0);
                    Candidate {
                        minor: unit.minor,
                        free: unit.free().saturating_add(own).min(unit.total),
                        total: unit.total,
                    }
                })
                .filter(|candidate| candidate.free > 0)
                .collect();

            let items = self
                .policy
                .select(&candidates, need, device_type.splits_whole_units())
                .ok_or_else(|| DevshareError::InsufficientDevices {
                    node: node.to_string(),
                    device_type,
                })?;
            allocation.insert(device_type, items);
        }

        debug!(
            node = %node,
            workload_id = %workload_id,
            policy = self.policy.name(),
            allocation = ?allocation,
            "Allocated devices"
        );

        Ok(allocation)
    }

    /// Commit `allocation` for a workload on a node.
    ///
    /// Runs under the node's exclusive guard and re-validates capacity
    /// first. Reserving the same allocation again is a no-op; reserving a
    /// different one replaces the old reservation. Returns the allocation
    /// the workload held before, for [`Allocator::restore`].
    pub fn reserve(
        &self,
        device: &NodeDevice,
        workload_id: Uuid,
        allocation: Allocation,
    ) -> DevshareResult<Option<Allocation>> {
        device.write(|record| commit(record, device.name(), workload_id, allocation))
    }

    /// Allocate and commit in one exclusive critical section
    pub fn allocate_and_reserve(
        &self,
        device: &NodeDevice,
        workload_id: Uuid,
        request: &NormalizedRequest,
    ) -> DevshareResult<Reserved> {
        device.write(|record| {
            let allocation = self.allocate(device.name(), &workload_id, request, record)?;
            let replaced = commit(record, device.name(), workload_id, allocation.clone())?;
            Ok(Reserved {
                allocation,
                replaced,
            })
        })
    }

    /// Release a workload's reservation on a node, if it has one
    pub fn unreserve(&self, device: &NodeDevice, workload_id: &Uuid) -> Option<Allocation> {
        let released = device.write(|record| record.release_allocation(workload_id));
        if released.is_some() {
            debug!(
                node = %device.name(),
                workload_id = %workload_id,
                "Released devices"
            );
        }
        released
    }

    /// Undo one reservation: drop `reserved` and put back what it replaced.
    ///
    /// Does nothing if the workload's allocation on the node is no longer
    /// `reserved`, so a later commit or release is never clobbered.
    pub fn restore(
        &self,
        device: &NodeDevice,
        workload_id: &Uuid,
        reserved: &Allocation,
        replaced: Option<Allocation>,
    ) -> bool {
        device.write(|record| {
            if record.allocation(workload_id) != Some(reserved) {
                debug!(
                    node = %device.name(),
                    workload_id = %workload_id,
                    "Reservation changed since commit, nothing to restore"
                );
                return false;
            }
            record.release_allocation(workload_id);
            if let Some(previous) = replaced {
                record.apply_allocation(*workload_id, previous);
            }
            true
        })
    }
}

/// Outcome of [`Allocator::allocate_and_reserve`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reserved {
    /// Allocation now committed
    pub allocation: Allocation,
    /// Allocation the workload held on the node before, if any
    pub replaced: Option<Allocation>,
}

fn commit(
    record: &mut NodeDeviceRecord,
    node: &str,
    workload_id: Uuid,
    allocation: Allocation,
) -> DevshareResult<Option<Allocation>> {
    if record.allocation(&workload_id) == Some(&allocation) {
        return Ok(Some(allocation));
    }
    record.validate(node, &workload_id, &allocation)?;
    let replaced = record.release_allocation(&workload_id);

    info!(
        node = %node,
        workload_id = %workload_id,
        allocation = ?allocation,
        "Reserved devices"
    );

    record.apply_allocation(workload_id, allocation);
    Ok(replaced)
}
