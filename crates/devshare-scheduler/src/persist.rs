//! Durable record of admission decisions

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use devshare_core::{
    Allocation, DeviceAllocationRecord, DevshareError, DevshareResult, WorkloadEvent,
    WorkloadSpec,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

/// Writes a workload's device allocation to durable storage.
///
/// Implementations must be idempotent: persisting the same records for the
/// same workload twice leaves one copy. Return
/// [`DevshareError::ConflictOnCommit`] for optimistic-concurrency conflicts
/// so the caller retries.
#[async_trait]
pub trait AllocationPersister: Send + Sync {
    async fn persist(
        &self,
        workload: &WorkloadSpec,
        node: &str,
        records: &[DeviceAllocationRecord],
    ) -> DevshareResult<()>;
}

/// A persisted assignment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAssignment {
    /// `namespace/name` of the workload
    pub workload_key: String,
    /// Node the workload is bound to
    pub node: String,
    /// Device allocation records
    pub records: Vec<DeviceAllocationRecord>,
    /// Bumped on every change
    pub version: u64,
    /// Last change
    pub updated_at: DateTime<Utc>,
}

/// In-process workload store
#[derive(Debug, Default)]
pub struct InMemoryWorkloadStore {
    assignments: RwLock<HashMap<Uuid, StoredAssignment>>,
    pending_conflicts: AtomicU32,
    unavailable: AtomicBool,
}

impl InMemoryWorkloadStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` writes fail with a conflict
    pub fn inject_conflicts(&self, count: u32) {
        self.pending_conflicts.store(count, Ordering::SeqCst);
    }

    /// Make every write fail until cleared
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Stored assignment for a workload
    pub async fn get(&self, workload_id: &Uuid) -> Option<StoredAssignment> {
        self.assignments.read().await.get(workload_id).cloned()
    }

    /// Forget a workload, returning what was stored
    pub async fn remove(&self, workload_id: &Uuid) -> Option<StoredAssignment> {
        let removed = self.assignments.write().await.remove(workload_id);
        if let Some(ref assignment) = removed {
            debug!(workload = %assignment.workload_key, "Removed stored assignment");
        }
        removed
    }

    /// Number of stored assignments
    pub async fn len(&self) -> usize {
        self.assignments.read().await.len()
    }

    /// Whether the store is empty
    pub async fn is_empty(&self) -> bool {
        self.assignments.read().await.is_empty()
    }

    /// Events that rebuild inventory usage after a restart
    pub async fn replay_events(&self) -> Vec<WorkloadEvent> {
        let assignments = self.assignments.read().await;
        let mut events: Vec<WorkloadEvent> = assignments
            .iter()
            .map(|(id, assignment)| WorkloadEvent::Assigned {
                workload_id: *id,
                node: assignment.node.clone(),
                allocation: Allocation::from_records(&assignment.records),
            })
            .collect();
        events.sort_by_key(|event| match event {
            WorkloadEvent::Assigned { workload_id, .. } => *workload_id,
            WorkloadEvent::Deleted { workload_id, .. } => *workload_id,
        });
        events
    }

    fn take_conflict(&self) -> bool {
        self.pending_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl AllocationPersister for InMemoryWorkloadStore {
    async fn persist(
        &self,
        workload: &WorkloadSpec,
        node: &str,
        records: &[DeviceAllocationRecord],
    ) -> DevshareResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DevshareError::Persistence(
                "workload store unavailable".to_string(),
            ));
        }
        if self.take_conflict() {
            return Err(DevshareError::ConflictOnCommit(format!(
                "workload {} was modified concurrently",
                workload.key()
            )));
        }

        let mut assignments = self.assignments.write().await;
        let version = match assignments.get(&workload.id) {
            Some(existing) if existing.node == node && existing.records == records => {
                return Ok(());
            }
            Some(existing) => existing.version + 1,
            None => 1,
        };

        assignments.insert(
            workload.id,
            StoredAssignment {
                workload_key: workload.key(),
                node: node.to_string(),
                records: records.to_vec(),
                version,
                updated_at: Utc::now(),
            },
        );

        info!(
            workload = %workload.key(),
            node = %node,
            version = version,
            "Persisted device allocation"
        );

        Ok(())
    }
}
