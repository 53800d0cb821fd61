//! Admission lifecycle coordinator
//!
//! Drives one workload through the admission phases:
//!
//! 1. [`Coordinator::begin_attempt`] normalizes the request
//! 2. [`Coordinator::filter_nodes`] checks candidate nodes under shared guards
//! 3. [`Coordinator::reserve`] commits units on the chosen node
//! 4. [`Coordinator::persist`] makes the decision durable, rolling back on failure
//!
//! [`Coordinator::unreserve`] is the rollback for any failure after reserve.
//! Per-attempt data lives in an [`AttemptState`] passed explicitly between
//! phases.

use devshare_core::{
    Allocation, DevshareError, DevshareResult, NodeDeviceSummary, NormalizedRequest,
    WorkloadSpec,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::allocator::Allocator;
use crate::inventory::DeviceInventory;
use crate::normalizer::Normalizer;
use crate::persist::AllocationPersister;
use crate::retry::{retry_on_conflict, RetryConfig};

/// Where an attempt is in the admission lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptPhase {
    Normalized,
    Reserved,
    Bound,
    Unreserved,
}

/// Units committed for an attempt on one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reservation {
    pub node: String,
    pub allocation: Allocation,
    /// What the workload held on the node before this reservation
    #[serde(skip)]
    pub replaced: Option<Allocation>,
}

/// State of one admission attempt for one workload
#[derive(Debug, Clone)]
pub struct AttemptState {
    attempt_id: Uuid,
    workload_id: Uuid,
    skip: bool,
    request: NormalizedRequest,
    reservation: Option<Reservation>,
    phase: AttemptPhase,
}

impl AttemptState {
    pub fn attempt_id(&self) -> Uuid {
        self.attempt_id
    }

    pub fn workload_id(&self) -> Uuid {
        self.workload_id
    }

    /// The workload asks for no managed devices
    pub fn is_skip(&self) -> bool {
        self.skip
    }

    pub fn request(&self) -> &NormalizedRequest {
        &self.request
    }

    pub fn reservation(&self) -> Option<&Reservation> {
        self.reservation.as_ref()
    }

    pub fn phase(&self) -> AttemptPhase {
        self.phase
    }
}

/// Outcome of a tentative check on one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeVerdict {
    pub node: String,
    pub feasible: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Result of a complete admission
#[derive(Debug, Clone, Serialize)]
pub struct AdmissionOutcome {
    pub workload_id: Uuid,
    pub attempt_id: Uuid,
    /// Chosen node; `None` when the workload needs no devices
    pub node: Option<String>,
    pub allocation: Allocation,
    pub phase: AttemptPhase,
    /// Tentative check result per candidate
    pub verdicts: Vec<NodeVerdict>,
}

/// Coordinates normalization, allocation and persistence
pub struct Coordinator {
    inventory: Arc<DeviceInventory>,
    allocator: Allocator,
    normalizer: Normalizer,
    persister: Arc<dyn AllocationPersister>,
    retry: RetryConfig,
}

impl Coordinator {
    /// Create a coordinator over an explicitly constructed inventory
    pub fn new(
        inventory: Arc<DeviceInventory>,
        allocator: Allocator,
        persister: Arc<dyn AllocationPersister>,
        retry: RetryConfig,
    ) -> Self {
        info!(
            policy = allocator.policy_name(),
            max_attempts = retry.max_attempts,
            "Coordinator initialized"
        );
        Self {
            inventory,
            allocator,
            normalizer: Normalizer::new(),
            persister,
            retry,
        }
    }

    /// The device inventory this coordinator admits against
    pub fn inventory(&self) -> &Arc<DeviceInventory> {
        &self.inventory
    }

    /// Normalize the workload's request and open an attempt
    pub fn begin_attempt(&self, workload: &WorkloadSpec) -> DevshareResult<AttemptState> {
        let normalized = self.normalizer.normalize(workload)?;
        let state = AttemptState {
            attempt_id: Uuid::new_v4(),
            workload_id: workload.id,
            skip: normalized.skip,
            request: normalized.request,
            reservation: None,
            phase: AttemptPhase::Normalized,
        };
        debug!(
            workload = %workload.key(),
            attempt_id = %state.attempt_id,
            skip = state.skip,
            request = ?state.request,
            "Began admission attempt"
        );
        Ok(state)
    }

    /// Check whether `node` could satisfy the attempt, without committing
    pub fn tentative_check(&self, state: &AttemptState, node: &str) -> DevshareResult<()> {
        check_node(&self.inventory, &self.allocator, state, node)
    }

    /// Tentatively check every candidate in parallel; failures stay per node
    pub fn filter_nodes(&self, state: &AttemptState, nodes: &[String]) -> Vec<NodeVerdict> {
        nodes
            .iter()
            .zip(check_nodes(&self.inventory, &self.allocator, state, nodes))
            .map(|(node, result)| verdict(node, &result))
            .collect()
    }

    /// Commit units on `node` for the attempt.
    ///
    /// Allocation is recomputed under the node's exclusive guard, so a
    /// tentative result that went stale is caught here.
    pub fn reserve(&self, state: &mut AttemptState, node: &str) -> DevshareResult<()> {
        if state.skip {
            return Ok(());
        }
        if state.phase != AttemptPhase::Normalized {
            return Err(DevshareError::Internal(format!(
                "attempt {} cannot reserve in phase {:?}",
                state.attempt_id, state.phase
            )));
        }
        let device = self
            .inventory
            .get(node)
            .ok_or_else(|| DevshareError::MissingDevice(node.to_string()))?;
        let reserved =
            self.allocator
                .allocate_and_reserve(&device, state.workload_id, &state.request)?;

        state.reservation = Some(Reservation {
            node: node.to_string(),
            allocation: reserved.allocation,
            replaced: reserved.replaced,
        });
        state.phase = AttemptPhase::Reserved;
        Ok(())
    }

    /// Roll back the attempt's reservation, restoring whatever the workload
    /// held on the node before it. Safe to call repeatedly.
    pub fn unreserve(&self, state: &mut AttemptState) {
        let Some(reservation) = state.reservation.take() else {
            return;
        };
        match self.inventory.get(&reservation.node) {
            Some(device) => {
                self.allocator.restore(
                    &device,
                    &state.workload_id,
                    &reservation.allocation,
                    reservation.replaced.clone(),
                );
            }
            None => {
                debug!(node = %reservation.node, "Node removed before unreserve");
            }
        }
        state.phase = AttemptPhase::Unreserved;
        info!(
            node = %reservation.node,
            workload_id = %state.workload_id,
            attempt_id = %state.attempt_id,
            "Unreserved devices"
        );
    }

    /// Write the reservation to durable storage, retrying on conflict.
    ///
    /// No inventory guard is held here. On failure the reservation is rolled
    /// back before the error is returned.
    pub async fn persist(
        &self,
        state: &mut AttemptState,
        workload: &WorkloadSpec,
    ) -> DevshareResult<()> {
        if state.skip {
            return Ok(());
        }
        let Some(reservation) = state.reservation.as_ref() else {
            return Err(DevshareError::Internal(format!(
                "attempt {} has no reservation to persist",
                state.attempt_id
            )));
        };
        let node = reservation.node.clone();
        let records = reservation.allocation.to_records();

        let result = retry_on_conflict(&self.retry, DevshareError::is_retryable, || {
            self.persister.persist(workload, &node, &records)
        })
        .await;

        match result {
            Ok(()) => {
                state.phase = AttemptPhase::Bound;
                info!(
                    workload = %workload.key(),
                    node = %node,
                    devices = records.len(),
                    "Bound workload devices"
                );
                Ok(())
            }
            Err(e) => {
                warn!(
                    workload = %workload.key(),
                    node = %node,
                    error = %e,
                    "Failed to persist allocation"
                );
                self.unreserve(state);
                Err(e)
            }
        }
    }

    /// Run a full admission: normalize, filter, reserve, persist.
    ///
    /// Candidates are tried in the given order; an empty list means every
    /// known node. A candidate that loses a race between its tentative check
    /// and reserve is skipped in favour of the next feasible one.
    pub async fn admit(
        &self,
        workload: &WorkloadSpec,
        candidates: &[String],
    ) -> DevshareResult<AdmissionOutcome> {
        let mut state = self.begin_attempt(workload)?;
        let candidates = if candidates.is_empty() {
            self.inventory.node_names()
        } else {
            candidates.to_vec()
        };

        if state.skip {
            return Ok(AdmissionOutcome {
                workload_id: state.workload_id,
                attempt_id: state.attempt_id,
                node: None,
                allocation: Allocation::new(),
                phase: state.phase,
                verdicts: Vec::new(),
            });
        }

        // node checks are CPU-bound; keep them off the async workers
        let results = {
            let inventory = self.inventory.clone();
            let allocator = self.allocator.clone();
            let attempt = state.clone();
            let nodes = candidates.clone();
            tokio::task::spawn_blocking(move || {
                check_nodes(&inventory, &allocator, &attempt, &nodes)
            })
            .await
            .map_err(|e| DevshareError::Internal(format!("tentative checks failed: {}", e)))?
        };
        let verdicts: Vec<NodeVerdict> = candidates
            .iter()
            .zip(results.iter())
            .map(|(node, result)| verdict(node, result))
            .collect();

        let mut last_err = None;
        for (node, result) in candidates.iter().zip(results) {
            if let Err(e) = result {
                last_err = Some(prefer(last_err, e));
                continue;
            }
            match self.reserve(&mut state, node) {
                Ok(()) => {
                    self.persist(&mut state, workload).await?;
                    let reservation = state.reservation.clone();
                    return Ok(AdmissionOutcome {
                        workload_id: state.workload_id,
                        attempt_id: state.attempt_id,
                        node: reservation.as_ref().map(|r| r.node.clone()),
                        allocation: reservation.map(|r| r.allocation).unwrap_or_default(),
                        phase: state.phase,
                        verdicts,
                    });
                }
                Err(e) if e.is_node_local() => {
                    debug!(node = %node, error = %e, "Reserve lost a race, trying next node");
                    last_err = Some(prefer(last_err, e));
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or_else(|| DevshareError::MissingDevice("no candidate nodes".to_string())))
    }

    /// Inspection snapshot of one node
    pub fn node_summary(&self, node: &str) -> Option<NodeDeviceSummary> {
        self.inventory.snapshot(node)
    }

    /// Inspection snapshots of every node
    pub fn all_node_summaries(&self) -> BTreeMap<String, NodeDeviceSummary> {
        self.inventory.snapshot_all()
    }
}

fn check_node(
    inventory: &DeviceInventory,
    allocator: &Allocator,
    state: &AttemptState,
    node: &str,
) -> DevshareResult<()> {
    if state.skip {
        return Ok(());
    }
    let device = inventory
        .get(node)
        .ok_or_else(|| DevshareError::MissingDevice(node.to_string()))?;
    device
        .read(|record| allocator.allocate(node, &state.workload_id, &state.request, record))
        .map(|_| ())
}

// Spreads the checks over at most one scoped worker per available core,
// returning results in `nodes` order
fn check_nodes(
    inventory: &DeviceInventory,
    allocator: &Allocator,
    state: &AttemptState,
    nodes: &[String],
) -> Vec<DevshareResult<()>> {
    let workers = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(nodes.len());
    if workers <= 1 {
        return nodes
            .iter()
            .map(|node| check_node(inventory, allocator, state, node))
            .collect();
    }

    let chunk_size = nodes.len().div_ceil(workers);
    std::thread::scope(|scope| {
        let handles: Vec<_> = nodes
            .chunks(chunk_size)
            .map(|chunk| {
                let handle = scope.spawn(move || {
                    chunk
                        .iter()
                        .map(|node| check_node(inventory, allocator, state, node))
                        .collect::<Vec<_>>()
                });
                (chunk.len(), handle)
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|(len, handle)| {
                handle.join().unwrap_or_else(|_| {
                    (0..len)
                        .map(|_| {
                            Err(DevshareError::Internal("tentative check panicked".to_string()))
                        })
                        .collect()
                })
            })
            .collect()
    })
}

fn verdict(node: &str, result: &DevshareResult<()>) -> NodeVerdict {
    NodeVerdict {
        node: node.to_string(),
        feasible: result.is_ok(),
        reason: result.as_ref().err().map(|e| e.to_string()),
    }
}

// Report capacity shortfalls over missing nodes
fn prefer(current: Option<DevshareError>, next: DevshareError) -> DevshareError {
    match current {
        Some(current @ DevshareError::InsufficientDevices { .. }) => current,
        _ => next,
    }
}
