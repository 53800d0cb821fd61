//! devshare-scheduler: Device admission for devshare
//!
//! This crate decides which device units a workload gets on a node:
//! - Resource normalization of vendor-specific device asks
//! - Per-node device inventory and usage accounting
//! - Unit selection and reservation
//! - The admission lifecycle with bounded persistence retries

pub mod allocator;
pub mod coordinator;
pub mod inventory;
pub mod normalizer;
pub mod persist;
pub mod policy;
pub mod retry;

pub use allocator::{Allocator, Reserved};
pub use coordinator::{
    AdmissionOutcome, AttemptPhase, AttemptState, Coordinator, NodeVerdict, Reservation,
};
pub use inventory::{DeviceInventory, NodeDevice, NodeDeviceRecord};
pub use normalizer::{normalize, GpuCombination, Normalized, Normalizer};
pub use persist::{AllocationPersister, InMemoryWorkloadStore, StoredAssignment};
pub use policy::{policy_for, BestFitPolicy, FirstFitPolicy, SelectionPolicy};
pub use retry::{retry_on_conflict, RetryConfig, RetryPolicy};
