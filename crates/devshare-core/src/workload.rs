//! Workload descriptors and device resource names

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::quantity::Quantity;

/// Vendor-neutral whole-card GPU count
pub const RESOURCE_GPU: &str = "devshare.io/gpu";
/// NVIDIA device-plugin whole-card GPU count
pub const RESOURCE_NVIDIA_GPU: &str = "nvidia.com/gpu";
/// GPU compute share, percent of one card
pub const RESOURCE_GPU_CORE: &str = "devshare.io/gpu-core";
/// GPU memory share, percent of one card's memory
pub const RESOURCE_GPU_MEMORY_RATIO: &str = "devshare.io/gpu-memory-ratio";
/// GPU memory in bytes
pub const RESOURCE_GPU_MEMORY: &str = "devshare.io/gpu-memory";
/// RDMA unit count
pub const RESOURCE_RDMA: &str = "devshare.io/rdma";
/// FPGA unit count
pub const RESOURCE_FPGA: &str = "devshare.io/fpga";

/// Resource name to quantity
pub type ResourceList = BTreeMap<String, Quantity>;

/// One container's resource asks
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Container name
    pub name: String,
    /// Requested resources
    #[serde(default)]
    pub requests: ResourceList,
}

impl ContainerSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            requests: ResourceList::new(),
        }
    }

    /// Builder-style request
    pub fn request(mut self, resource: &str, quantity: Quantity) -> Self {
        self.requests.insert(resource.to_string(), quantity);
        self
    }
}

/// Workload being admitted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadSpec {
    /// Unique identifier, generated when absent
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    /// Namespace
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Name
    pub name: String,
    /// Application containers
    #[serde(default)]
    pub containers: Vec<ContainerSpec>,
    /// Init containers, run one at a time before the application containers
    #[serde(default)]
    pub init_containers: Vec<ContainerSpec>,
}

fn default_namespace() -> String {
    "default".to_string()
}

impl WorkloadSpec {
    /// Create a workload with a fresh id and no containers
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            namespace: namespace.into(),
            name: name.into(),
            containers: Vec::new(),
            init_containers: Vec::new(),
        }
    }

    pub fn with_container(mut self, container: ContainerSpec) -> Self {
        self.containers.push(container);
        self
    }

    pub fn with_init_container(mut self, container: ContainerSpec) -> Self {
        self.init_containers.push(container);
        self
    }

    /// `namespace/name`
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Effective request: containers summed, then raised to any larger init
    /// container ask
    pub fn effective_requests(&self) -> ResourceList {
        let mut total = ResourceList::new();
        for container in &self.containers {
            for (name, quantity) in &container.requests {
                let entry = total.entry(name.clone()).or_insert(Quantity::ZERO);
                *entry = entry.saturating_add(*quantity);
            }
        }
        for container in &self.init_containers {
            for (name, quantity) in &container.requests {
                let entry = total.entry(name.clone()).or_insert(Quantity::ZERO);
                if *quantity > *entry {
                    *entry = *quantity;
                }
            }
        }
        total
    }
}
