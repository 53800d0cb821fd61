//! Resource normalization
//!
//! Converts a workload's vendor-specific device asks into one
//! [`NormalizedRequest`]. Every device type is handled by an entry in
//! [`RULES`]: a validator that decides which request shape the workload
//! uses, and a converter that turns that shape into a single quantity.
//! Supporting a new device type means adding a table entry.

use devshare_core::{
    DeviceType, DevshareError, DevshareResult, NormalizedRequest, Quantity, ResourceList,
    WorkloadSpec, RESOURCE_FPGA, RESOURCE_GPU, RESOURCE_GPU_CORE, RESOURCE_GPU_MEMORY,
    RESOURCE_GPU_MEMORY_RATIO, RESOURCE_NVIDIA_GPU, RESOURCE_RDMA,
};
use tracing::debug;

/// Percent-of-card quantity of one whole GPU
pub const GPU_CARD: u64 = 100;

/// Result of normalizing a workload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Normalized {
    /// Quantity per requested device type
    pub request: NormalizedRequest,
    /// No recognized device resource was asked for
    pub skip: bool,
}

/// Ways a workload may express a GPU ask
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuCombination {
    /// `devshare.io/gpu`
    WholeCard,
    /// `nvidia.com/gpu`
    NvidiaWholeCard,
    /// `gpu-core` + `gpu-memory-ratio`
    CoreAndMemoryRatio,
    /// `gpu-core` + `gpu-memory`
    CoreAndMemory,
}

const FLAG_NVIDIA: u8 = 1 << 0;
const FLAG_WHOLE: u8 = 1 << 1;
const FLAG_CORE: u8 = 1 << 2;
const FLAG_MEMORY: u8 = 1 << 3;
const FLAG_MEMORY_RATIO: u8 = 1 << 4;

impl GpuCombination {
    fn from_flags(flags: u8) -> Option<Self> {
        match flags {
            FLAG_WHOLE => Some(GpuCombination::WholeCard),
            FLAG_NVIDIA => Some(GpuCombination::NvidiaWholeCard),
            f if f == FLAG_CORE | FLAG_MEMORY_RATIO => Some(GpuCombination::CoreAndMemoryRatio),
            f if f == FLAG_CORE | FLAG_MEMORY => Some(GpuCombination::CoreAndMemory),
            _ => None,
        }
    }
}

/// Request shape chosen by a validator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestShape {
    Gpu(GpuCombination),
    Units,
}

/// Validator and converter registered for one device type
struct DeviceRule {
    device_type: DeviceType,
    resources: &'static [&'static str],
    validate: fn(&WorkloadSpec, &'static [&'static str]) -> DevshareResult<RequestShape>,
    convert: fn(&ResourceList, &'static [&'static str], RequestShape) -> DevshareResult<u64>,
}

const GPU_RESOURCES: &[&str] = &[
    RESOURCE_NVIDIA_GPU,
    RESOURCE_GPU,
    RESOURCE_GPU_CORE,
    RESOURCE_GPU_MEMORY,
    RESOURCE_GPU_MEMORY_RATIO,
];

const GPU_FLAGS: [(&str, u8); 5] = [
    (RESOURCE_NVIDIA_GPU, FLAG_NVIDIA),
    (RESOURCE_GPU, FLAG_WHOLE),
    (RESOURCE_GPU_CORE, FLAG_CORE),
    (RESOURCE_GPU_MEMORY, FLAG_MEMORY),
    (RESOURCE_GPU_MEMORY_RATIO, FLAG_MEMORY_RATIO),
];

const RULES: &[DeviceRule] = &[
    DeviceRule {
        device_type: DeviceType::Gpu,
        resources: GPU_RESOURCES,
        validate: validate_gpu,
        convert: convert_gpu,
    },
    DeviceRule {
        device_type: DeviceType::Rdma,
        resources: &[RESOURCE_RDMA],
        validate: validate_units,
        convert: convert_units,
    },
    DeviceRule {
        device_type: DeviceType::Fpga,
        resources: &[RESOURCE_FPGA],
        validate: validate_units,
        convert: convert_units,
    },
];

/// Stateless normalizer over the registered device rules
#[derive(Debug, Clone, Copy, Default)]
pub struct Normalizer;

impl Normalizer {
    pub fn new() -> Self {
        Self
    }

    /// Normalize a workload's device asks
    ///
    /// Deterministic: equal workloads always produce equal results.
    pub fn normalize(&self, workload: &WorkloadSpec) -> DevshareResult<Normalized> {
        normalize(workload)
    }
}

/// Normalize a workload's device asks. See [`Normalizer::normalize`].
pub fn normalize(workload: &WorkloadSpec) -> DevshareResult<Normalized> {
    let effective = workload.effective_requests();
    let mut request = NormalizedRequest::new();
    let mut skip = true;

    for rule in RULES {
        // raw per-container asks, so negative values cannot cancel out
        if !all_containers(workload).any(|c| asks_any(&c.requests, rule.resources)) {
            continue;
        }
        let shape = (rule.validate)(workload, rule.resources)?;
        let quantity = (rule.convert)(&effective, rule.resources, shape)?;
        request = request.with(rule.device_type, quantity);
        skip = false;
    }

    debug!(
        workload = %workload.key(),
        skip = skip,
        request = ?request,
        "Normalized device request"
    );

    Ok(Normalized { request, skip })
}

fn asks(list: &ResourceList, resource: &str) -> bool {
    list.get(resource).map_or(false, |q| !q.is_zero())
}

fn asks_any(list: &ResourceList, resources: &[&str]) -> bool {
    resources.iter().any(|r| asks(list, r))
}

fn all_containers(workload: &WorkloadSpec) -> impl Iterator<Item = &devshare_core::ContainerSpec> {
    workload
        .containers
        .iter()
        .chain(workload.init_containers.iter())
}

/// Non-negative whole-unit value of a resource; absent counts as zero
fn whole_units(list: &ResourceList, resource: &str) -> DevshareResult<u64> {
    let quantity = list.get(resource).copied().unwrap_or(Quantity::ZERO);
    if quantity.is_negative() || !quantity.is_integer() {
        return Err(DevshareError::InvalidDeviceQuantity(format!(
            "{} must be a non-negative integer, got {}",
            resource, quantity
        )));
    }
    Ok(quantity.value() as u64)
}

fn validate_gpu(
    workload: &WorkloadSpec,
    resources: &'static [&'static str],
) -> DevshareResult<RequestShape> {
    let mut chosen: Option<GpuCombination> = None;

    for container in all_containers(workload) {
        let mut flags = 0u8;
        for (resource, flag) in GPU_FLAGS {
            if asks(&container.requests, resource) {
                flags |= flag;
            }
        }
        if flags == 0 {
            continue;
        }

        let combination = GpuCombination::from_flags(flags).ok_or_else(|| {
            DevshareError::InvalidGpuCombination(format!(
                "container {} of {} mixes GPU resources (flags {:#07b})",
                container.name,
                workload.key(),
                flags
            ))
        })?;

        for resource in resources {
            whole_units(&container.requests, resource)?;
        }

        match chosen {
            None => chosen = Some(combination),
            Some(previous) if previous == combination => {}
            Some(previous) => {
                return Err(DevshareError::InvalidGpuCombination(format!(
                    "container {} of {} uses {:?} but another container uses {:?}",
                    container.name,
                    workload.key(),
                    combination,
                    previous
                )));
            }
        }
    }

    chosen.map(RequestShape::Gpu).ok_or_else(|| {
        DevshareError::Internal(format!("no GPU combination found for {}", workload.key()))
    })
}

fn convert_gpu(
    list: &ResourceList,
    _resources: &'static [&'static str],
    shape: RequestShape,
) -> DevshareResult<u64> {
    let RequestShape::Gpu(combination) = shape else {
        return Err(DevshareError::Internal(format!(
            "GPU converter called with {:?}",
            shape
        )));
    };

    let percent = match combination {
        GpuCombination::WholeCard => whole_units(list, RESOURCE_GPU)?.saturating_mul(GPU_CARD),
        GpuCombination::NvidiaWholeCard => {
            whole_units(list, RESOURCE_NVIDIA_GPU)?.saturating_mul(GPU_CARD)
        }
        GpuCombination::CoreAndMemoryRatio => whole_units(list, RESOURCE_GPU_CORE)?
            .max(whole_units(list, RESOURCE_GPU_MEMORY_RATIO)?),
        GpuCombination::CoreAndMemory => {
            whole_units(list, RESOURCE_GPU_MEMORY)?;
            whole_units(list, RESOURCE_GPU_CORE)?
        }
    };

    if percent > GPU_CARD && percent % GPU_CARD != 0 {
        return Err(DevshareError::InvalidDeviceQuantity(format!(
            "GPU ask of {} percent spans cards but is not a whole number of cards",
            percent
        )));
    }
    Ok(percent)
}

fn validate_units(
    workload: &WorkloadSpec,
    resources: &'static [&'static str],
) -> DevshareResult<RequestShape> {
    for container in all_containers(workload) {
        for resource in resources {
            whole_units(&container.requests, resource)?;
        }
    }
    Ok(RequestShape::Units)
}

fn convert_units(
    list: &ResourceList,
    resources: &'static [&'static str],
    shape: RequestShape,
) -> DevshareResult<u64> {
    if shape != RequestShape::Units {
        return Err(DevshareError::Internal(format!(
            "unit converter called with {:?}",
            shape
        )));
    }
    resources.iter().try_fold(0u64, |total, resource| {
        Ok(total.saturating_add(whole_units(list, resource)?))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use devshare_core::ContainerSpec;

    fn q(units: i64) -> Quantity {
        Quantity::from_units(units)
    }

    fn workload(containers: Vec<ContainerSpec>) -> WorkloadSpec {
        let mut w = WorkloadSpec::new("default", "test");
        w.containers = containers;
        w
    }

    #[test]
    fn test_no_device_ask_skips() {
        let w = workload(vec![ContainerSpec::new("main").request("cpu", q(2))]);
        let normalized = normalize(&w).unwrap();
        assert!(normalized.skip);
        assert!(normalized.request.is_empty());
    }

    #[test]
    fn test_core_and_memory_ratio() {
        let w = workload(vec![ContainerSpec::new("main")
            .request(RESOURCE_GPU_CORE, q(50))
            .request(RESOURCE_GPU_MEMORY_RATIO, q(50))]);
        let normalized = normalize(&w).unwrap();
        assert!(!normalized.skip);
        assert_eq!(normalized.request, NormalizedRequest::new().with(DeviceType::Gpu, 50));
    }

    #[test]
    fn test_core_and_memory_ratio_takes_larger_share() {
        let w = workload(vec![ContainerSpec::new("main")
            .request(RESOURCE_GPU_CORE, q(30))
            .request(RESOURCE_GPU_MEMORY_RATIO, q(60))]);
        assert_eq!(normalize(&w).unwrap().request.get(DeviceType::Gpu), 60);
    }

    #[test]
    fn test_core_and_absolute_memory() {
        let w = workload(vec![ContainerSpec::new("main")
            .request(RESOURCE_GPU_CORE, q(25))
            .request(RESOURCE_GPU_MEMORY, "8Gi".parse().unwrap())]);
        assert_eq!(normalize(&w).unwrap().request.get(DeviceType::Gpu), 25);
    }

    #[test]
    fn test_whole_cards() {
        let w = workload(vec![
            ContainerSpec::new("a").request(RESOURCE_GPU, q(1)),
            ContainerSpec::new("b").request(RESOURCE_GPU, q(2)),
        ]);
        assert_eq!(normalize(&w).unwrap().request.get(DeviceType::Gpu), 300);

        let w = workload(vec![ContainerSpec::new("a").request(RESOURCE_NVIDIA_GPU, q(2))]);
        assert_eq!(normalize(&w).unwrap().request.get(DeviceType::Gpu), 200);
    }

    #[test]
    fn test_mixed_combinations_across_containers_rejected() {
        let w = workload(vec![
            ContainerSpec::new("a").request(RESOURCE_GPU, q(1)),
            ContainerSpec::new("b").request(RESOURCE_GPU_CORE, q(50)),
        ]);
        let err = normalize(&w).unwrap_err();
        assert!(matches!(err, DevshareError::InvalidGpuCombination(_)));
    }

    #[test]
    fn test_whole_card_vendor_aliases_do_not_mix() {
        let w = workload(vec![
            ContainerSpec::new("a").request(RESOURCE_GPU, q(1)),
            ContainerSpec::new("b").request(RESOURCE_NVIDIA_GPU, q(1)),
        ]);
        assert!(matches!(
            normalize(&w).unwrap_err(),
            DevshareError::InvalidGpuCombination(_)
        ));
    }

    #[test]
    fn test_incomplete_combination_in_one_container_rejected() {
        let w = workload(vec![ContainerSpec::new("a").request(RESOURCE_GPU_CORE, q(50))]);
        assert!(matches!(
            normalize(&w).unwrap_err(),
            DevshareError::InvalidGpuCombination(_)
        ));

        let w = workload(vec![ContainerSpec::new("a")
            .request(RESOURCE_GPU_CORE, q(50))
            .request(RESOURCE_GPU_MEMORY, q(1024))
            .request(RESOURCE_GPU_MEMORY_RATIO, q(50))]);
        assert!(matches!(
            normalize(&w).unwrap_err(),
            DevshareError::InvalidGpuCombination(_)
        ));
    }

    #[test]
    fn test_partial_multi_card_rejected() {
        let w = workload(vec![ContainerSpec::new("a")
            .request(RESOURCE_GPU_CORE, q(150))
            .request(RESOURCE_GPU_MEMORY_RATIO, q(150))]);
        assert!(matches!(
            normalize(&w).unwrap_err(),
            DevshareError::InvalidDeviceQuantity(_)
        ));
    }

    #[test]
    fn test_unit_devices() {
        let w = workload(vec![
            ContainerSpec::new("a")
                .request(RESOURCE_RDMA, q(1))
                .request(RESOURCE_FPGA, q(2)),
            ContainerSpec::new("b").request(RESOURCE_RDMA, q(1)),
        ]);
        let normalized = normalize(&w).unwrap();
        assert_eq!(
            normalized.request,
            NormalizedRequest::new()
                .with(DeviceType::Rdma, 2)
                .with(DeviceType::Fpga, 2)
        );
    }

    #[test]
    fn test_fractional_or_negative_units_rejected() {
        let w = workload(vec![ContainerSpec::new("a").request(RESOURCE_RDMA, "500m".parse().unwrap())]);
        assert!(matches!(
            normalize(&w).unwrap_err(),
            DevshareError::InvalidDeviceQuantity(_)
        ));

        let w = workload(vec![ContainerSpec::new("a").request(RESOURCE_FPGA, q(-1))]);
        assert!(matches!(
            normalize(&w).unwrap_err(),
            DevshareError::InvalidDeviceQuantity(_)
        ));
    }

    #[test]
    fn test_negative_asks_cannot_cancel_out() {
        let w = workload(vec![
            ContainerSpec::new("a").request(RESOURCE_RDMA, q(-1)),
            ContainerSpec::new("b").request(RESOURCE_RDMA, q(1)),
        ]);
        assert!(matches!(
            normalize(&w).unwrap_err(),
            DevshareError::InvalidDeviceQuantity(_)
        ));

        let w = workload(vec![ContainerSpec::new("a").request(RESOURCE_FPGA, q(2))])
            .with_init_container(ContainerSpec::new("init").request(RESOURCE_FPGA, q(-3)));
        assert!(matches!(
            normalize(&w).unwrap_err(),
            DevshareError::InvalidDeviceQuantity(_)
        ));

        let w = workload(vec![ContainerSpec::new("a")])
            .with_init_container(ContainerSpec::new("init").request(RESOURCE_RDMA, q(-1)));
        assert!(normalize(&w).is_err());
    }

    #[test]
    fn test_multi_card_rule_applies_to_whole_workload() {
        let share = |name: &str| {
            ContainerSpec::new(name)
                .request(RESOURCE_GPU_CORE, q(60))
                .request(RESOURCE_GPU_MEMORY_RATIO, q(60))
        };
        let w = workload(vec![share("a"), share("b")]);
        assert!(matches!(
            normalize(&w).unwrap_err(),
            DevshareError::InvalidDeviceQuantity(_)
        ));

        let half = |name: &str| {
            ContainerSpec::new(name)
                .request(RESOURCE_GPU_CORE, q(50))
                .request(RESOURCE_GPU_MEMORY_RATIO, q(50))
        };
        let w = workload(vec![half("a"), half("b"), half("c"), half("d")]);
        assert_eq!(normalize(&w).unwrap().request.get(DeviceType::Gpu), 200);
    }

    #[test]
    fn test_halves_across_containers_still_rejected() {
        let w = workload(vec![
            ContainerSpec::new("a").request(RESOURCE_RDMA, "0.5".parse().unwrap()),
            ContainerSpec::new("b").request(RESOURCE_RDMA, "0.5".parse().unwrap()),
        ]);
        assert!(normalize(&w).is_err());
    }

    #[test]
    fn test_mixed_device_types_aggregate() {
        let w = workload(vec![ContainerSpec::new("a")
            .request(RESOURCE_GPU, q(1))
            .request(RESOURCE_RDMA, q(1))]);
        let normalized = normalize(&w).unwrap();
        assert_eq!(normalized.request.get(DeviceType::Gpu), 100);
        assert_eq!(normalized.request.get(DeviceType::Rdma), 1);
        assert_eq!(normalized.request.get(DeviceType::Fpga), 0);
    }

    #[test]
    fn test_normalization_is_deterministic() {
        let w = workload(vec![
            ContainerSpec::new("a")
                .request(RESOURCE_GPU_CORE, q(20))
                .request(RESOURCE_GPU_MEMORY_RATIO, q(40)),
            ContainerSpec::new("b").request(RESOURCE_FPGA, q(1)),
        ]);
        let first = Normalizer::new().normalize(&w).unwrap();
        for _ in 0..10 {
            assert_eq!(Normalizer::new().normalize(&w.clone()).unwrap(), first);
        }
    }
}
