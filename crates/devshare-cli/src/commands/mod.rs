//! CLI commands implementation

use anyhow::{Context, Result};
use devshare_core::{
    Allocation, DeviceType, DeviceTypeSummary, InventoryChange, InventoryEvent,
    NodeDeviceSummary, WorkloadEvent, WorkloadSpec,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

/// API client for communicating with the daemon
pub struct ApiClient {
    base_url: String,
    client: reqwest::Client,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Status response
#[derive(Debug, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub nodes: usize,
    pub allocations: usize,
}

/// Per-node verdict in an admission response
#[derive(Debug, Deserialize)]
pub struct VerdictResponse {
    pub node: String,
    pub feasible: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Admission response
#[derive(Debug, Deserialize)]
pub struct AdmissionResponse {
    pub workload_id: Uuid,
    pub attempt_id: Uuid,
    pub node: Option<String>,
    pub allocation: Allocation,
    pub phase: String,
    pub verdicts: Vec<VerdictResponse>,
}

/// Show daemon status
pub async fn status(client: &ApiClient) -> Result<()> {
    let response = client
        .client
        .get(client.url("/api/v1/status"))
        .send()
        .await?;

    if response.status().is_success() {
        let status: StatusResponse = response.json().await?;

        println!("devshare v{}", status.version);
        println!();
        println!("Nodes: {}", status.nodes);
        println!("Allocations: {}", status.allocations);
    } else {
        let error = response.text().await?;
        eprintln!("Failed to get status: {}", error);
    }

    Ok(())
}

fn type_row(node: &str, device_type: DeviceType, summary: &DeviceTypeSummary) -> String {
    format!(
        "{:<24} {:<6} {:>8} {:>8} {:>8} {:>9}",
        node,
        device_type,
        summary.total,
        summary.used,
        summary.free,
        summary.unhealthy_units
    )
}

/// List device usage on every node
pub async fn nodes(client: &ApiClient) -> Result<()> {
    let response = client
        .client
        .get(client.url("/api/v1/nodes"))
        .send()
        .await?;

    if response.status().is_success() {
        let nodes: Vec<NodeDeviceSummary> = response.json().await?;

        if nodes.is_empty() {
            println!("No nodes found");
        } else {
            println!(
                "{:<24} {:<6} {:>8} {:>8} {:>8} {:>9}",
                "NODE", "TYPE", "TOTAL", "USED", "FREE", "UNHEALTHY"
            );
            println!("{}", "-".repeat(68));
            for node in nodes {
                for (device_type, summary) in &node.totals {
                    println!("{}", type_row(&node.node, *device_type, summary));
                }
            }
        }
    } else {
        let error = response.text().await?;
        eprintln!("Failed to list nodes: {}", error);
    }

    Ok(())
}

/// Show units and allocations on one node
pub async fn node(client: &ApiClient, name: &str) -> Result<()> {
    let response = client
        .client
        .get(client.url(&format!("/api/v1/nodes/{}", name)))
        .send()
        .await?;

    if response.status().is_success() {
        let summary: NodeDeviceSummary = response.json().await?;

        println!("Node: {}", summary.node);
        for (device_type, units) in &summary.units {
            println!("\n{}:", device_type);
            for unit in units {
                println!(
                    "  [{}] {}/{} used{}",
                    unit.minor,
                    unit.used,
                    unit.total,
                    if unit.healthy { "" } else { " (unhealthy)" }
                );
            }
        }

        if !summary.allocations.is_empty() {
            println!("\nAllocations:");
            for (workload_id, allocation) in &summary.allocations {
                let items: Vec<String> = allocation
                    .iter()
                    .flat_map(|(device_type, items)| {
                        items
                            .iter()
                            .map(move |i| format!("{}:{}={}", device_type, i.minor, i.amount))
                    })
                    .collect();
                println!("  {} {}", workload_id, items.join(" "));
            }
        }
    } else {
        let error = response.text().await?;
        eprintln!("Node not found: {}", error);
    }

    Ok(())
}

/// Report a device unit's capacity
pub async fn device(
    client: &ApiClient,
    node: String,
    device_type: DeviceType,
    minor: u32,
    total: u64,
    healthy: bool,
) -> Result<()> {
    let event = InventoryEvent {
        node: node.clone(),
        device_type,
        change: InventoryChange::Capacity {
            minor,
            total,
            healthy,
        },
    };

    let response = client
        .client
        .post(client.url("/api/v1/events/inventory"))
        .json(&event)
        .send()
        .await?;

    if response.status().is_success() {
        println!("{} {} on node '{}' set to {}", device_type, minor, node, total);
    } else {
        let error = response.text().await?;
        eprintln!("Failed to update device: {}", error);
    }

    Ok(())
}

/// Admit a workload described in a JSON file
pub async fn admit(client: &ApiClient, file: &Path, nodes: Vec<String>) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let workload: WorkloadSpec = serde_json::from_str(&content)
        .with_context(|| format!("Invalid workload in {}", file.display()))?;

    #[derive(Serialize)]
    struct AdmitRequest {
        workload: WorkloadSpec,
        nodes: Vec<String>,
    }

    let key = workload.key();
    let response = client
        .client
        .post(client.url("/api/v1/admissions"))
        .json(&AdmitRequest { workload, nodes })
        .send()
        .await?;

    if response.status().is_success() {
        let outcome: AdmissionResponse = response.json().await?;
        match &outcome.node {
            Some(node) => println!("Workload '{}' admitted on node '{}'", key, node),
            None => println!("Workload '{}' admitted (no devices requested)", key),
        }
        println!("  ID: {}", outcome.workload_id);
        println!("  Attempt: {}", outcome.attempt_id);
        println!("  Phase: {}", outcome.phase);
        for record in outcome.allocation.to_records() {
            println!(
                "  {} {}: {}",
                record.device_type, record.minor, record.amount
            );
        }
        for verdict in outcome.verdicts.iter().filter(|v| !v.feasible) {
            println!(
                "  skipped {}: {}",
                verdict.node,
                verdict.reason.as_deref().unwrap_or("infeasible")
            );
        }
    } else {
        let error = response.text().await?;
        eprintln!("Failed to admit workload: {}", error);
    }

    Ok(())
}

/// Release a workload's devices on a node
pub async fn release(client: &ApiClient, workload_id: Uuid, node: String) -> Result<()> {
    let event = WorkloadEvent::Deleted {
        workload_id,
        node: node.clone(),
    };

    let response = client
        .client
        .post(client.url("/api/v1/events/workloads"))
        .json(&event)
        .send()
        .await?;

    if response.status().is_success() {
        println!("Released devices of {} on node '{}'", workload_id, node);
    } else {
        let error = response.text().await?;
        eprintln!("Failed to release devices: {}", error);
    }

    Ok(())
}

/// Forget a node
pub async fn remove_node(client: &ApiClient, name: &str) -> Result<()> {
    let response = client
        .client
        .delete(client.url(&format!("/api/v1/nodes/{}", name)))
        .send()
        .await?;

    if response.status().is_success() {
        println!("Node '{}' removed", name);
    } else {
        let error = response.text().await?;
        eprintln!("Failed to remove node: {}", error);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_trims_trailing_slash() {
        let client = ApiClient::new("http://localhost:9190/");
        assert_eq!(client.url("/api/v1/nodes"), "http://localhost:9190/api/v1/nodes");
    }

    #[test]
    fn test_type_row() {
        let summary = DeviceTypeSummary {
            total: 200,
            used: 50,
            free: 150,
            healthy_units: 2,
            unhealthy_units: 0,
        };
        let row = type_row("n1", DeviceType::Gpu, &summary);
        assert!(row.starts_with("n1"));
        assert!(row.contains("gpu"));
        assert!(row.contains("150"));
    }

    #[test]
    fn test_admission_response_parse() {
        let json = r#"{
            "workload_id": "6f1c1f52-7f38-4f4a-9f55-111111111111",
            "attempt_id": "6f1c1f52-7f38-4f4a-9f55-222222222222",
            "node": "n1",
            "allocation": {"devices": {"gpu": [{"minor": 0, "amount": 50}]}},
            "phase": "bound",
            "verdicts": [{"node": "n1", "feasible": true}]
        }"#;
        let outcome: AdmissionResponse = serde_json::from_str(json).unwrap();
        assert_eq!(outcome.node.as_deref(), Some("n1"));
        assert_eq!(outcome.allocation.total(DeviceType::Gpu), 50);
        assert!(outcome.verdicts[0].reason.is_none());
    }
}
