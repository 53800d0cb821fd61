//! devshare CLI
//!
//! Command-line interface for inspecting and driving the devshare daemon.

mod commands;

use clap::{Parser, Subcommand};
use devshare_core::DeviceType;
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;
use uuid::Uuid;

/// devshare - device admission for GPU, RDMA and FPGA workloads
#[derive(Parser, Debug)]
#[command(name = "devshare")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Daemon API address
    #[arg(long, default_value = "http://localhost:9190", global = true)]
    api: String,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show daemon status
    Status,

    /// List device usage on every node
    Nodes,

    /// Show units and allocations on one node
    Node {
        /// Node name
        name: String,
    },

    /// Report a device unit's capacity on a node
    Device {
        /// Node name
        node: String,

        /// Device type (gpu, rdma, fpga)
        device_type: DeviceType,

        /// Minor number
        minor: u32,

        /// Capacity (100 per GPU card, 1 per RDMA/FPGA unit)
        total: u64,

        /// Mark the unit unhealthy
        #[arg(long)]
        unhealthy: bool,
    },

    /// Admit a workload described in a JSON file
    Admit {
        /// Workload file
        #[arg(short, long)]
        file: PathBuf,

        /// Candidate node, in preference order (repeatable; default all)
        #[arg(long = "node")]
        nodes: Vec<String>,
    },

    /// Release a workload's devices on a node
    Release {
        /// Workload ID
        workload_id: Uuid,

        /// Node name
        node: String,
    },

    /// Forget a node
    RemoveNode {
        /// Node name
        name: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::WARN
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    let client = commands::ApiClient::new(&cli.api);

    match cli.command {
        Commands::Status => {
            commands::status(&client).await?;
        }
        Commands::Nodes => {
            commands::nodes(&client).await?;
        }
        Commands::Node { name } => {
            commands::node(&client, &name).await?;
        }
        Commands::Device {
            node,
            device_type,
            minor,
            total,
            unhealthy,
        } => {
            commands::device(&client, node, device_type, minor, total, !unhealthy).await?;
        }
        Commands::Admit { file, nodes } => {
            commands::admit(&client, &file, nodes).await?;
        }
        Commands::Release { workload_id, node } => {
            commands::release(&client, workload_id, node).await?;
        }
        Commands::RemoveNode { name } => {
            commands::remove_node(&client, &name).await?;
        }
    }

    Ok(())
}
