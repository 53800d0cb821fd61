//! devshare daemon
//!
//! Serves device admission over HTTP for one cluster scheduler.

use clap::Parser;
use devshare_api::create_router;
use devshare_core::{DaemonConfig, DevshareError, DevshareResult, LoggingConfig};
use devshare_scheduler::{
    policy_for, Allocator, Coordinator, DeviceInventory, InMemoryWorkloadStore, RetryConfig,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// devshare daemon - device admission for GPU, RDMA and FPGA workloads
#[derive(Parser, Debug)]
#[command(name = "devshared")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to bind the API server
    #[arg(long)]
    address: Option<String>,

    /// Port for the REST API server
    #[arg(long)]
    port: Option<u16>,

    /// Log level or filter directive
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    fn load_config(&self) -> DevshareResult<DaemonConfig> {
        let mut config = match &self.config {
            Some(path) => DaemonConfig::from_file(path)?,
            None => DaemonConfig::default(),
        };
        if let Some(address) = &self.address {
            config.api.rest_address = address.clone();
        }
        if let Some(port) = self.port {
            config.api.rest_port = port;
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        Ok(config)
    }
}

fn init_logging(logging: &LoggingConfig) -> DevshareResult<()> {
    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .map_err(|e| DevshareError::Config(format!("Invalid log level: {}", e)))?;

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(logging.with_target)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| DevshareError::Internal(format!("Failed to set subscriber: {}", e)))
}

#[tokio::main]
async fn main() -> DevshareResult<()> {
    let args = Args::parse();
    let config = args.load_config()?;
    init_logging(&config.logging)?;

    info!("Starting devshare daemon v{}", env!("CARGO_PKG_VERSION"));

    // The in-memory store starts empty; assignments arrive as workload events
    let coordinator = Arc::new(Coordinator::new(
        Arc::new(DeviceInventory::new()),
        Allocator::new(policy_for(config.allocator.policy)),
        Arc::new(InMemoryWorkloadStore::new()),
        RetryConfig::from(&config.retry),
    ));

    let router = create_router(coordinator);

    let addr: SocketAddr = format!("{}:{}", config.api.rest_address, config.api.rest_port)
        .parse()
        .map_err(|e| DevshareError::Config(format!("Invalid address: {}", e)))?;

    info!("API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await?;

    Ok(())
}
