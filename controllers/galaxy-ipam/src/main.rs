//! Galaxy IPAM
//!
//! Floating IP allocator for Kubernetes pods:
//! - Scheduler extender (filter, prioritize, bind) allocating addresses from MySQL tables
//! - Release policies applied when pods or workloads go away
//! - Admin API for listing and releasing addresses and managing pools
//! - Leader election so only one replica allocates at a time
//! - Optional GC of CNI state leaked on the node

mod api;
mod backoff;
mod cloudprovider;
mod cluster;
mod config;
mod controller;
mod error;
mod extender;
mod locks;
mod metrics;
mod plugin;
mod pool;
mod server;
mod watcher;

use std::env;
use std::path::PathBuf;

use controller::Controller;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::error::ControllerError;

/// Default location of the configuration file
const DEFAULT_CONFIG: &str = "/etc/galaxy/galaxy-ipam.json";

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    // Initialize rustls crypto provider (required for rustls 0.23+)
    // Use ring as the default provider
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| ControllerError::InvalidConfig("Failed to install rustls crypto provider".to_string()))?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting galaxy-ipam");

    // Load configuration from environment variables
    let config_path = PathBuf::from(env::var("GALAXY_IPAM_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG.to_string()));
    let namespace = env::var("POD_NAMESPACE").unwrap_or_else(|_| "kube-system".to_string());
    let config = Config::load(&config_path)?;

    info!("Configuration:");
    info!("  Config file: {}", config_path.display());
    info!("  Namespace: {}", namespace);
    info!(
        "  Database: {} at {} as {}",
        config.schedule_plugin.database.name,
        config.schedule_plugin.database.addr,
        config.schedule_plugin.database.username
    );
    info!(
        "  Pools: {} primary, {} second",
        config.schedule_plugin.floatingips.len(),
        config.schedule_plugin.second_floatingips.len()
    );
    info!("  Resource: {}", config.schedule_plugin.resource_name);
    info!("  Extender: {}:{}", config.server.bind, config.server.port);
    info!("  Admin API: {}:{}", config.server.bind, config.server.api_port);
    info!("  Leader election: {}", config.election.enabled);
    info!("  GC: {}", if config.gc.is_some() { "enabled" } else { "disabled" });

    // Initialize and run controller
    let controller = Controller::new(config, namespace).await?;
    controller.run().await?;

    Ok(())
}
