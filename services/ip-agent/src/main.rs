//! floatip IP Agent
//!
//! Runs on every cluster node. Observes the cluster's floating IP
//! claims and converges the host interface to hold exactly the
//! addresses assigned to this node, while heartbeating this node's
//! liveness record so schedulers keep assigning claims here.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use floatip_ip_agent::actuator::LinuxAddressActuator;
use floatip_ip_agent::client::ClusterClient;
use floatip_ip_agent::cluster::{ClaimSource, NodeRegistry};
use floatip_ip_agent::config::Config;
use floatip_ip_agent::controller::ClaimController;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting floatip IP agent");

    // Load configuration
    let config = Config::from_env()?;
    info!(
        node_name = %config.node_name,
        iface = %config.iface,
        cluster_url = %config.cluster_url,
        heartbeat_interval_secs = config.heartbeat_interval_secs,
        "Configuration loaded"
    );

    // One client serves both the claim feed and the node registry.
    let client = Arc::new(ClusterClient::new(&config)?);
    let actuator = Arc::new(LinuxAddressActuator::new());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let source: Arc<dyn ClaimSource> = client.clone();
    let registry: Arc<dyn NodeRegistry> = client;

    let controller = Arc::new(ClaimController::new(config, source, registry, actuator));

    let mut controller_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move { controller.run(shutdown_rx).await }
    });

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut controller_handle => {
            match result {
                Ok(Ok(())) => info!("Controller exited normally"),
                Ok(Err(e)) => {
                    error!(error = %e, "Controller failed");
                    return Err(e);
                }
                Err(e) => error!(error = %e, "Controller task panicked"),
            }
            return Ok(());
        }
    }

    // Signal shutdown to all loops
    let _ = shutdown_tx.send(true);

    // Give the worker time to finish an in-flight actuator call
    info!("Waiting for workers to shut down...");
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;

    info!("IP agent shutdown complete");
    Ok(())
}
