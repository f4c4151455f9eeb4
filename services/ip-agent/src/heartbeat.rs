//! Heartbeat loop for the node liveness record.
//!
//! Each tick fetches this node's record and creates it if missing,
//! otherwise refreshes it. Nothing is retried within a tick; the next
//! tick is the retry mechanism, which bounds record staleness to one
//! missed period plus fetch latency. A record deleted externally is
//! recreated on the next tick without intervention.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::claims::IpNode;
use crate::cluster::NodeRegistry;

/// Run the heartbeat loop until shutdown.
pub async fn run_heartbeat_loop(
    node_name: String,
    period: Duration,
    registry: Arc<dyn NodeRegistry>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        node_name = %node_name,
        period_secs = period.as_secs(),
        "Starting heartbeat loop"
    );

    let mut ticker = tokio::time::interval(period);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                beat_once(registry.as_ref(), &node_name).await;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("Heartbeat loop shutting down");
                    break;
                }
            }
        }
    }
}

/// One heartbeat tick: create the record if absent, refresh otherwise.
async fn beat_once(registry: &dyn NodeRegistry, node_name: &str) {
    match registry.get(node_name).await {
        Ok(None) => {
            let node = IpNode::new(node_name);
            if let Err(e) = registry.create(&node).await {
                error!(node_name = %node_name, error = %e, "Failed to create node record");
            } else {
                debug!(node_name = %node_name, "Created node record");
            }
        }
        Ok(Some(mut node)) => {
            node.touch();
            if let Err(e) = registry.update(&node).await {
                error!(node_name = %node_name, error = %e, "Failed to refresh node record");
            } else {
                debug!(node_name = %node_name, "Refreshed node record");
            }
        }
        Err(e) => {
            error!(node_name = %node_name, error = %e, "Failed to fetch node record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::InMemoryRegistry;

    #[tokio::test]
    async fn test_beat_creates_missing_record() {
        let registry = InMemoryRegistry::new();

        beat_once(&registry, "node-a").await;

        assert!(registry.get("node-a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_beat_refreshes_existing_record() {
        let registry = InMemoryRegistry::new();

        beat_once(&registry, "node-a").await;
        let first = registry.get("node-a").await.unwrap().unwrap();

        beat_once(&registry, "node-a").await;
        let second = registry.get("node-a").await.unwrap().unwrap();

        assert!(second.last_seen >= first.last_seen);
    }

    #[tokio::test]
    async fn test_beat_recreates_after_external_delete() {
        let registry = InMemoryRegistry::new();

        beat_once(&registry, "node-a").await;
        registry.delete("node-a").await.unwrap();
        assert!(registry.get("node-a").await.unwrap().is_none());

        beat_once(&registry, "node-a").await;
        assert!(registry.get("node-a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_loop_stops_on_shutdown() {
        let registry: Arc<dyn NodeRegistry> = Arc::new(InMemoryRegistry::new());
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(run_heartbeat_loop(
            "node-a".to_string(),
            Duration::from_millis(10),
            Arc::clone(&registry),
            rx,
        ));

        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("heartbeat loop did not stop")
            .unwrap();

        assert!(registry.get("node-a").await.unwrap().is_some());
    }
}
