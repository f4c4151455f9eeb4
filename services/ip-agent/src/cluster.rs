//! Cluster state capabilities consumed by the agent.
//!
//! Two seams: the claim event source the controller observes, and the
//! node registry the heartbeat loop writes liveness records through.
//! The HTTP client in [`crate::client`] implements both against the
//! cluster API; the in-memory implementations here back tests and dev
//! bootstrap.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

use crate::claims::{ClaimEvent, IpClaim, IpNode};

/// Errors from cluster state operations.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Transport-level failure (connection, status, decode).
    #[error("cluster transport error: {0}")]
    Transport(String),

    /// The event feed has already been handed out or has ended.
    #[error("event subscription unavailable: {0}")]
    Subscription(String),
}

impl From<reqwest::Error> for ClusterError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Feed of claim records and their changes.
///
/// Events for a given claim arrive in commit order; ordering across
/// claims is not guaranteed.
#[async_trait]
pub trait ClaimSource: Send + Sync {
    /// Open the change feed, returning the claim set it diffs against
    /// as the baseline snapshot.
    ///
    /// Consumers must prime their state from that snapshot rather than
    /// from a separate fetch: the feed reports only changes relative
    /// to the baseline, so any other fetch leaves a window where a
    /// claim changes without ever surfacing as an event. Fails fatally
    /// if the feed cannot be established; the controller treats that
    /// as a construction error.
    async fn subscribe(
        &self,
    ) -> Result<(Vec<IpClaim>, mpsc::Receiver<ClaimEvent>), ClusterError>;
}

/// Store for per-node liveness records.
#[async_trait]
pub trait NodeRegistry: Send + Sync {
    /// Fetch a node record; `None` means not found.
    async fn get(&self, name: &str) -> Result<Option<IpNode>, ClusterError>;

    /// Create a record that does not exist yet.
    async fn create(&self, node: &IpNode) -> Result<(), ClusterError>;

    /// Overwrite an existing record.
    async fn update(&self, node: &IpNode) -> Result<(), ClusterError>;
}

/// Channel-backed claim source for tests and development.
///
/// Holds an initial claim set and a receiver the test side feeds
/// through the paired [`mpsc::Sender`].
pub struct ChannelClaimSource {
    initial: Vec<IpClaim>,
    events: Mutex<Option<mpsc::Receiver<ClaimEvent>>>,
}

impl ChannelClaimSource {
    /// Create a source primed with `initial`, returning the sender
    /// used to emit subsequent events.
    pub fn new(initial: Vec<IpClaim>) -> (Self, mpsc::Sender<ClaimEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let source = Self {
            initial,
            events: Mutex::new(Some(rx)),
        };
        (source, tx)
    }
}

#[async_trait]
impl ClaimSource for ChannelClaimSource {
    async fn subscribe(
        &self,
    ) -> Result<(Vec<IpClaim>, mpsc::Receiver<ClaimEvent>), ClusterError> {
        let mut events = self.events.lock().await;
        let rx = events
            .take()
            .ok_or_else(|| ClusterError::Subscription("feed already subscribed".into()))?;
        Ok((self.initial.clone(), rx))
    }
}

/// In-memory node registry for tests and development.
#[derive(Default)]
pub struct InMemoryRegistry {
    nodes: Mutex<HashMap<String, IpNode>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delete a record out from under the agent, simulating an
    /// external reaper.
    pub async fn delete(&self, name: &str) -> Option<IpNode> {
        let mut nodes = self.nodes.lock().await;
        nodes.remove(name)
    }
}

#[async_trait]
impl NodeRegistry for InMemoryRegistry {
    async fn get(&self, name: &str) -> Result<Option<IpNode>, ClusterError> {
        let nodes = self.nodes.lock().await;
        Ok(nodes.get(name).cloned())
    }

    async fn create(&self, node: &IpNode) -> Result<(), ClusterError> {
        let mut nodes = self.nodes.lock().await;
        if nodes.contains_key(&node.name) {
            return Err(ClusterError::Transport(format!(
                "node {} already exists",
                node.name
            )));
        }
        nodes.insert(node.name.clone(), node.clone());
        Ok(())
    }

    async fn update(&self, node: &IpNode) -> Result<(), ClusterError> {
        let mut nodes = self.nodes.lock().await;
        if !nodes.contains_key(&node.name) {
            return Err(ClusterError::Transport(format!(
                "node {} does not exist",
                node.name
            )));
        }
        nodes.insert(node.name.clone(), node.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_source_returns_baseline_and_subscribes_once() {
        let (source, tx) = ChannelClaimSource::new(vec![IpClaim {
            name: "c0".to_string(),
            node_name: "node-a".to_string(),
            cidr: "10.0.0.9/32".to_string(),
        }]);

        let (baseline, mut rx) = source.subscribe().await.unwrap();
        assert_eq!(baseline.len(), 1);
        assert_eq!(baseline[0].name, "c0");
        assert!(source.subscribe().await.is_err());

        tx.send(ClaimEvent::Added(IpClaim {
            name: "c1".to_string(),
            node_name: "node-a".to_string(),
            cidr: "10.0.0.1/32".to_string(),
        }))
        .await
        .unwrap();

        match rx.recv().await {
            Some(ClaimEvent::Added(claim)) => assert_eq!(claim.name, "c1"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_in_memory_registry_lifecycle() {
        let registry = InMemoryRegistry::new();
        let node = IpNode::new("node-a");

        assert!(registry.get("node-a").await.unwrap().is_none());

        registry.create(&node).await.unwrap();
        assert!(registry.create(&node).await.is_err());
        assert!(registry.get("node-a").await.unwrap().is_some());

        let mut refreshed = node.clone();
        refreshed.touch();
        registry.update(&refreshed).await.unwrap();

        registry.delete("node-a").await.unwrap();
        assert!(registry.update(&node).await.is_err());
    }
}
