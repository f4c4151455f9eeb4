//! Claim and node records plus the local claim cache.
//!
//! The cache mirrors the claim set last observed from the cluster. It
//! is written only by the controller's event dispatch task and read by
//! the reconcile worker, which must see a cache miss for a deleted
//! claim before the corresponding queue item is processed.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// A claim binding a floating address to an owning node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpClaim {
    /// Cluster-unique claim name.
    pub name: String,

    /// Owning node identity. Empty means unassigned.
    #[serde(default)]
    pub node_name: String,

    /// Address and prefix, e.g. `10.0.0.7/32`.
    pub cidr: String,
}

impl IpClaim {
    /// True if this claim is owned by the given node.
    pub fn is_assigned_to(&self, node_name: &str) -> bool {
        self.node_name == node_name
    }
}

/// Per-node liveness record.
///
/// Created and refreshed only by the heartbeat loop of the node it
/// names; other agents never write it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpNode {
    /// Node identity, matching the agent's configured name.
    pub name: String,

    /// Last heartbeat timestamp.
    pub last_seen: DateTime<Utc>,
}

impl IpNode {
    /// Create a fresh record for a node.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            last_seen: Utc::now(),
        }
    }

    /// Refresh the liveness timestamp.
    pub fn touch(&mut self) {
        self.last_seen = Utc::now();
    }
}

/// A change observed on the cluster claim set.
#[derive(Debug, Clone)]
pub enum ClaimEvent {
    /// A claim appeared.
    Added(IpClaim),

    /// A claim changed; both sides are needed to detect ownership
    /// moving onto or away from this node.
    Updated { old: IpClaim, new: IpClaim },

    /// A claim disappeared.
    Deleted(IpClaim),
}

/// Read-through mirror of the observed claim set, keyed by claim name.
///
/// Keyed explicitly by the stable name rather than by record equality,
/// so two distinct-but-equal snapshots of the same claim can never
/// produce duplicate entries.
#[derive(Default)]
pub struct ClaimCache {
    claims: RwLock<HashMap<String, IpClaim>>,
}

impl ClaimCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a claim.
    pub async fn insert(&self, claim: IpClaim) {
        let mut claims = self.claims.write().await;
        claims.insert(claim.name.clone(), claim);
    }

    /// Drop a claim, returning the evicted record if it was present.
    pub async fn remove(&self, name: &str) -> Option<IpClaim> {
        let mut claims = self.claims.write().await;
        claims.remove(name)
    }

    /// Fetch the current state of a claim.
    pub async fn get(&self, name: &str) -> Option<IpClaim> {
        let claims = self.claims.read().await;
        claims.get(name).cloned()
    }

    /// Number of known claims.
    pub async fn len(&self) -> usize {
        let claims = self.claims.read().await;
        claims.len()
    }

    /// True if no claims are known.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Owning node name of every known claim, one entry per claim.
    ///
    /// This is the load snapshot placement policies score candidates
    /// against; unassigned claims appear as empty strings and carry no
    /// weight there.
    pub async fn assigned_nodes(&self) -> Vec<String> {
        let claims = self.claims.read().await;
        claims.values().map(|c| c.node_name.clone()).collect()
    }
}
