//! Cluster API client.
//!
//! Reference implementation of both cluster seams over the REST API:
//! claims are listed from `/v1/claims`, node liveness records live at
//! `/v1/nodes/{name}`. The change feed is a poll loop that lists the
//! claim set on an interval and diffs it against the previous
//! snapshot, synthesizing added/updated/deleted events in commit
//! order per claim. The first snapshot is the baseline claim set
//! `subscribe` hands back to the caller.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::claims::{ClaimEvent, IpClaim, IpNode};
use crate::cluster::{ClaimSource, ClusterError, NodeRegistry};
use crate::config::Config;

/// HTTP client for the cluster API.
pub struct ClusterClient {
    client: reqwest::Client,
    base_url: String,
    poll_interval: Duration,
}

impl ClusterClient {
    /// Create a new cluster client.
    pub fn new(config: &Config) -> Result<Self, ClusterError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ClusterError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.cluster_url.clone(),
            poll_interval: Duration::from_secs(config.poll_interval_secs),
        })
    }

    async fn fetch_claims(&self) -> Result<Vec<IpClaim>, ClusterError> {
        let url = format!("{}/v1/claims", self.base_url);
        debug!(url = %url, "Listing claims");

        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(ClusterError::Transport(format!(
                "list claims returned {}",
                response.status()
            )));
        }

        let claims: Vec<IpClaim> = response.json().await?;
        debug!(claim_count = claims.len(), "Listed claims");
        Ok(claims)
    }
}

#[async_trait]
impl ClaimSource for ClusterClient {
    async fn subscribe(
        &self,
    ) -> Result<(Vec<IpClaim>, mpsc::Receiver<ClaimEvent>), ClusterError> {
        // One fetch serves as connectivity check, returned baseline,
        // and the snapshot the poll loop diffs against. The caller
        // primes from the same claim set the feed considers "already
        // seen", so nothing can slip between priming and the first
        // event.
        let baseline = self.fetch_claims().await?;

        let (tx, rx) = mpsc::channel(64);
        let client = self.client.clone();
        let url = format!("{}/v1/claims", self.base_url);
        let poll_interval = self.poll_interval;

        let mut snapshot: HashMap<String, IpClaim> = baseline
            .iter()
            .map(|claim| (claim.name.clone(), claim.clone()))
            .collect();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);

            loop {
                ticker.tick().await;

                let claims = match list_once(&client, &url).await {
                    Ok(claims) => claims,
                    Err(e) => {
                        warn!(error = %e, "Claim poll failed, will retry next interval");
                        continue;
                    }
                };

                for event in diff_snapshots(&mut snapshot, claims) {
                    if tx.send(event).await.is_err() {
                        debug!("Claim event receiver dropped, stopping poll loop");
                        return;
                    }
                }
            }
        });

        Ok((baseline, rx))
    }
}

async fn list_once(client: &reqwest::Client, url: &str) -> Result<Vec<IpClaim>, ClusterError> {
    let response = client.get(url).send().await?;
    if !response.status().is_success() {
        return Err(ClusterError::Transport(format!(
            "list claims returned {}",
            response.status()
        )));
    }
    Ok(response.json().await?)
}

/// Diff a fresh claim list against the previous snapshot, updating the
/// snapshot in place and returning the events in between.
fn diff_snapshots(
    snapshot: &mut HashMap<String, IpClaim>,
    current: Vec<IpClaim>,
) -> Vec<ClaimEvent> {
    let mut events = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();

    for claim in &current {
        seen.insert(claim.name.as_str());
        match snapshot.get(&claim.name) {
            None => events.push(ClaimEvent::Added(claim.clone())),
            Some(old) if old != claim => events.push(ClaimEvent::Updated {
                old: old.clone(),
                new: claim.clone(),
            }),
            Some(_) => {}
        }
    }

    let deleted: Vec<String> = snapshot
        .keys()
        .filter(|name| !seen.contains(name.as_str()))
        .cloned()
        .collect();
    for name in deleted {
        if let Some(old) = snapshot.remove(&name) {
            events.push(ClaimEvent::Deleted(old));
        }
    }

    for claim in current {
        snapshot.insert(claim.name.clone(), claim);
    }

    events
}

#[async_trait]
impl NodeRegistry for ClusterClient {
    async fn get(&self, name: &str) -> Result<Option<IpNode>, ClusterError> {
        let url = format!("{}/v1/nodes/{}", self.base_url, name);

        let response = self.client.get(&url).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.json().await?)),
            status => Err(ClusterError::Transport(format!(
                "get node returned {status}"
            ))),
        }
    }

    async fn create(&self, node: &IpNode) -> Result<(), ClusterError> {
        let url = format!("{}/v1/nodes", self.base_url);

        let response = self.client.post(&url).json(node).send().await?;
        if !response.status().is_success() {
            return Err(ClusterError::Transport(format!(
                "create node returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn update(&self, node: &IpNode) -> Result<(), ClusterError> {
        let url = format!("{}/v1/nodes/{}", self.base_url, node.name);

        let response = self.client.put(&url).json(node).send().await?;
        if !response.status().is_success() {
            return Err(ClusterError::Transport(format!(
                "update node returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}
