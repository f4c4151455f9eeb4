//! Claim reconciliation controller.
//!
//! One controller runs per cluster node. It observes every claim in
//! the cluster, filters for changes relevant to its own node identity,
//! and converges the host interface to "union of CIDRs from claims
//! owned by this node":
//!
//! - Event dispatch updates the local claim cache, then enqueues the
//!   claim name on the dedup work queue.
//! - A single worker drains the queue and applies the idempotent
//!   ensure-present / ensure-absent action, re-reading the cache per
//!   item so it always acts on the latest observed state.
//! - The heartbeat loop keeps this node's liveness record fresh,
//!   independent of the reconciliation path.
//!
//! Claim processing is strictly sequential per node (one worker), but
//! the cache is updated concurrently by dispatch while the worker is
//! mid-reconciliation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use floatip_workqueue::WorkQueue;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::actuator::{ActuatorError, AddressActuator};
use crate::claims::{ClaimCache, ClaimEvent, IpClaim};
use crate::cluster::{ClaimSource, NodeRegistry};
use crate::config::Config;
use crate::heartbeat::run_heartbeat_loop;

/// Per-node claim controller.
pub struct ClaimController {
    config: Config,
    cache: Arc<ClaimCache>,
    queue: WorkQueue<String>,

    /// Last CIDR seen for each enqueued claim. A deleted claim is gone
    /// from the cache by the time the worker sees its key, so the
    /// detach must use the CIDR captured at enqueue time.
    last_cidrs: Mutex<HashMap<String, String>>,

    source: Arc<dyn ClaimSource>,
    registry: Arc<dyn NodeRegistry>,
    actuator: Arc<dyn AddressActuator>,
}

impl ClaimController {
    /// Create a controller for this node.
    pub fn new(
        config: Config,
        source: Arc<dyn ClaimSource>,
        registry: Arc<dyn NodeRegistry>,
        actuator: Arc<dyn AddressActuator>,
    ) -> Self {
        Self {
            config,
            cache: Arc::new(ClaimCache::new()),
            queue: WorkQueue::new(),
            last_cidrs: Mutex::new(HashMap::new()),
            source,
            registry,
            actuator,
        }
    }

    /// The local claim cache.
    ///
    /// Placement callers score candidates against this same mirror;
    /// the controller is its only writer.
    pub fn cache(&self) -> Arc<ClaimCache> {
        Arc::clone(&self.cache)
    }

    /// Run the controller until the shutdown signal fires.
    ///
    /// Primes the cache from the subscription's baseline snapshot,
    /// then starts event dispatch, the reconcile worker, and the
    /// heartbeat loop. Priming and the feed share one fetch, so a
    /// claim cannot change between them without surfacing as an event.
    /// Returns an error only for startup failures (subscription);
    /// per-item and per-tick errors are retried by their owning loops.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let (claims, events) = self
            .source
            .subscribe()
            .await
            .context("failed to subscribe to claim events")?;
        info!(
            node_name = %self.config.node_name,
            claim_count = claims.len(),
            "Primed claim cache"
        );
        for claim in claims {
            let mine = claim.is_assigned_to(&self.config.node_name);
            self.cache.insert(claim.clone()).await;
            if mine {
                self.track_and_enqueue(&claim);
            }
        }

        let worker = tokio::spawn({
            let controller = Arc::clone(&self);
            async move { controller.worker_loop().await }
        });

        let dispatch = tokio::spawn({
            let controller = Arc::clone(&self);
            let shutdown = shutdown.clone();
            async move { controller.dispatch_loop(events, shutdown).await }
        });

        let heartbeat = tokio::spawn(run_heartbeat_loop(
            self.config.node_name.clone(),
            Duration::from_secs(self.config.heartbeat_interval_secs),
            Arc::clone(&self.registry),
            shutdown.clone(),
        ));

        // Block until the shutdown signal fires, then close the queue
        // so the worker drains and exits.
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }

        info!(node_name = %self.config.node_name, "Shutting down claim controller");
        self.queue.close();

        let _ = worker.await;
        let _ = dispatch.await;
        let _ = heartbeat.await;

        Ok(())
    }

    /// Apply one observed claim change.
    ///
    /// The cache is updated before anything is enqueued, so the worker
    /// never dequeues a key whose cache state predates the event.
    pub async fn handle_event(&self, event: ClaimEvent) {
        match event {
            ClaimEvent::Added(claim) => {
                debug!(claim = %claim.name, node_name = %claim.node_name, "Claim added");
                let mine = claim.is_assigned_to(&self.config.node_name);
                self.cache.insert(claim.clone()).await;
                if mine {
                    self.track_and_enqueue(&claim);
                }
            }
            ClaimEvent::Updated { old, new } => {
                debug!(
                    claim = %new.name,
                    old_node = %old.node_name,
                    new_node = %new.node_name,
                    "Claim updated"
                );
                let was_mine = old.is_assigned_to(&self.config.node_name);
                let is_mine = new.is_assigned_to(&self.config.node_name);
                self.cache.insert(new.clone()).await;
                // Ownership moving between two other nodes is their
                // controllers' business, not ours.
                if !was_mine && !is_mine {
                    return;
                }
                self.track_and_enqueue(&new);
            }
            ClaimEvent::Deleted(claim) => {
                debug!(claim = %claim.name, node_name = %claim.node_name, "Claim deleted");
                self.cache.remove(&claim.name).await;
                if claim.is_assigned_to(&self.config.node_name) {
                    self.track_and_enqueue(&claim);
                }
            }
        }
    }

    /// Record the claim's CIDR, then mark it for reconciliation.
    fn track_and_enqueue(&self, claim: &IpClaim) {
        {
            let mut cidrs = self.last_cidrs.lock().expect("cidr map lock poisoned");
            cidrs.insert(claim.name.clone(), claim.cidr.clone());
        }
        self.queue.add(claim.name.clone());
    }

    async fn dispatch_loop(
        &self,
        mut events: mpsc::Receiver<ClaimEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Some(event) => self.handle_event(event).await,
                        None => {
                            info!("Claim event feed ended");
                            break;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Event dispatch shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Drain the queue until it is closed.
    ///
    /// A failed pass is re-added for a future retry at queue-drain
    /// pace, and the key is marked done regardless so it never sticks
    /// in the processing set.
    async fn worker_loop(&self) {
        while let Some(name) = self.queue.get().await {
            match self.reconcile(&name).await {
                Ok(()) => self.queue.done(&name),
                Err(e) => {
                    warn!(claim = %name, error = %e, "Reconciliation failed, will retry");
                    self.queue.add(name.clone());
                    self.queue.done(&name);
                    // The failed key is already back in the backlog;
                    // give the other loops a turn before retrying.
                    tokio::task::yield_now().await;
                }
            }
        }
        info!("Reconcile worker shutting down");
    }

    /// Converge one claim, reading its current state fresh from the
    /// cache.
    async fn reconcile(&self, name: &str) -> Result<(), ActuatorError> {
        match self.cache.get(name).await {
            // Cache miss means the claim was deleted: detach using the
            // CIDR captured when the key was enqueued.
            None => {
                let cidr = {
                    let cidrs = self.last_cidrs.lock().expect("cidr map lock poisoned");
                    cidrs.get(name).cloned()
                };
                let Some(cidr) = cidr else {
                    warn!(claim = %name, "Deleted claim has no recorded CIDR, skipping");
                    return Ok(());
                };
                self.actuator.remove(&self.config.iface, &cidr).await?;
                self.forget_cidr(name);
                Ok(())
            }
            Some(claim) if claim.is_assigned_to(&self.config.node_name) => {
                self.actuator.add(&self.config.iface, &claim.cidr).await
            }
            // Ownership moved to another node. Once the detach lands
            // this claim's delete is no longer ours to act on, so the
            // recorded CIDR goes too.
            Some(claim) => {
                self.actuator.remove(&self.config.iface, &claim.cidr).await?;
                self.forget_cidr(name);
                Ok(())
            }
        }
    }

    fn forget_cidr(&self, name: &str) {
        let mut cidrs = self.last_cidrs.lock().expect("cidr map lock poisoned");
        cidrs.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::MockActuator;
    use crate::cluster::{ChannelClaimSource, InMemoryRegistry};

    fn config(node_name: &str) -> Config {
        Config {
            node_name: node_name.to_string(),
            iface: "eth0".to_string(),
            cluster_url: "http://localhost:8080".to_string(),
            heartbeat_interval_secs: 1,
            poll_interval_secs: 1,
            log_level: "debug".to_string(),
        }
    }

    fn claim(name: &str, node: &str, cidr: &str) -> IpClaim {
        IpClaim {
            name: name.to_string(),
            node_name: node.to_string(),
            cidr: cidr.to_string(),
        }
    }

    fn new_controller(node_name: &str) -> (ClaimController, Arc<MockActuator>) {
        let (source, _events) = ChannelClaimSource::new(vec![]);
        let actuator = Arc::new(MockActuator::new());
        let controller = ClaimController::new(
            config(node_name),
            Arc::new(source),
            Arc::new(InMemoryRegistry::new()),
            actuator.clone() as Arc<dyn AddressActuator>,
        );
        (controller, actuator)
    }

    /// Pull one key through the worker path by hand.
    async fn drain_one(controller: &ClaimController) {
        let name = controller.queue.get().await.expect("queue closed");
        controller.reconcile(&name).await.expect("reconcile failed");
        controller.queue.done(&name);
    }

    #[tokio::test]
    async fn test_transfer_away_clears_recorded_cidr() {
        let (controller, actuator) = new_controller("node-a");

        let owned = claim("c1", "node-a", "10.0.0.1/32");
        controller
            .handle_event(ClaimEvent::Added(owned.clone()))
            .await;
        drain_one(&controller).await;
        assert_eq!(actuator.addresses("eth0"), vec!["10.0.0.1/32"]);

        controller
            .handle_event(ClaimEvent::Updated {
                old: owned,
                new: claim("c1", "node-b", "10.0.0.1/32"),
            })
            .await;
        drain_one(&controller).await;
        assert!(actuator.addresses("eth0").is_empty());

        // The eventual delete of a moved-away claim is filtered out by
        // ownership, so nothing may stay recorded for it here.
        assert!(controller.last_cidrs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_deleted_claim_clears_recorded_cidr() {
        let (controller, actuator) = new_controller("node-a");

        let owned = claim("c1", "node-a", "10.0.0.1/32");
        controller
            .handle_event(ClaimEvent::Added(owned.clone()))
            .await;
        drain_one(&controller).await;

        controller.handle_event(ClaimEvent::Deleted(owned)).await;
        drain_one(&controller).await;

        assert!(actuator.addresses("eth0").is_empty());
        assert!(controller.last_cidrs.lock().unwrap().is_empty());
    }
}
