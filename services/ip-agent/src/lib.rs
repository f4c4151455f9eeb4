//! floatip IP Agent Library
//!
//! The IP agent runs on each cluster node and keeps the host's
//! interface configuration consistent with the cluster's floating IP
//! claims. Each agent is the sole authority for its own node identity
//! but observes every claim, so it can detach addresses it used to own
//! and attach addresses newly assigned to it.
//!
//! ## Architecture
//!
//! - **Controller**: filters claim events for this node, enqueues them
//!   on a dedup work queue, and drains the queue with a single worker
//!   that applies idempotent attach/detach actions.
//! - **Heartbeat Loop**: refreshes this node's liveness record on a
//!   fixed period.
//! - **Actuator**: the interface add/remove capability (Linux `ip` in
//!   prod, mock in tests).
//! - **Cluster Client**: claim feed and node registry over the
//!   cluster's REST API.

pub mod actuator;
pub mod claims;
pub mod client;
pub mod cluster;
pub mod config;
pub mod controller;
pub mod heartbeat;

// Re-export commonly used types
pub use actuator::{AddressActuator, LinuxAddressActuator, MockActuator};
pub use claims::{ClaimCache, ClaimEvent, IpClaim, IpNode};
pub use cluster::{ChannelClaimSource, ClaimSource, InMemoryRegistry, NodeRegistry};
pub use controller::ClaimController;
