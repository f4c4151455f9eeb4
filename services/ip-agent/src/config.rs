//! Configuration for the IP agent.

use anyhow::{Context, Result};

/// IP agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// This node's identity. Claims whose `node_name` matches are
    /// attached here; everything else is ignored or detached.
    pub node_name: String,

    /// Host interface floating addresses are attached to.
    pub iface: String,

    /// Cluster API URL.
    pub cluster_url: String,

    /// Heartbeat interval in seconds. Must stay below the liveness
    /// timeout any scheduler applies to node records.
    pub heartbeat_interval_secs: u64,

    /// Claim poll interval in seconds for the HTTP change feed.
    pub poll_interval_secs: u64,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let node_name = std::env::var("FLOATIP_NODE_NAME")
            .context("FLOATIP_NODE_NAME must be set to this node's identity")?;

        let iface = std::env::var("FLOATIP_IFACE").unwrap_or_else(|_| "eth0".to_string());

        let cluster_url = std::env::var("FLOATIP_CLUSTER_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8080".to_string());

        let heartbeat_interval_secs = std::env::var("FLOATIP_HEARTBEAT_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(2);

        let poll_interval_secs = std::env::var("FLOATIP_POLL_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(2);

        let log_level = std::env::var("FLOATIP_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            node_name,
            iface,
            cluster_url,
            heartbeat_interval_secs,
            poll_interval_secs,
            log_level,
        })
    }
}
