//! Cluster node configuration.

use crate::config::defaults;
use serde::Deserialize;

/// `[cluster]` block. Presence of the block enables clustering.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    /// Address other nodes reach this node's RPC listener at.
    pub host: String,
    /// RPC listener port.
    #[serde(default = "defaults::default_cluster_port")]
    pub port: u16,
    /// Lease TTL for member records and resource descriptors, seconds.
    /// Refresh runs at a third of this.
    #[serde(default = "defaults::default_resource_ttl")]
    pub resource_ttl_secs: u64,
}

impl ClusterConfig {
    /// Lease TTL as a duration.
    pub fn resource_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.resource_ttl_secs)
    }

    /// Lease refresh interval (`TTL / 3`).
    pub fn refresh_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs((self.resource_ttl_secs / 3).max(1))
    }
}
