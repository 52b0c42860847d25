//! Configuration loading and management.
//!
//! This module is split into logical submodules:
//! - [`listen`]: listener blocks (C2S and XEP-0114 component, TLS)
//! - [`cluster`]: cluster node identity and KV lease tuning
//! - [`shaper`]: traffic shaper blocks
//! - [`limits`]: timeouts, stanza size caps, SASL mechanism subset

mod cluster;
pub(crate) mod defaults;
mod limits;
mod listen;
mod shaper;

pub use cluster::ClusterConfig;
pub use limits::{CompressionLevel, LimitsConfig, SaslConfig, SaslMechanismName};
pub use listen::{ListenerConfig, ListenerKind, ResourceConflict, TlsConfig};
pub use shaper::ShaperConfig;

use serde::Deserialize;

/// Top-level server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Identity and hosting.
    pub server: ServerConfig,
    /// Listener blocks; at least one C2S listener is expected in practice.
    #[serde(default, rename = "listener")]
    pub listeners: Vec<ListenerConfig>,
    /// Cluster membership; absent means single-node operation.
    #[serde(default)]
    pub cluster: Option<ClusterConfig>,
    /// Shaper blocks, matched first to last.
    #[serde(default, rename = "shaper")]
    pub shapers: Vec<ShaperConfig>,
    /// Timeouts and size caps.
    #[serde(default)]
    pub limits: LimitsConfig,
    /// SASL mechanism subset.
    #[serde(default)]
    pub sasl: SaslConfig,
    /// Repository backend selection.
    #[serde(default)]
    pub storage: StorageConfig,
}

/// `[server]` block.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Domains this node serves (`to` of accepted stream headers).
    pub hosts: Vec<String>,
    /// Fixed instance id; generated from a random UUID when absent.
    #[serde(default)]
    pub instance_id: Option<String>,
    /// Prometheus endpoint port. 0 disables the endpoint (used by tests).
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

/// `[storage]` block.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// `memory` or `sqlite`.
    #[serde(default = "defaults::default_storage_backend")]
    pub backend: String,
    /// Database path for the sqlite backend.
    #[serde(default = "defaults::default_storage_path")]
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: defaults::default_storage_backend(),
            path: defaults::default_storage_path(),
        }
    }
}

impl Config {
    /// Load and validate a TOML configuration file.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate from a TOML string (tests, embedded configs).
    pub fn from_toml(raw: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.server.hosts.is_empty() {
            anyhow::bail!("[server] hosts must name at least one served domain");
        }
        for listener in &self.listeners {
            if listener.kind == ListenerKind::Component && listener.secret.is_none() {
                anyhow::bail!(
                    "component listener on {} requires a secret",
                    listener.address
                );
            }
            if listener.direct_tls && listener.tls.is_none() {
                anyhow::bail!(
                    "listener on {} sets direct_tls without a [listener.tls] block",
                    listener.address
                );
            }
        }
        for shaper in &self.shapers {
            shaper.validate()?;
        }
        Ok(())
    }

    /// True when `domain` is one of the hosts this node serves.
    pub fn is_local_host(&self, domain: &str) -> bool {
        self.server.hosts.iter().any(|h| h == domain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [server]
        hosts = ["ex.org"]

        [[listener]]
        kind = "c2s"
        address = "127.0.0.1:5222"
    "#;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let cfg = Config::from_toml(MINIMAL).unwrap();
        assert!(cfg.is_local_host("ex.org"));
        assert!(!cfg.is_local_host("other.org"));
        assert_eq!(cfg.limits.max_stanza_size, 32 * 1024);
        assert_eq!(
            cfg.listeners[0].resource_conflict,
            ResourceConflict::TerminateOld
        );
        assert!(cfg.cluster.is_none());
        assert_eq!(cfg.storage.backend, "memory");
    }

    #[test]
    fn rejects_component_listener_without_secret() {
        let raw = r#"
            [server]
            hosts = ["ex.org"]

            [[listener]]
            kind = "component"
            address = "127.0.0.1:5275"
        "#;
        assert!(Config::from_toml(raw).is_err());
    }

    #[test]
    fn rejects_empty_hosts() {
        let raw = r#"
            [server]
            hosts = []
        "#;
        assert!(Config::from_toml(raw).is_err());
    }

    #[test]
    fn full_config_parses() {
        let raw = r#"
            [server]
            hosts = ["ex.org", "conference.ex.org"]
            instance_id = "node-a"
            metrics_port = 0

            [[listener]]
            kind = "c2s"
            address = "0.0.0.0:5222"
            resource_conflict = "override"

            [[listener]]
            kind = "component"
            address = "127.0.0.1:5275"
            secret = "hunter2"

            [cluster]
            host = "10.0.0.1"
            port = 14369
            resource_ttl_secs = 30

            [[shaper]]
            name = "admins"
            rate = 4096
            burst = 16384
            jids = ["admin@ex.org"]

            [[shaper]]
            name = "default"
            max_sessions = 10
            rate = 1024
            burst = 4096

            [limits]
            max_stanza_size = 65536
            compression_level = "speed"

            [sasl]
            mechanisms = ["scram_sha_1", "scram_sha_256"]

            [storage]
            backend = "sqlite"
            path = "rxmppd.db"
        "#;
        let cfg = Config::from_toml(raw).unwrap();
        assert_eq!(cfg.listeners.len(), 2);
        assert_eq!(cfg.shapers.len(), 2);
        assert_eq!(cfg.limits.max_stanza_size, 65536);
        assert_eq!(cfg.limits.compression_level, CompressionLevel::Speed);
        assert_eq!(cfg.sasl.mechanisms.len(), 2);
        assert_eq!(cfg.cluster.as_ref().unwrap().port, 14369);
    }
}
