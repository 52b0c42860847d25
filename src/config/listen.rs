//! Network listener configuration.

use serde::Deserialize;
use std::net::SocketAddr;

/// What kind of streams a listener accepts.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ListenerKind {
    /// Client-to-server streams (RFC 6120).
    #[default]
    C2s,
    /// External component streams (XEP-0114).
    Component,
}

/// Policy applied when a second stream binds an already-bound resource.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResourceConflict {
    /// Disconnect the old stream, bind the new one immediately.
    Override,
    /// Refuse the new bind with a `conflict` error.
    Disallow,
    /// Disconnect the old stream and wait for the cluster-level unregister
    /// to propagate before completing the new bind.
    #[default]
    TerminateOld,
}

/// TLS material for a listener.
#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    /// Path to certificate chain file (PEM format).
    pub cert_path: String,
    /// Path to private key file (PEM format).
    pub key_path: String,
}

/// One `[[listener]]` block.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    /// Stream kind accepted here.
    #[serde(default)]
    pub kind: ListenerKind,
    /// Address to bind to (e.g. "0.0.0.0:5222").
    pub address: SocketAddr,
    /// TLS material; enables STARTTLS, and direct TLS when `direct_tls`.
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    /// Wrap the socket in TLS immediately on accept instead of STARTTLS.
    #[serde(default)]
    pub direct_tls: bool,
    /// Resource-conflict policy for binds on this listener (C2S only).
    #[serde(default)]
    pub resource_conflict: ResourceConflict,
    /// Shared secret for the XEP-0114 handshake (component listeners).
    #[serde(default)]
    pub secret: Option<String>,
    /// Enable TCP keep-alive on accepted sockets.
    #[serde(default = "crate::config::defaults::default_true")]
    pub tcp_keep_alive: bool,
}
