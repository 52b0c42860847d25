//! Default value functions for configuration.

/// Returns `true` (for serde defaults).
pub fn default_true() -> bool {
    true
}

pub fn default_storage_backend() -> String {
    "memory".to_string()
}

pub fn default_storage_path() -> String {
    "rxmppd.db".to_string()
}

// =============================================================================
// Size and timeout defaults
// =============================================================================

/// 32 KiB, the C2S stanza cap.
pub fn default_max_stanza_size() -> usize {
    32 * 1024
}

/// 131 KiB, the server-to-server stanza cap.
pub fn default_s2s_max_stanza_size() -> usize {
    131 * 1024
}

pub fn default_connect_timeout() -> u64 {
    5
}

pub fn default_auth_timeout() -> u64 {
    60
}

pub fn default_keep_alive_timeout() -> u64 {
    120
}

pub fn default_request_timeout() -> u64 {
    15
}

pub fn default_disconnect_timeout() -> u64 {
    5
}

// =============================================================================
// Cluster defaults
// =============================================================================

pub fn default_cluster_port() -> u16 {
    14369
}

/// Lease TTL for resource descriptors and member records, seconds.
pub fn default_resource_ttl() -> u64 {
    30
}

// =============================================================================
// Shaper defaults
// =============================================================================

/// 0 means no session cap.
pub fn default_max_sessions() -> usize {
    0
}
