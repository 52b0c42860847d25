//! Timeouts, size caps and negotiation knobs.

use crate::config::defaults;
use serde::Deserialize;
use std::time::Duration;

/// Stream compression preference. Parsed and validated; compression is not
/// currently negotiated on the wire.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CompressionLevel {
    /// Library default ratio.
    #[default]
    Default,
    /// Best ratio.
    Best,
    /// Fastest.
    Speed,
    /// Disabled.
    NoCompression,
}

/// `[limits]` block.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Stanza byte cap on C2S and component streams.
    #[serde(default = "defaults::default_max_stanza_size")]
    pub max_stanza_size: usize,
    /// Stanza byte cap applied to stanzas arriving from peer servers.
    #[serde(default = "defaults::default_s2s_max_stanza_size")]
    pub s2s_max_stanza_size: usize,
    /// Seconds allowed from accept to the first stream header.
    #[serde(default = "defaults::default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Seconds allowed for the whole SASL negotiation.
    #[serde(default = "defaults::default_auth_timeout")]
    pub auth_timeout_secs: u64,
    /// Seconds of read idleness before the stream is timed out.
    #[serde(default = "defaults::default_keep_alive_timeout")]
    pub keep_alive_timeout_secs: u64,
    /// Deadline for stanza-forwarding operations (RPC, KV).
    #[serde(default = "defaults::default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Drain budget for graceful stream shutdown.
    #[serde(default = "defaults::default_disconnect_timeout")]
    pub disconnect_timeout_secs: u64,
    /// Compression preference.
    #[serde(default)]
    pub compression_level: CompressionLevel,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_stanza_size: defaults::default_max_stanza_size(),
            s2s_max_stanza_size: defaults::default_s2s_max_stanza_size(),
            connect_timeout_secs: defaults::default_connect_timeout(),
            auth_timeout_secs: defaults::default_auth_timeout(),
            keep_alive_timeout_secs: defaults::default_keep_alive_timeout(),
            request_timeout_secs: defaults::default_request_timeout(),
            disconnect_timeout_secs: defaults::default_disconnect_timeout(),
            compression_level: CompressionLevel::default(),
        }
    }
}

impl LimitsConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }

    pub fn keep_alive_timeout(&self) -> Duration {
        Duration::from_secs(self.keep_alive_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_secs(self.disconnect_timeout_secs)
    }
}

/// The SCRAM mechanism families a listener may offer.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Hash)]
pub enum SaslMechanismName {
    #[serde(rename = "scram_sha_1")]
    ScramSha1,
    #[serde(rename = "scram_sha_256")]
    ScramSha256,
    #[serde(rename = "scram_sha_512")]
    ScramSha512,
    #[serde(rename = "scram_sha3_512")]
    ScramSha3_512,
}

impl SaslMechanismName {
    /// The IANA mechanism name sent in stream features.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ScramSha1 => "SCRAM-SHA-1",
            Self::ScramSha256 => "SCRAM-SHA-256",
            Self::ScramSha512 => "SCRAM-SHA-512",
            Self::ScramSha3_512 => "SCRAM-SHA3-512",
        }
    }
}

/// `[sasl]` block.
#[derive(Debug, Clone, Deserialize)]
pub struct SaslConfig {
    /// Offered mechanisms, strongest first in features advertisement.
    #[serde(default = "default_mechanisms")]
    pub mechanisms: Vec<SaslMechanismName>,
}

fn default_mechanisms() -> Vec<SaslMechanismName> {
    vec![
        SaslMechanismName::ScramSha256,
        SaslMechanismName::ScramSha1,
    ]
}

impl Default for SaslConfig {
    fn default() -> Self {
        Self {
            mechanisms: default_mechanisms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_requirements() {
        let limits = LimitsConfig::default();
        assert_eq!(limits.max_stanza_size, 32 * 1024);
        assert_eq!(limits.s2s_max_stanza_size, 131 * 1024);
        assert_eq!(limits.keep_alive_timeout(), Duration::from_secs(120));
    }

    #[test]
    fn mechanism_names_parse_spec_spelling() {
        let m: SaslMechanismName = serde_json::from_str("\"scram_sha3_512\"").unwrap();
        assert_eq!(m, SaslMechanismName::ScramSha3_512);
        assert_eq!(m.as_str(), "SCRAM-SHA3-512");
    }

    #[test]
    fn default_sasl_offers_scram() {
        let sasl = SaslConfig::default();
        assert!(sasl.mechanisms.contains(&SaslMechanismName::ScramSha256));
    }

    #[test]
    fn compression_level_parses() {
        let c: CompressionLevel = serde_json::from_str("\"no_compression\"").unwrap();
        assert_eq!(c, CompressionLevel::NoCompression);
    }
}
