//! Traffic shaper blocks.

use crate::config::defaults;
use serde::Deserialize;

/// One `[[shaper]]` block. Blocks are matched in file order; the first
/// whose matcher accepts the binding JID wins.
#[derive(Debug, Clone, Deserialize)]
pub struct ShaperConfig {
    /// Shaper name, used in logs and metrics.
    pub name: String,
    /// Concurrent session cap for JIDs matched by this shaper. 0 = no cap.
    #[serde(default = "defaults::default_max_sessions")]
    pub max_sessions: usize,
    /// Sustained read rate, bytes per second.
    pub rate: u32,
    /// Burst allowance, bytes.
    pub burst: u32,
    /// Exact bare JIDs this shaper applies to. Non-empty wins over `regex`.
    #[serde(default)]
    pub jids: Vec<String>,
    /// Regular expression over the bare JID. Absent with empty `jids`
    /// means the shaper matches everyone.
    #[serde(default)]
    pub regex: Option<String>,
}

impl ShaperConfig {
    /// Reject unusable blocks up front.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.rate == 0 {
            anyhow::bail!("shaper {}: rate must be positive", self.name);
        }
        if self.burst == 0 {
            anyhow::bail!("shaper {}: burst must be positive", self.name);
        }
        if let Some(pattern) = &self.regex {
            regex::Regex::new(pattern)
                .map_err(|e| anyhow::anyhow!("shaper {}: bad regex: {e}", self.name))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_regex_and_rates() {
        let ok: ShaperConfig = toml::from_str(
            "name = \"normal\"\nrate = 1024\nburst = 4096\nregex = \".*@ex\\\\.org\"",
        )
        .unwrap();
        assert!(ok.validate().is_ok());

        let bad_regex: ShaperConfig =
            toml::from_str("name = \"x\"\nrate = 1024\nburst = 4096\nregex = \"(\"").unwrap();
        assert!(bad_regex.validate().is_err());

        let zero_rate: ShaperConfig =
            toml::from_str("name = \"x\"\nrate = 0\nburst = 4096").unwrap();
        assert!(zero_rate.validate().is_err());
    }
}
