//! Traffic shaping: session admission and read-path rate limiting.
//!
//! A shaper is selected at bind time: the first configured block whose
//! matcher accepts the binding JID wins. Admission enforces the block's
//! concurrent-session cap; the returned handle carries a token bucket that
//! the transport awaits on its read path, so a saturated bucket
//! backpressures the socket instead of dropping stanzas.

use crate::config::ShaperConfig;
use dashmap::DashMap;
use governor::{Quota, RateLimiter};
use rxmpp_proto::Jid;
use std::collections::HashSet;
use std::num::NonZeroU32;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

type DirectRateLimiter = governor::DefaultDirectRateLimiter;

/// Admission failure: the matched shaper is at its session cap.
#[derive(Debug, Error)]
#[error("shaper {shaper} is at its session cap ({max_sessions})")]
pub struct MaxSessionsReached {
    pub shaper: String,
    pub max_sessions: usize,
}

enum Matcher {
    Set(HashSet<String>),
    Regex(regex::Regex),
    Always,
}

impl Matcher {
    fn accepts(&self, jid: &Jid) -> bool {
        let bare = jid.to_bare().to_string();
        match self {
            Self::Set(jids) => jids.contains(&bare),
            Self::Regex(re) => re.is_match(&bare),
            Self::Always => true,
        }
    }
}

struct Shaper {
    name: String,
    max_sessions: usize,
    rate: NonZeroU32,
    burst: NonZeroU32,
    matcher: Matcher,
}

/// Registry of configured shapers plus live session accounting.
pub struct Shapers {
    shapers: Vec<Shaper>,
    sessions: Arc<DashMap<String, usize>>,
}

impl Shapers {
    /// Build from validated configuration blocks, preserving file order.
    pub fn from_config(blocks: &[ShaperConfig]) -> anyhow::Result<Self> {
        let mut shapers = Vec::with_capacity(blocks.len());
        for block in blocks {
            block.validate()?;
            let matcher = if !block.jids.is_empty() {
                Matcher::Set(block.jids.iter().cloned().collect())
            } else if let Some(pattern) = &block.regex {
                Matcher::Regex(regex::Regex::new(pattern)?)
            } else {
                Matcher::Always
            };
            shapers.push(Shaper {
                name: block.name.clone(),
                max_sessions: block.max_sessions,
                rate: NonZeroU32::new(block.rate).expect("validated"),
                burst: NonZeroU32::new(block.burst).expect("validated"),
                matcher,
            });
        }
        Ok(Self {
            shapers,
            sessions: Arc::new(DashMap::new()),
        })
    }

    /// Admit a binding JID: selects the matching shaper, checks its session
    /// cap, and returns the stream's shaping handle. A JID matched by no
    /// shaper gets an unshaped handle.
    pub fn admit(&self, jid: &Jid) -> Result<StreamShaper, MaxSessionsReached> {
        let Some(shaper) = self.shapers.iter().find(|s| s.matcher.accepts(jid)) else {
            return Ok(StreamShaper::unshaped());
        };

        if shaper.max_sessions > 0 {
            let mut count = self.sessions.entry(shaper.name.clone()).or_insert(0);
            if *count >= shaper.max_sessions {
                if let Some(c) = crate::metrics::RATE_LIMITED.get() {
                    c.inc();
                }
                return Err(MaxSessionsReached {
                    shaper: shaper.name.clone(),
                    max_sessions: shaper.max_sessions,
                });
            }
            *count += 1;
        }
        debug!(jid = %jid, shaper = %shaper.name, "session admitted");

        let quota = Quota::per_second(shaper.rate).allow_burst(shaper.burst);
        Ok(StreamShaper {
            name: shaper.name.clone(),
            burst: shaper.burst,
            limiter: Some(Arc::new(RateLimiter::direct(quota))),
            lease: Some(SessionLease {
                name: shaper.name.clone(),
                counted: shaper.max_sessions > 0,
                sessions: Arc::clone(&self.sessions),
            }),
        })
    }

    /// Live sessions currently counted against `shaper`.
    pub fn session_count(&self, shaper: &str) -> usize {
        self.sessions.get(shaper).map(|c| *c).unwrap_or(0)
    }
}

#[derive(Debug)]
struct SessionLease {
    name: String,
    counted: bool,
    sessions: Arc<DashMap<String, usize>>,
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if self.counted {
            if let Some(mut count) = self.sessions.get_mut(&self.name) {
                *count = count.saturating_sub(1);
            }
        }
    }
}

/// Per-stream shaping handle, held by the transport.
#[derive(Debug)]
pub struct StreamShaper {
    name: String,
    burst: NonZeroU32,
    limiter: Option<Arc<DirectRateLimiter>>,
    lease: Option<SessionLease>,
}

impl StreamShaper {
    /// A handle that never throttles (pre-bind streams, unmatched JIDs).
    pub fn unshaped() -> Self {
        Self {
            name: "none".to_string(),
            burst: NonZeroU32::new(u32::MAX).expect("nonzero"),
            limiter: None,
            lease: None,
        }
    }

    /// The matched shaper's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Account `bytes` of inbound traffic, waiting until the bucket allows
    /// them. Waiting here suspends the read loop, which is exactly the
    /// backpressure the socket needs.
    pub async fn throttle(&self, bytes: usize) {
        let Some(limiter) = &self.limiter else {
            return;
        };
        let mut remaining = bytes as u64;
        while remaining > 0 {
            let chunk = remaining.min(self.burst.get() as u64) as u32;
            let cells = NonZeroU32::new(chunk).expect("chunk is positive");
            if limiter.until_n_ready(cells).await.is_err() {
                // Burst smaller than a single cell request cannot happen
                // since chunks are capped at the burst size.
                break;
            }
            remaining -= chunk as u64;
        }
    }

    /// Drop only the rate limiter, keeping the session lease. Used when a
    /// stream is re-admitted during terminate_old waits.
    pub fn is_shaped(&self) -> bool {
        self.limiter.is_some()
    }
}

impl Drop for StreamShaper {
    fn drop(&mut self) {
        self.lease.take();
    }
}
