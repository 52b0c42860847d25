//! Telemetry utilities for route timing and stream correlation.

use std::time::Instant;

/// Guard for timing a routing operation.
///
/// Records route latency for its destination kind when dropped.
pub struct RouteTimer {
    kind: &'static str,
    start: Instant,
}

impl RouteTimer {
    /// Start timing a route toward the given destination kind.
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            start: Instant::now(),
        }
    }
}

impl Drop for RouteTimer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        crate::metrics::record_route_latency(self.kind, duration);
    }
}

/// Standardized span constructors for stream observability.
pub mod spans {
    use tracing::{Span, info_span};

    /// Create a span for a client stream.
    pub fn stream(stream_id: &str, addr: &str) -> Span {
        info_span!("stream", id = %stream_id, addr = %addr)
    }

    /// Create a span for a cluster peer link.
    pub fn peer(instance_id: &str) -> Span {
        info_span!("peer", instance_id = %instance_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_records_on_drop() {
        crate::metrics::init();
        {
            let _t = RouteTimer::new("local");
        }
        let out = crate::metrics::gather_metrics();
        assert!(out.contains("xmpp_route_duration_seconds"));
    }
}
