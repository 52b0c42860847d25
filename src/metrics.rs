//! Prometheus metrics collection for rxmppd.
//!
//! Tracks stream population, stanza throughput per kind and direction,
//! cluster RPC health, and routing latency. Exposed over an HTTP endpoint
//! for Prometheus scraping (see [`crate::http`]).

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

pub fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

// ========================================================================
// Counters (monotonic increasing)
// ========================================================================

/// Stanzas accepted into the router, labeled by stanza kind.
pub static INCOMING_REQUESTS: OnceLock<IntCounterVec> = OnceLock::new();

/// Stanzas written to streams, labeled by stanza kind.
pub static OUTGOING_STANZAS: OnceLock<IntCounterVec> = OnceLock::new();

/// Routing failures by error code.
pub static ROUTE_ERRORS: OnceLock<IntCounterVec> = OnceLock::new();

/// Stanzas consumed by interceptors (blocklist and friends).
pub static STANZAS_INTERCEPTED: OnceLock<IntCounterVec> = OnceLock::new();

/// Messages handed to the offline hook.
pub static OFFLINE_MESSAGES: OnceLock<IntCounter> = OnceLock::new();

/// Sessions rejected or throttled by a shaper.
pub static RATE_LIMITED: OnceLock<IntCounter> = OnceLock::new();

/// Cluster RPCs by method and status.
pub static CLUSTER_RPC: OnceLock<IntCounterVec> = OnceLock::new();

// ========================================================================
// Gauges (can increase/decrease)
// ========================================================================

/// Currently connected C2S streams.
pub static CONNECTED_STREAMS: OnceLock<IntGauge> = OnceLock::new();

/// Currently attached external component streams.
pub static CONNECTED_COMPONENTS: OnceLock<IntGauge> = OnceLock::new();

/// Usable cluster peer connections.
pub static CLUSTER_PEERS_CONNECTED: OnceLock<IntGauge> = OnceLock::new();

/// Resources this node has registered in the cluster map.
pub static LOCAL_RESOURCES: OnceLock<IntGauge> = OnceLock::new();

// ========================================================================
// Histograms
// ========================================================================

/// Route latency by destination kind (local, cluster, component, s2s).
pub static ROUTE_LATENCY: OnceLock<HistogramVec> = OnceLock::new();

/// Initialize the Prometheus metrics registry.
///
/// Must be called once at server startup before any metrics are recorded.
pub fn init() {
    let r = registry();

    // Helper macro to register metric
    macro_rules! register {
        ($metric:ident, $init:expr) => {
            let m = $init.expect(concat!(stringify!($metric), " creation failed"));
            if let Err(e) = r.register(Box::new(m.clone())) {
                tracing::warn!(error = %e, concat!("Failed to register metric ", stringify!($metric)));
            }
            let _ = $metric.set(m);
        };
    }

    register!(INCOMING_REQUESTS, IntCounterVec::new(Opts::new("xmpp_incoming_requests_total", "Stanzas accepted into the router"), &["type"]));
    register!(OUTGOING_STANZAS, IntCounterVec::new(Opts::new("xmpp_outgoing_stanzas_total", "Stanzas written to streams"), &["type"]));
    register!(ROUTE_ERRORS, IntCounterVec::new(Opts::new("xmpp_route_errors_total", "Routing failures by error code"), &["error"]));
    register!(STANZAS_INTERCEPTED, IntCounterVec::new(Opts::new("xmpp_stanzas_intercepted_total", "Stanzas consumed by interceptors"), &["interceptor"]));
    register!(OFFLINE_MESSAGES, IntCounter::new("xmpp_offline_messages_total", "Messages handed to the offline hook"));
    register!(RATE_LIMITED, IntCounter::new("xmpp_rate_limited_total", "Shaper rejections and throttle events"));
    register!(CLUSTER_RPC, IntCounterVec::new(Opts::new("xmpp_cluster_rpc_total", "Cluster RPCs by method and status"), &["method", "status"]));
    register!(CONNECTED_STREAMS, IntGauge::new("xmpp_connected_streams", "Currently connected C2S streams"));
    register!(CONNECTED_COMPONENTS, IntGauge::new("xmpp_connected_components", "Attached external component streams"));
    register!(CLUSTER_PEERS_CONNECTED, IntGauge::new("xmpp_cluster_peers_connected", "Usable cluster peer connections"));
    register!(LOCAL_RESOURCES, IntGauge::new("xmpp_local_resources", "Resources registered by this node"));
    register!(ROUTE_LATENCY, HistogramVec::new(
        HistogramOpts::new("xmpp_route_duration_seconds", "Route latency by destination kind")
            .buckets(vec![0.00005, 0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5]),
        &["kind"]));
}

/// Gather all metrics and encode them in Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode Prometheus metrics");
        return String::new();
    }
    match String::from_utf8(buffer) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "Prometheus metrics were not valid UTF-8");
            String::new()
        }
    }
}

// ============================================================================
// Helper functions for metric updates
// ============================================================================

/// Record a stanza entering the router.
#[inline]
pub fn record_incoming(kind: &str) {
    if let Some(c) = INCOMING_REQUESTS.get() {
        c.with_label_values(&[kind]).inc();
    }
}

/// Record a stanza written to a stream.
#[inline]
pub fn record_outgoing(kind: &str) {
    if let Some(c) = OUTGOING_STANZAS.get() {
        c.with_label_values(&[kind]).inc();
    }
}

/// Record a routing failure.
#[inline]
pub fn record_route_error(code: &str) {
    if let Some(c) = ROUTE_ERRORS.get() {
        c.with_label_values(&[code]).inc();
    }
}

/// Record an interceptor consuming a stanza.
#[inline]
pub fn record_intercepted(id: &str) {
    if let Some(c) = STANZAS_INTERCEPTED.get() {
        c.with_label_values(&[id]).inc();
    }
}

/// Record a cluster RPC outcome.
#[inline]
pub fn record_cluster_rpc(method: &str, status: &str) {
    if let Some(c) = CLUSTER_RPC.get() {
        c.with_label_values(&[method, status]).inc();
    }
}

/// Record route latency for a destination kind.
#[inline]
pub fn record_route_latency(kind: &str, duration_secs: f64) {
    if let Some(h) = ROUTE_LATENCY.get() {
        h.with_label_values(&[kind]).observe(duration_secs);
    }
}
