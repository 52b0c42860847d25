//! Operational HTTP endpoint.
//!
//! Serves `GET /metrics` in Prometheus text format and `GET /healthz` for
//! liveness probes. Runs as a background task; losing it never affects
//! stanza routing.

use axum::Router;
use axum::http::StatusCode;
use axum::routing::get;
use std::net::SocketAddr;
use tracing::{error, info};

async fn metrics() -> String {
    crate::metrics::gather_metrics()
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

/// Serve the operational endpoint on `addr` until the process exits.
pub async fn serve(addr: SocketAddr) {
    let app = Router::new()
        .route("/metrics", get(metrics))
        .route("/healthz", get(healthz));

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(%addr, error = %e, "operational http endpoint failed to bind");
            return;
        }
    };
    info!(%addr, "operational http endpoint listening");

    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "operational http endpoint failed");
    }
}
