//! Health and metrics endpoints for Kubernetes probes
//!
//! - `/healthz` - Liveness: the process is alive
//! - `/readyz` - Readiness: startup finished and shutdown has not begun
//! - `/metrics` - Prometheus metrics in text format
//!
//! Readiness is derived, not toggled: the binary flips [`ReadinessState`]
//! once on successful startup, and the not-ready side comes from the shared
//! [`ShutdownSignal`]. The moment shutdown is triggered the pod reports
//! not-ready (so Kubernetes drains traffic away from it) and the server
//! itself exits gracefully through the same signal.

use crate::server::metrics::SharedMetrics;
use crate::server::shutdown::ShutdownSignal;
use axum::{
    extract::State,
    http::{header::CONTENT_TYPE, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// Startup flag, set once the binary is connected and reconciling.
#[derive(Debug, Clone, Default)]
pub struct ReadinessState {
    ready: Arc<AtomicBool>,
}

impl ReadinessState {
    /// New state, initially not ready
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
struct ProbeState {
    readiness: ReadinessState,
    shutdown: ShutdownSignal,
    metrics: SharedMetrics,
}

async fn healthz() -> StatusCode {
    // if this responds at all, the process is alive
    StatusCode::OK
}

async fn readyz(State(state): State<ProbeState>) -> (StatusCode, &'static str) {
    if state.shutdown.is_triggered() {
        return (StatusCode::SERVICE_UNAVAILABLE, "draining");
    }
    if !state.readiness.is_ready() {
        return (StatusCode::SERVICE_UNAVAILABLE, "starting");
    }
    (StatusCode::OK, "ok")
}

async fn metrics(State(state): State<ProbeState>) -> impl IntoResponse {
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {}", err),
        )
            .into_response(),
    }
}

/// Serve the probe endpoints until shutdown is triggered.
///
/// Both binaries run this in the background; the proxy agent binds a
/// non-default port so :80 stays free for nginx.
pub async fn run_health_server(
    port: u16,
    readiness: ReadinessState,
    metrics: SharedMetrics,
    shutdown: ShutdownSignal,
) -> Result<(), std::io::Error> {
    let state = ProbeState {
        readiness,
        shutdown: shutdown.clone(),
        metrics,
    };

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(self::metrics))
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(port = %port, "health and metrics server listening");

    let mut drain = shutdown;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { drain.recv().await })
        .await
        .map_err(std::io::Error::other)
}
