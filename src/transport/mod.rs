//! Transport exposure: one router, two ways in.
//!
//! ```text
//! GET /metrics   → Prometheus text, no CORS headers
//! /*             → API surface behind a permissive CORS layer
//! ```
//!
//! [`HttpListener`] serves the router on a clearnet TCP socket;
//! [`overlay::OverlayListener`] serves the identical router over overlay
//! streams.

pub mod exporter;
pub mod overlay;
#[cfg(feature = "overlay-libp2p")]
pub mod swarm;

use axum::{Router, routing::get};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::error::AppError;
use crate::subsystems::api;
use crate::supervisor::readiness::ReadinessReporter;
use crate::supervisor::{Task, TaskFuture};

/// Wrap the assembled API routes for serving.
///
/// Unknown paths get a Matrix `M_UNRECOGNIZED` 404, still with CORS headers.
pub fn build_routes(surface: Router, metrics: PrometheusHandle) -> Router {
    let api = surface
        .fallback(api::unrecognized)
        .layer(CorsLayer::permissive());
    Router::new()
        .route("/metrics", get(exporter::render))
        .with_state(metrics)
        .fallback_service(api)
}

// ── HttpListener ──────────────────────────────────────────────────────────────

pub struct HttpListener {
    bind_addr: String,
    router: Router,
    readiness: ReadinessReporter,
}

impl HttpListener {
    pub fn new(bind_addr: impl Into<String>, router: Router, readiness: ReadinessReporter) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            router,
            readiness,
        }
    }
}

impl Task for HttpListener {
    fn id(&self) -> &str {
        "http"
    }

    fn run(self: Box<Self>, shutdown: CancellationToken) -> TaskFuture {
        Box::pin(serve_http(self.bind_addr, self.router, self.readiness, shutdown))
    }
}

async fn serve_http(
    bind_addr: String,
    router: Router,
    readiness: ReadinessReporter,
    shutdown: CancellationToken,
) -> Result<(), AppError> {
    let listener = match TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            readiness.set_failed(e.to_string()).await;
            return Err(AppError::Listener(format!("http bind failed on {bind_addr}: {e}")));
        }
    };
    let local = listener
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| bind_addr.clone());
    readiness.set_bound(local.clone()).await;
    info!(addr = %local, "http listener serving");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(|e| AppError::Listener(format!("http server error: {e}")))?;

    info!(addr = %local, "http listener shut down");
    Ok(())
}
