//! Status surface: health probe, varz JSON, the route-table snapshot, and
//! Prometheus text, served on their own port away from proxied traffic.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::registry::RouteRegistry;
use crate::varz::Varz;

/// Install the process-wide Prometheus recorder and register the metric
/// descriptions. Called exactly once, before any counter is touched; a
/// second recorder in the same process is a wiring bug, hence the panic.
pub fn init_prometheus() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("a metrics recorder is already installed in this process");
    crate::varz::describe_metrics();
    handle
}

pub struct StatusState {
    pub registry: Arc<RouteRegistry>,
    pub varz: Arc<Varz>,
    pub prometheus: Option<PrometheusHandle>,
}

pub fn create_router(state: Arc<StatusState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/varz", get(varz))
        .route("/routes", get(routes))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the status router until shutdown flips.
pub async fn serve(
    listener: TcpListener,
    state: Arc<StatusState>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, "Status server started");
    let app = create_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            loop {
                if shutdown.changed().await.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        })
        .await?;
    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

async fn varz(State(state): State<Arc<StatusState>>) -> impl IntoResponse {
    let (routes, endpoints) = state.registry.counts();
    state.varz.update_registry_gauges(routes, endpoints);
    Json(state.varz.snapshot(routes, endpoints))
}

async fn routes(State(state): State<Arc<StatusState>>) -> impl IntoResponse {
    Json(state.registry.snapshot())
}

async fn metrics(State(state): State<Arc<StatusState>>) -> impl IntoResponse {
    match &state.prometheus {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            "Metrics recorder not installed".to_string(),
        ),
    }
}
