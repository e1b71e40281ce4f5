//! Health, stats and Prometheus endpoints for the jobs worker.
//!
//! - Liveness probes: `/health`, `/healthz`
//! - Readiness probes: `/ready`, `/readyz`
//! - Worker snapshot: `/stats`
//! - Prometheus metrics: `/metrics`

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use core_config::health::HealthServerConfig;
use eyre::{Result, WrapErr};
use job_worker::{QueueTransport, Worker, WorkerState, WorkerStats};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use serde::Serialize;
use serde_json::{Value, json};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

static METRICS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder once per process
pub fn init_metrics() -> Result<&'static PrometheusHandle> {
    METRICS_HANDLE.get_or_try_init(|| {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .wrap_err("Failed to install Prometheus recorder")?;

        info!("Prometheus metrics recorder initialized");
        Ok(handle)
    })
}

#[derive(Clone)]
pub struct HealthState {
    pub worker: Arc<Worker>,
    pub transport: Arc<dyn QueueTransport>,
    pub name: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub name: String,
    pub version: String,
}

pub async fn health_handler(State(state): State<HealthState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        name: state.name,
        version: state.version,
    })
}

/// Ready once the worker is consuming and the transport answers.
pub async fn ready_handler(State(state): State<HealthState>) -> (StatusCode, Json<Value>) {
    let worker_state = state.worker.state();
    let worker_check = if worker_state == WorkerState::Running {
        "ok".to_string()
    } else {
        format!("worker is {worker_state}")
    };

    let transport_check = match state.transport.health_check().await {
        Ok(()) => "ok".to_string(),
        Err(e) => format!("error: {e}"),
    };

    let ready = worker_check == "ok" && transport_check == "ok";
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "status": if ready { "ready" } else { "not_ready" },
            "checks": {
                "worker": worker_check,
                (state.transport.name()): transport_check,
            }
        })),
    )
}

pub async fn stats_handler(State(state): State<HealthState>) -> Json<WorkerStats> {
    Json(state.worker.stats())
}

pub async fn metrics_handler() -> impl IntoResponse {
    match METRICS_HANDLE.get() {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            handle.render(),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "Metrics not initialized".to_string(),
        )
            .into_response(),
    }
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/readyz", get(ready_handler))
        .route("/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Serve the health endpoints until `shutdown` resolves
pub async fn start_health_server(
    state: HealthState,
    config: &HealthServerConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let addr = config.address();
    let listener = TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("Failed to bind health server to {addr}"))?;

    info!(address = %addr, "Health server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .wrap_err("Health server failed")?;

    Ok(())
}
