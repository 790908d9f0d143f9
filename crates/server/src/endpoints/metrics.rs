//! Operational endpoints.
//!
//! Provides endpoints for:
//! - Prometheus metrics export
//! - Dead letter inspection
//! - Health checks

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use relay_common::QueueMetricsSnapshot;
use relay_queue::DeadLetterEntry;
use serde::Serialize;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/metrics", get(metrics_prometheus))
        .route("/metrics/queues", get(metrics_json))
        .route("/dead-letters", get(dead_letters))
        .route("/health", get(health_check))
}

/// Export per-queue counters in Prometheus format.
async fn metrics_prometheus(State(state): State<AppState>) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.dispatcher.metrics().to_prometheus(),
    )
        .into_response()
}

async fn metrics_json(State(state): State<AppState>) -> Json<Vec<QueueMetricsSnapshot>> {
    Json(state.dispatcher.metrics().snapshot())
}

/// Terminally failed tasks, oldest first.
async fn dead_letters(State(state): State<AppState>) -> Json<Vec<DeadLetterEntry>> {
    Json(state.dead_letters.entries().await)
}

/// Health check response.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub shutting_down: bool,
}

async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let shutting_down = state.dispatcher.is_shutting_down();
    let status = if shutting_down {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (
        status,
        Json(HealthResponse {
            status: if shutting_down { "draining" } else { "ok" },
            version: env!("CARGO_PKG_VERSION"),
            shutting_down,
        }),
    )
}
