//! Queue endpoints.

use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
};
use bytes::Bytes;
use relay_common::{AppError, AppResult, QueueMetricsSnapshot};
use relay_queue::{QueueDefinition, TaskId};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/queues", get(list_queues))
        .route("/queues/{name}", get(show_queue))
        .route("/queues/{name}/tasks", post(enqueue))
}

/// One queue's definition and live counts.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueResponse {
    pub name: String,
    pub target: String,
    pub rate: String,
    pub bucket_size: f64,
    pub max_concurrent_requests: u32,
    pub task_retry_limit: u32,
    pub min_backoff_seconds: f64,
    pub max_doublings: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_backoff_seconds: Option<f64>,
    pub pending: usize,
    pub in_flight: usize,
}

impl QueueResponse {
    fn new(state: &AppState, definition: &QueueDefinition) -> AppResult<Self> {
        let dispatcher = &state.dispatcher;
        let retry = &definition.retry_parameters;
        Ok(Self {
            name: definition.name.clone(),
            target: definition.target.clone(),
            rate: definition.rate.to_string(),
            bucket_size: definition.burst(),
            max_concurrent_requests: definition.max_concurrent_requests,
            task_retry_limit: retry.task_retry_limit,
            min_backoff_seconds: retry.min_backoff_seconds,
            max_doublings: retry.max_doublings,
            max_backoff_seconds: retry.max_backoff_seconds,
            pending: dispatcher.pending(&definition.name)?,
            in_flight: dispatcher.in_flight(&definition.name)?,
        })
    }
}

/// Queue detail with counters.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueDetailResponse {
    #[serde(flatten)]
    pub queue: QueueResponse,
    /// Rate tokens the queue could spend right now.
    pub available_tokens: u32,
    pub metrics: QueueMetricsSnapshot,
}

/// List every registered queue.
async fn list_queues(State(state): State<AppState>) -> AppResult<Json<Vec<QueueResponse>>> {
    let queues = state
        .dispatcher
        .registry()
        .iter()
        .map(|definition| QueueResponse::new(&state, definition))
        .collect::<AppResult<Vec<_>>>()?;
    Ok(Json(queues))
}

/// Show one queue.
async fn show_queue(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> AppResult<Json<QueueDetailResponse>> {
    let definition = state.dispatcher.registry().lookup(&name)?;
    let metrics = state
        .dispatcher
        .metrics()
        .queue(&name)
        .ok_or_else(|| AppError::UnknownQueue(name.clone()))?
        .snapshot(&name);

    Ok(Json(QueueDetailResponse {
        queue: QueueResponse::new(&state, &definition)?,
        available_tokens: state.dispatcher.available_tokens(&name)?,
        metrics,
    }))
}

/// Query parameters for submission.
#[derive(Debug, Default, Deserialize)]
pub struct EnqueueParams {
    /// Seconds before the task becomes eligible.
    pub delay_secs: Option<f64>,
}

/// Submission acknowledgement.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueResponse {
    pub id: TaskId,
    pub queue: String,
}

/// Submit a task; the request body is the payload.
async fn enqueue(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<EnqueueParams>,
    body: Bytes,
) -> AppResult<(StatusCode, Json<EnqueueResponse>)> {
    let delay = match params.delay_secs {
        None => Duration::ZERO,
        Some(secs) => Duration::try_from_secs_f64(secs)
            .map_err(|_| AppError::BadRequest(format!("invalid delay_secs: {secs}")))?,
    };

    debug!(queue = %name, bytes = body.len(), "Task submitted over HTTP");
    let id = state.dispatcher.enqueue_with_delay(&name, body, delay).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(EnqueueResponse { id, queue: name }),
    ))
}
