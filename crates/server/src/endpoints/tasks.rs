//! Task endpoints.

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::get,
};
use relay_common::{AppError, AppResult};
use relay_queue::{TaskId, TaskSnapshot};

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/tasks/{id}", get(show_task).delete(cancel_task))
}

/// Current state of a live task.
async fn show_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<TaskSnapshot>> {
    state
        .dispatcher
        .status(&TaskId::new(id.clone()))
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("task {id}")))
}

/// Cancel a pending or dispatching task.
async fn cancel_task(State(state): State<AppState>, Path(id): Path<String>) -> AppResult<StatusCode> {
    state.dispatcher.cancel(&TaskId::new(id))?;
    Ok(StatusCode::NO_CONTENT)
}
