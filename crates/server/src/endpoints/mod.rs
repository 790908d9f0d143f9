//! HTTP endpoints.

mod metrics;
mod queues;
mod tasks;

use axum::Router;

use crate::state::AppState;

/// Create the relay router.
pub fn router() -> Router<AppState> {
    Router::new()
        .merge(queues::router())
        .merge(tasks::router())
        .merge(metrics::router())
}
