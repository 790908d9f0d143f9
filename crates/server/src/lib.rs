//! HTTP surface of the relay dispatcher.
//!
//! Exposes task submission, status and cancellation plus operational
//! endpoints (queue listing, Prometheus metrics, dead letters).

pub mod endpoints;
pub mod state;

use std::future::Future;

use axum::Router;
use tower_http::trace::TraceLayer;

pub use endpoints::router;
pub use state::AppState;

/// Build the application router with tracing attached.
pub fn app(state: AppState) -> Router {
    router().layer(TraceLayer::new_for_http()).with_state(state)
}

/// Wait for `signal`, then stop the dispatcher taking new tasks.
///
/// Meant for `axum::serve(..).with_graceful_shutdown`, so requests still
/// being served see the draining state.
pub async fn drain_on(state: AppState, signal: impl Future<Output = ()>) {
    signal.await;
    state.dispatcher.shutdown();
}
