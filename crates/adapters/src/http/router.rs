use std::sync::Arc;

use axum::Router;
use axum::routing::get;

use super::health_handler::{healthz, readyz};
use super::metrics_handler::metrics;
use super::state::AppState;

/// Build the observability router: `/healthz`, `/readyz`, `/metrics`.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}
