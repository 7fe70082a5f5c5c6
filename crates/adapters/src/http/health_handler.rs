use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Serialize;

use super::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    /// Always `"ok"`.
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct ReadyResponse {
    /// `"ready"` or `"not_ready"`.
    pub status: &'static str,
    pub programs_loaded: bool,
}

/// Liveness probe. Always 200 while the process runs.
pub async fn healthz(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: state.version,
    })
}

/// Readiness probe. 200 once the entry programs are loaded, 503 before.
pub async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let loaded = state.is_ready();
    let (code, status) = if loaded {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not_ready")
    };
    (
        code,
        Json(ReadyResponse {
            status,
            programs_loaded: loaded,
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn test_state(loaded: bool) -> Arc<AppState> {
        Arc::new(AppState::new(
            Arc::new(String::new),
            Arc::new(AtomicBool::new(loaded)),
        ))
    }

    #[tokio::test]
    async fn healthz_is_ok() {
        let Json(body) = healthz(State(test_state(false))).await;
        assert_eq!(body.status, "ok");
    }

    #[tokio::test]
    async fn readyz_follows_program_state() {
        let state = test_state(false);
        let response = readyz(State(Arc::clone(&state))).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        state.programs_loaded.store(true, Ordering::Relaxed);
        let response = readyz(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
