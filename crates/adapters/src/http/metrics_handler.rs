use std::sync::Arc;

use axum::extract::State;
use axum::http::header;

use super::state::AppState;

/// Content-Type for `OpenMetrics` text exposition format.
const OPENMETRICS_CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

/// Serves Prometheus metrics in `OpenMetrics` text format.
pub async fn metrics(
    State(state): State<Arc<AppState>>,
) -> ([(header::HeaderName, &'static str); 1], String) {
    let body = (state.render_metrics)();
    ([(header::CONTENT_TYPE, OPENMETRICS_CONTENT_TYPE)], body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn content_type_is_valid() {
        assert!(OPENMETRICS_CONTENT_TYPE.starts_with("application/openmetrics-text"));
        assert!(OPENMETRICS_CONTENT_TYPE.contains("version=1.0.0"));
    }

    #[tokio::test]
    async fn body_comes_from_renderer() {
        let state = Arc::new(AppState::new(
            Arc::new(|| "# EOF\n".to_string()),
            Arc::new(AtomicBool::new(true)),
        ));
        let (headers, body) = metrics(State(state)).await;
        assert_eq!(headers[0].1, OPENMETRICS_CONTENT_TYPE);
        assert_eq!(body, "# EOF\n");
    }
}
