use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Renders the metrics registry in text exposition format.
pub type MetricsRenderer = Arc<dyn Fn() -> String + Send + Sync>;

/// Shared state of the observability endpoint.
///
/// Passed to Axum handlers via `State(Arc<AppState>)`.
pub struct AppState {
    pub render_metrics: MetricsRenderer,
    /// Set once the entry programs are loaded on both hooks.
    pub programs_loaded: Arc<AtomicBool>,
    pub version: &'static str,
}

impl AppState {
    pub fn new(render_metrics: MetricsRenderer, programs_loaded: Arc<AtomicBool>) -> Self {
        Self {
            render_metrics,
            programs_loaded,
            version: env!("CARGO_PKG_VERSION"),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.programs_loaded.load(Ordering::Relaxed)
    }
}
