pub mod health_handler;
pub mod metrics_handler;
pub mod router;
pub mod server;
pub mod state;

pub use server::run_http_server;
pub use state::{AppState, MetricsRenderer};
