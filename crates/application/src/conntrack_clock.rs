use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use domain::common::error::DomainError;
use ports::secondary::program_loader_port::{TableHandle, TableKey, TableValue};
use tokio_util::sync::CancellationToken;

/// Default tick of the connection-aging clock.
pub const DEFAULT_CLOCK_INTERVAL: Duration = Duration::from_secs(1);

/// Write the wall-clock time in nanoseconds into the connection-tracking
/// updater's `timestamp` table.
pub fn write_timestamp(table: &dyn TableHandle) -> Result<u64, DomainError> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| DomainError::EngineError(format!("system clock before epoch: {e}")))?;
    let nanos = u64::try_from(now.as_nanos()).unwrap_or(u64::MAX);
    table.set(TableKey::Index(0), TableValue::Counter(nanos))?;
    Ok(nanos)
}

/// Refresh the datapath clock every `interval` until cancelled.
pub async fn run_conntrack_clock(
    table: Arc<dyn TableHandle>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if let Err(e) = write_timestamp(table.as_ref()) {
            tracing::debug!(error = %e, "conntrack timestamp update failed");
        }
    }
    tracing::debug!("conntrack clock stopped");
}
