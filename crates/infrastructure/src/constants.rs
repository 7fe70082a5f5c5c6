use std::time::Duration;

// ── Paths ──────────────────────────────────────────────────────────

pub const DEFAULT_CONFIG_PATH: &str = "/etc/chainfilter/config.yaml";

/// Directory holding one compiled object per program kind.
pub const DEFAULT_OBJECT_DIR: &str = "/usr/lib/chainfilter";

/// bpffs directory for the shared program arrays and tables.
pub const DEFAULT_PIN_PATH: &str = "/sys/fs/bpf/chainfilter";

// ── Network defaults ───────────────────────────────────────────────

pub const DEFAULT_METRICS_PORT: u16 = 9100;

// ── Timers ─────────────────────────────────────────────────────────

pub const DEFAULT_CONNTRACK_CLOCK_INTERVAL_MS: u64 = 1_000;

pub const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
