//! Agent configuration: structs, parsing, and validation.
//!
//! - `common`: shared helpers and `ConfigError`
//! - `chains`: per-chain default policy and rule list

mod chains;
mod common;

pub use chains::{ChainConfig, ChainsConfig};
pub use common::ConfigError;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_CONNTRACK_CLOCK_INTERVAL_MS, DEFAULT_METRICS_PORT, DEFAULT_OBJECT_DIR,
    DEFAULT_PIN_PATH,
};
use common::{MAX_CHAIN_RULES, default_true, warn_if_world_readable};

// ── Top-level config ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    pub agent: AgentInfo,

    #[serde(default)]
    pub substrate: SubstrateConfig,

    #[serde(default)]
    pub filter: FilterConfig,

    #[serde(default)]
    pub chains: ChainsConfig,
}

impl AgentConfig {
    /// Load config from a YAML file.
    ///
    /// On Unix, logs a warning if the config file is world-readable.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        warn_if_world_readable(path, "config file");
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse config from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml_ng::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the config after deserialization.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.interfaces.is_empty() {
            return Err(ConfigError::validation(
                "agent.interfaces",
                "at least one interface is required",
            ));
        }
        if let Some(name) = self
            .agent
            .interfaces
            .iter()
            .find(|name| name.trim().is_empty())
        {
            return Err(ConfigError::InvalidValue {
                field: "agent.interfaces".to_string(),
                value: name.clone(),
                expected: "a non-empty interface name".to_string(),
            });
        }
        if self.agent.metrics_port == Some(0) {
            return Err(ConfigError::validation(
                "agent.metrics_port",
                "port 0 is not allowed",
            ));
        }

        if self.substrate.mode == SubstrateMode::Ebpf {
            if self.substrate.object_dir.as_os_str().is_empty() {
                return Err(ConfigError::validation(
                    "substrate.object_dir",
                    "required when mode is ebpf",
                ));
            }
            if self.substrate.pin_path.as_os_str().is_empty() {
                return Err(ConfigError::validation(
                    "substrate.pin_path",
                    "required when mode is ebpf",
                ));
            }
        }

        if self.filter.max_rules == 0 || self.filter.max_rules > MAX_CHAIN_RULES {
            return Err(ConfigError::validation(
                "filter.max_rules",
                format!("must be between 1 and {MAX_CHAIN_RULES}"),
            ));
        }
        if self.filter.conntrack_clock_interval_ms == 0 {
            return Err(ConfigError::validation(
                "filter.conntrack_clock_interval_ms",
                "must be positive",
            ));
        }

        self.chains.validate(self.filter.max_rules)
    }

    /// Period of the conntrack timestamp task.
    pub fn conntrack_clock_interval(&self) -> Duration {
        Duration::from_millis(self.filter.conntrack_clock_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentInfo {
    pub interfaces: Vec<String>,

    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,

    #[serde(default = "default_log_format")]
    pub log_format: LogFormat,

    /// Port of the `/metrics` and health endpoint. Absent disables it.
    #[serde(default = "default_metrics_port")]
    pub metrics_port: Option<u16>,

    /// Defaults to `127.0.0.1` (localhost only).
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}
fn default_log_format() -> LogFormat {
    LogFormat::Json
}
#[allow(clippy::unnecessary_wraps)]
fn default_metrics_port() -> Option<u16> {
    Some(DEFAULT_METRICS_PORT)
}
fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

// ── Substrate ─────────────────────────────────────────────────────

/// Where programs are loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubstrateMode {
    /// In-process tables and a software datapath. Nothing touches the kernel.
    #[default]
    Memory,
    /// aya-loaded eBPF objects attached to `agent.interfaces`.
    Ebpf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubstrateConfig {
    #[serde(default)]
    pub mode: SubstrateMode,

    /// Directory holding one `<kind>.bpf.o` per program kind.
    #[serde(default = "default_object_dir")]
    pub object_dir: PathBuf,

    /// bpffs directory where shared maps are pinned.
    #[serde(default = "default_pin_path")]
    pub pin_path: PathBuf,
}

impl Default for SubstrateConfig {
    fn default() -> Self {
        Self {
            mode: SubstrateMode::default(),
            object_dir: default_object_dir(),
            pin_path: default_pin_path(),
        }
    }
}

fn default_object_dir() -> PathBuf {
    PathBuf::from(DEFAULT_OBJECT_DIR)
}
fn default_pin_path() -> PathBuf {
    PathBuf::from(DEFAULT_PIN_PATH)
}

// ── Filter ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilterConfig {
    #[serde(default = "default_max_rules")]
    pub max_rules: usize,

    /// Rebuild after every change instead of on explicit apply.
    #[serde(default = "default_true")]
    pub interactive: bool,

    /// Offload the leading host/port rules of INPUT to the fast path.
    #[serde(default = "default_true")]
    pub horus: bool,

    /// Whether connection tracking is running, so `conntrack` matches are legal.
    #[serde(default = "default_true")]
    pub conntrack: bool,

    #[serde(default = "default_clock_interval_ms")]
    pub conntrack_clock_interval_ms: u64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            max_rules: default_max_rules(),
            interactive: true,
            horus: true,
            conntrack: true,
            conntrack_clock_interval_ms: default_clock_interval_ms(),
        }
    }
}

fn default_max_rules() -> usize {
    MAX_CHAIN_RULES
}
fn default_clock_interval_ms() -> u64 {
    DEFAULT_CONNTRACK_CLOCK_INTERVAL_MS
}

// ── Log level ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "error" => Ok(Self::Error),
            "warn" | "warning" => Ok(Self::Warn),
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            "trace" => Ok(Self::Trace),
            _ => Err(format!(
                "invalid log level '{s}': expected error|warn|info|debug|trace"
            )),
        }
    }
}

// ── Log format ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Json,
    Text,
}

impl LogFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Text => "text",
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "text" | "pretty" => Ok(Self::Text),
            _ => Err(format!("invalid log format '{s}': expected json|text")),
        }
    }
}
