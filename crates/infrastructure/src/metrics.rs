use ports::secondary::metrics_port::{PipelineMetrics, SubstrateMetrics};
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets_range};
use prometheus_client::registry::Registry;

// ── Label types ─────────────────────────────────────────────────────

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ChainLabels {
    pub chain: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RebuildLabels {
    pub chain: String,
    pub result: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ProgramLabels {
    pub program: String,
}

// ── Agent metrics registry ──────────────────────────────────────────

/// Prometheus metrics registry for the agent.
///
/// Metric families use atomics, so recording only requires `&self`.
/// Wrap in `Arc` to share between the service and the HTTP endpoint.
pub struct AgentMetrics {
    registry: Registry,
    pub pipeline_rebuilds_total: Family<RebuildLabels, Counter>,
    pub pipeline_rebuild_duration: Family<ChainLabels, Histogram>,
    pub rules_loaded: Family<ChainLabels, Gauge>,
    pub pipeline_stages: Family<ChainLabels, Gauge>,
    pub horus_rules_offloaded: Gauge,
    pub accept_established_enabled: Family<ChainLabels, Gauge>,
    pub program_status: Family<ProgramLabels, Gauge>,
}

impl AgentMetrics {
    /// Create a registry with every family registered under the
    /// `chainfilter` prefix.
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("chainfilter");

        let pipeline_rebuilds_total = Family::<RebuildLabels, Counter>::default();
        registry.register(
            "pipeline_rebuilds",
            "Chain pipeline rebuilds by result",
            pipeline_rebuilds_total.clone(),
        );

        let pipeline_rebuild_duration =
            Family::<ChainLabels, Histogram>::new_with_constructor(|| {
                // 10μs to 1s, 12 buckets
                Histogram::new(exponential_buckets_range(0.000_01, 1.0, 12))
            });
        registry.register(
            "pipeline_rebuild_duration_seconds",
            "Time spent compiling and swapping a chain pipeline",
            pipeline_rebuild_duration.clone(),
        );

        let rules_loaded = Family::<ChainLabels, Gauge>::default();
        registry.register(
            "rules_loaded",
            "Rules configured per chain",
            rules_loaded.clone(),
        );

        let pipeline_stages = Family::<ChainLabels, Gauge>::default();
        registry.register(
            "pipeline_stages",
            "Programs in the active pipeline of a chain",
            pipeline_stages.clone(),
        );

        let horus_rules_offloaded = Gauge::default();
        registry.register(
            "horus_rules_offloaded",
            "INPUT rules answered by the fast-path table (0 = disabled)",
            horus_rules_offloaded.clone(),
        );

        let accept_established_enabled = Family::<ChainLabels, Gauge>::default();
        registry.register(
            "accept_established_enabled",
            "Accept-established shortcut state per chain (1=on)",
            accept_established_enabled.clone(),
        );

        let program_status = Family::<ProgramLabels, Gauge>::default();
        registry.register(
            "program_status",
            "Entry program load status (1=loaded, 0=unloaded)",
            program_status.clone(),
        );

        Self {
            registry,
            pipeline_rebuilds_total,
            pipeline_rebuild_duration,
            rules_loaded,
            pipeline_stages,
            horus_rules_offloaded,
            accept_established_enabled,
            program_status,
        }
    }

    /// Encode all registered metrics to `OpenMetrics` text format.
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &self.registry)
            .expect("encoding metrics to string should not fail");
        buffer
    }
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn chain_labels(chain: &str) -> ChainLabels {
    ChainLabels {
        chain: chain.to_string(),
    }
}

fn gauge_value(count: u64) -> i64 {
    count.try_into().unwrap_or(i64::MAX)
}

// ── Sub-trait implementations ──────────────────────────────────────

impl PipelineMetrics for AgentMetrics {
    fn record_rebuild(&self, chain: &str, result: &str) {
        self.pipeline_rebuilds_total
            .get_or_create(&RebuildLabels {
                chain: chain.to_string(),
                result: result.to_string(),
            })
            .inc();
    }

    fn observe_rebuild_duration(&self, chain: &str, duration_seconds: f64) {
        self.pipeline_rebuild_duration
            .get_or_create(&chain_labels(chain))
            .observe(duration_seconds);
    }

    fn set_rules_loaded(&self, chain: &str, count: u64) {
        self.rules_loaded
            .get_or_create(&chain_labels(chain))
            .set(gauge_value(count));
    }

    fn set_pipeline_stages(&self, chain: &str, count: u64) {
        self.pipeline_stages
            .get_or_create(&chain_labels(chain))
            .set(gauge_value(count));
    }

    fn set_horus_rules(&self, count: u64) {
        self.horus_rules_offloaded.set(gauge_value(count));
    }

    fn set_accept_established(&self, chain: &str, enabled: bool) {
        self.accept_established_enabled
            .get_or_create(&chain_labels(chain))
            .set(i64::from(enabled));
    }
}

impl SubstrateMetrics for AgentMetrics {
    fn set_program_status(&self, program: &str, loaded: bool) {
        self.program_status
            .get_or_create(&ProgramLabels {
                program: program.to_string(),
            })
            .set(i64::from(loaded));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ports::secondary::metrics_port::MetricsPort;

    #[test]
    fn new_creates_valid_registry() {
        let encoded = AgentMetrics::new().encode();
        assert!(encoded.contains("# EOF"));
        assert!(encoded.contains("chainfilter_horus_rules_offloaded"));
    }

    #[test]
    fn rebuild_counter_carries_chain_and_result() {
        let metrics = AgentMetrics::new();
        metrics.record_rebuild("INPUT", "success");
        metrics.record_rebuild("INPUT", "success");
        metrics.record_rebuild("FORWARD", "failure");

        let encoded = metrics.encode();
        assert!(encoded.contains("chainfilter_pipeline_rebuilds_total"));
        assert!(encoded.contains("chain=\"INPUT\",result=\"success\"} 2"));
        assert!(encoded.contains("chain=\"FORWARD\",result=\"failure\"} 1"));
    }

    #[test]
    fn rebuild_duration_histogram() {
        let metrics = AgentMetrics::new();
        metrics.observe_rebuild_duration("OUTPUT", 0.004);
        let encoded = metrics.encode();
        assert!(encoded.contains("chainfilter_pipeline_rebuild_duration_seconds_count{chain=\"OUTPUT\"} 1"));
    }

    #[test]
    fn gauges_follow_latest_value() {
        let metrics = AgentMetrics::new();
        metrics.set_rules_loaded("INPUT", 12);
        metrics.set_rules_loaded("INPUT", 7);
        metrics.set_pipeline_stages("INPUT", 4);
        metrics.set_horus_rules(3);
        metrics.set_accept_established("OUTPUT", true);

        let encoded = metrics.encode();
        assert!(encoded.contains("chainfilter_rules_loaded{chain=\"INPUT\"} 7"));
        assert!(encoded.contains("chainfilter_pipeline_stages{chain=\"INPUT\"} 4"));
        assert!(encoded.contains("chainfilter_horus_rules_offloaded 3"));
        assert!(encoded.contains("chainfilter_accept_established_enabled{chain=\"OUTPUT\"} 1"));
    }

    #[test]
    fn program_status_toggles() {
        let metrics = AgentMetrics::new();
        metrics.set_program_status("ingress/parser", true);
        assert!(metrics.encode().contains("program=\"ingress/parser\"} 1"));
        metrics.set_program_status("ingress/parser", false);
        assert!(metrics.encode().contains("program=\"ingress/parser\"} 0"));
    }

    #[test]
    fn usable_as_metrics_port() {
        let metrics = AgentMetrics::new();
        let port: &dyn MetricsPort = &metrics;
        port.set_rules_loaded("FORWARD", 2);
        assert!(metrics.encode().contains("chain=\"FORWARD\"} 2"));
    }
}
