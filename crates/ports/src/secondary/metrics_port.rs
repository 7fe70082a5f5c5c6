// Focused sub-traits for recording Prometheus metrics.
//
// All methods take `&self`; implementations use atomics. Default
// implementations are no-ops so test mocks only override what they check.

// ── Pipeline metrics ───────────────────────────────────────────────

pub trait PipelineMetrics: Send + Sync {
    /// Record a chain rebuild with result `success` or `failure`.
    fn record_rebuild(&self, _chain: &str, _result: &str) {}

    /// Observe how long a rebuild took, in seconds.
    fn observe_rebuild_duration(&self, _chain: &str, _duration_seconds: f64) {}

    /// Set the number of rules configured in a chain.
    fn set_rules_loaded(&self, _chain: &str, _count: u64) {}

    /// Set the number of stages in a chain's active pipeline.
    fn set_pipeline_stages(&self, _chain: &str, _count: u64) {}

    /// Set the number of entries in the active Horus table (0 = off).
    fn set_horus_rules(&self, _count: u64) {}

    /// Record whether the accept-established shortcut is on for a chain.
    fn set_accept_established(&self, _chain: &str, _enabled: bool) {}
}

// ── Substrate metrics ──────────────────────────────────────────────

pub trait SubstrateMetrics: Send + Sync {
    /// Set the load status of a fixed program (true=loaded).
    fn set_program_status(&self, _program: &str, _loaded: bool) {}
}

// ── Composite super-trait ──────────────────────────────────────────

/// Services accept `Arc<dyn MetricsPort>`.
pub trait MetricsPort: PipelineMetrics + SubstrateMetrics {}

impl<T> MetricsPort for T where T: PipelineMetrics + SubstrateMetrics {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_port_is_object_safe() {
        fn _check(port: &dyn MetricsPort) {
            port.record_rebuild("INPUT", "success");
            port.observe_rebuild_duration("INPUT", 0.002);
            port.set_rules_loaded("INPUT", 10);
            port.set_pipeline_stages("INPUT", 4);
            port.set_horus_rules(50);
            port.set_accept_established("OUTPUT", true);
            port.set_program_status("parser", true);
        }
    }

    #[test]
    fn minimal_mock_compiles() {
        struct MinimalMock;
        impl PipelineMetrics for MinimalMock {}
        impl SubstrateMetrics for MinimalMock {}

        let mock = MinimalMock;
        let port: &dyn MetricsPort = &mock;
        port.set_rules_loaded("FORWARD", 0);
    }
}
