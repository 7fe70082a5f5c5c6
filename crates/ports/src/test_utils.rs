use crate::secondary::metrics_port::{PipelineMetrics, SubstrateMetrics};

/// No-op implementation of all metrics sub-traits for use in tests.
pub struct NoopMetrics;

impl PipelineMetrics for NoopMetrics {}
impl SubstrateMetrics for NoopMetrics {}
