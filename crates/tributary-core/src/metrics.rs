use std::collections::HashMap;

/// Type of metric for collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricType {
    /// Counter metrics accumulate values
    Counter,
    /// Gauge metrics record current values
    Gauge,
    /// Histogram metrics observe distributions
    Histogram,
}

/// Destination for scheduler metrics
pub trait MetricsSink: Send + Sync {
    /// Record a metric with the given name, value, type, and labels
    fn record_metric(
        &self,
        name: &str,
        value: f64,
        metric_type: MetricType,
        labels: HashMap<String, String>,
    );
}

/// Discards every metric
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_metric(&self, _: &str, _: f64, _: MetricType, _: HashMap<String, String>) {}
}

/// Metric names emitted by the scheduler
pub mod names {
    /// Rounds a flow took to reach its fixpoint
    pub const FLOW_ROUNDS: &str = "tributary.flow.rounds";
    /// Flows that reached a terminal status, labelled by status
    pub const FLOW_TERMINATED: &str = "tributary.flow.terminated";
    /// Wall time of one action step including retries
    pub const STEP_DURATION_MS: &str = "tributary.step.duration_ms";
    /// Action steps that finished with a non-Ok status
    pub const STEP_FAILED: &str = "tributary.step.failed";
    /// Attempts beyond the first
    pub const STEP_RETRIED: &str = "tributary.step.retried";
}
