//! Metric sinks for the scheduler.

use dashmap::DashMap;
use std::collections::HashMap;
use tracing::info;
use tributary_core::metrics::{MetricType, MetricsSink};

/// Writes every metric as a structured log event
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn record_metric(
        &self,
        name: &str,
        value: f64,
        metric_type: MetricType,
        labels: HashMap<String, String>,
    ) {
        info!(
            target: "tributary::metrics",
            metric = name,
            value,
            metric_type = ?metric_type,
            labels = ?labels,
            "metric"
        );
    }
}

/// One observation kept by [`InMemoryMetricsSink`]
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedMetric {
    /// Observed value
    pub value: f64,
    /// Metric type
    pub metric_type: MetricType,
    /// Labels
    pub labels: HashMap<String, String>,
}

/// Keeps every observation, for assertions in tests
#[derive(Debug, Default)]
pub struct InMemoryMetricsSink {
    metrics: DashMap<String, Vec<RecordedMetric>>,
}

impl InMemoryMetricsSink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Every observation of a metric, in recording order
    pub fn observations(&self, name: &str) -> Vec<RecordedMetric> {
        self.metrics
            .get(name)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    /// Sum of a metric's observed values
    pub fn total(&self, name: &str) -> f64 {
        self.observations(name).iter().map(|m| m.value).sum()
    }

    /// Most recent value of a metric
    pub fn last(&self, name: &str) -> Option<f64> {
        self.observations(name).last().map(|m| m.value)
    }
}

impl MetricsSink for InMemoryMetricsSink {
    fn record_metric(
        &self,
        name: &str,
        value: f64,
        metric_type: MetricType,
        labels: HashMap<String, String>,
    ) {
        self.metrics
            .entry(name.to_string())
            .or_default()
            .push(RecordedMetric {
                value,
                metric_type,
                labels,
            });
    }
}
