//! Monitoring for Tributary: structured logging setup and metric sinks.

use std::env;
use tracing::info;

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, init_test_logging};
pub use metrics::{InMemoryMetricsSink, RecordedMetric, TracingMetricsSink};
pub use tributary_core::metrics::{names, MetricType, MetricsSink};

/// Configuration for initializing the monitoring system
#[derive(Debug, Clone)]
pub struct MonitoringConfig {
    /// Service name attached to the startup log line
    pub service_name: String,
    /// Enable metrics
    pub enable_metrics: bool,
    /// Log level filter used when `RUST_LOG` is unset (e.g., "info,tributary_core=debug")
    pub log_filter: String,
    /// Emit JSON lines instead of pretty output
    pub enable_json_logging: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            service_name: "tributary".to_string(),
            enable_metrics: true,
            log_filter: "info".to_string(),
            enable_json_logging: false,
        }
    }
}

impl MonitoringConfig {
    /// Defaults overridden by `TRIBUTARY_SERVICE_NAME`, `TRIBUTARY_LOG_FILTER`,
    /// `TRIBUTARY_LOG_JSON` and `TRIBUTARY_METRICS`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let flag = |key: &str, default: bool| match lookup(key).as_deref() {
            Some("1") | Some("true") => true,
            Some("0") | Some("false") => false,
            _ => default,
        };
        let defaults = Self::default();
        Self {
            service_name: lookup("TRIBUTARY_SERVICE_NAME").unwrap_or(defaults.service_name),
            log_filter: lookup("TRIBUTARY_LOG_FILTER").unwrap_or(defaults.log_filter),
            enable_json_logging: flag("TRIBUTARY_LOG_JSON", defaults.enable_json_logging),
            enable_metrics: flag("TRIBUTARY_METRICS", defaults.enable_metrics),
        }
    }

    /// The metrics sink this configuration asks for
    pub fn metrics_sink(&self) -> std::sync::Arc<dyn MetricsSink> {
        if self.enable_metrics {
            std::sync::Arc::new(TracingMetricsSink)
        } else {
            std::sync::Arc::new(tributary_core::NoopMetrics)
        }
    }
}

/// Initialize monitoring system
pub fn init(config: &MonitoringConfig) -> anyhow::Result<()> {
    init_logging(config)?;
    info!(
        service_name = %config.service_name,
        metrics = config.enable_metrics,
        "Monitoring initialized"
    );
    Ok(())
}
