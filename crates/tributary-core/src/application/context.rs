use dashmap::DashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::action::ActionRegistry;
use crate::application::external_io::ExternalIoBridge;
use crate::config::SchedulerConfig;
use crate::domain::events::{FlowEventHandler, TracingEventHandler};
use crate::domain::flow::FlowId;
use crate::domain::repository::{FlowDefinitionRepository, FlowRepository};
use crate::domain::signals::SignalHistory;
use crate::metrics::{MetricsSink, NoopMetrics};

/// Everything the scheduler's components consume, passed explicitly
pub struct SchedulerContext {
    pub(crate) flows: Arc<dyn FlowRepository>,
    pub(crate) definitions: Arc<dyn FlowDefinitionRepository>,
    pub(crate) registry: Arc<ActionRegistry>,
    pub(crate) metrics: Arc<dyn MetricsSink>,
    pub(crate) events: Arc<dyn FlowEventHandler>,
    pub(crate) config: SchedulerConfig,
    pub(crate) bridge: Arc<ExternalIoBridge>,
    pub(crate) runs: DashMap<FlowId, CancellationToken>,
}

impl SchedulerContext {
    /// Start building a context over the durable stores and registered actions
    pub fn builder(
        flows: Arc<dyn FlowRepository>,
        definitions: Arc<dyn FlowDefinitionRepository>,
        signals: Arc<dyn SignalHistory>,
        registry: ActionRegistry,
    ) -> SchedulerContextBuilder {
        SchedulerContextBuilder {
            flows,
            definitions,
            signals,
            registry,
            metrics: None,
            events: None,
            config: None,
        }
    }

    /// Registered actions
    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    /// Signal bridge shared by every action run through this context
    pub fn bridge(&self) -> &Arc<ExternalIoBridge> {
        &self.bridge
    }

    /// Scheduler configuration
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Flow repository
    pub fn flows(&self) -> &Arc<dyn FlowRepository> {
        &self.flows
    }
}

/// Builder for [`SchedulerContext`]
pub struct SchedulerContextBuilder {
    flows: Arc<dyn FlowRepository>,
    definitions: Arc<dyn FlowDefinitionRepository>,
    signals: Arc<dyn SignalHistory>,
    registry: ActionRegistry,
    metrics: Option<Arc<dyn MetricsSink>>,
    events: Option<Arc<dyn FlowEventHandler>>,
    config: Option<SchedulerConfig>,
}

impl SchedulerContextBuilder {
    /// Metrics destination, defaults to [`NoopMetrics`]
    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Event handler, defaults to [`TracingEventHandler`]
    pub fn events(mut self, events: Arc<dyn FlowEventHandler>) -> Self {
        self.events = Some(events);
        self
    }

    /// Configuration, defaults to [`SchedulerConfig::default`]
    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Build the context
    pub fn build(self) -> SchedulerContext {
        let config = self.config.unwrap_or_default();
        let bridge = Arc::new(ExternalIoBridge::new(
            self.signals,
            config.input_poll_interval(),
        ));
        SchedulerContext {
            flows: self.flows,
            definitions: self.definitions,
            registry: Arc::new(self.registry),
            metrics: self.metrics.unwrap_or_else(|| Arc::new(NoopMetrics)),
            events: self.events.unwrap_or_else(|| Arc::new(TracingEventHandler)),
            config,
            bridge,
            runs: DashMap::new(),
        }
    }
}
