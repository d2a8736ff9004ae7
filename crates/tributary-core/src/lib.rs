//!
//! Tributary Core - the flow scheduling engine
//!
//! This crate holds the data model for flow definitions and runs, the
//! contract actions implement, and the round-based scheduler that drives a
//! run to its fixpoint while checkpointing after every round.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Action contract and registry
pub mod action;

/// Application services - the scheduler and its components
pub mod application;

/// Scheduler configuration
pub mod config;

/// Domain layer - definitions, runs, payloads and signals
pub mod domain;

/// Error types
pub mod error;

/// Metric sink interface
pub mod metrics;

/// Status codes and results
pub mod status;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export key types
pub use error::CoreError;
pub use status::{Status, StatusCode};

pub use action::{
    Action, ActionContext, ActionDefinition, ActionOutputs, ActionRegistry, FnAction,
    InputDefinition,
};
pub use application::context::{SchedulerContext, SchedulerContextBuilder};
pub use application::external_io::ExternalIoBridge;
pub use application::scheduler::{FlowRunReport, Scheduler};
pub use config::SchedulerConfig;
pub use domain::events::{ChannelEventHandler, FlowEvent, FlowEventHandler, TracingEventHandler};
pub use domain::flow::{
    Flow, FlowId, FlowStatus, FlowStep, StepError, StepId, StepInput, StepOutput, Trigger,
};
pub use domain::flow_definition::{ActionId, FlowDefinition, FlowDefinitionId};
pub use domain::payload::{Items, Payload, PayloadKind};
pub use domain::repository::{FlowDefinitionRepository, FlowRepository};
pub use domain::signals::{
    ExternalInputKind, ExternalInputRequest, ExternalInputResponse, Signal, SignalHistory,
    SignalRecord, StopWorker,
};
pub use metrics::{MetricType, MetricsSink, NoopMetrics};
