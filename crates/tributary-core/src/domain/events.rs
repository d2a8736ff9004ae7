use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::debug;

use crate::domain::flow::{FlowId, FlowStatus, StepId};
use crate::status::StatusCode;
use crate::CoreError;

/// Domain events recorded on a [`crate::Flow`] while it is driven
#[derive(Debug, Clone, PartialEq)]
pub enum FlowEvent {
    /// The flow was created from a definition and trigger
    FlowStarted {
        /// Flow id
        flow_id: FlowId,
        /// When the event occurred
        timestamp: DateTime<Utc>,
    },

    /// A persisted flow was picked up again
    FlowResumed {
        /// Flow id
        flow_id: FlowId,
        /// Round the flow resumes after
        round: u32,
        /// When the event occurred
        timestamp: DateTime<Utc>,
    },

    /// A step finished and was marked processed
    StepProcessed {
        /// Flow id
        flow_id: FlowId,
        /// Step id
        step_id: StepId,
        /// Outcome code
        code: StatusCode,
        /// When the event occurred
        timestamp: DateTime<Utc>,
    },

    /// A parallel group created its branch steps
    BranchesSpawned {
        /// Flow id
        flow_id: FlowId,
        /// Group step id
        step_id: StepId,
        /// Number of branches
        branches: usize,
        /// When the event occurred
        timestamp: DateTime<Utc>,
    },

    /// A parallel group emitted its aggregate output
    AggregateEmitted {
        /// Flow id
        flow_id: FlowId,
        /// Group step id
        step_id: StepId,
        /// Number of aggregated entries
        entries: usize,
        /// When the event occurred
        timestamp: DateTime<Utc>,
    },

    /// The flow reached a terminal status
    FlowTerminated {
        /// Flow id
        flow_id: FlowId,
        /// Terminal status
        status: FlowStatus,
        /// When the event occurred
        timestamp: DateTime<Utc>,
    },
}

impl FlowEvent {
    /// Returns the type of the event as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            FlowEvent::FlowStarted { .. } => "flow.started",
            FlowEvent::FlowResumed { .. } => "flow.resumed",
            FlowEvent::StepProcessed { .. } => "step.processed",
            FlowEvent::BranchesSpawned { .. } => "parallel_group.branches_spawned",
            FlowEvent::AggregateEmitted { .. } => "parallel_group.aggregate_emitted",
            FlowEvent::FlowTerminated { .. } => "flow.terminated",
        }
    }

    /// Returns the flow this event is associated with
    pub fn flow_id(&self) -> &FlowId {
        match self {
            FlowEvent::FlowStarted { flow_id, .. }
            | FlowEvent::FlowResumed { flow_id, .. }
            | FlowEvent::StepProcessed { flow_id, .. }
            | FlowEvent::BranchesSpawned { flow_id, .. }
            | FlowEvent::AggregateEmitted { flow_id, .. }
            | FlowEvent::FlowTerminated { flow_id, .. } => flow_id,
        }
    }

    /// Returns the timestamp when the event occurred
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            FlowEvent::FlowStarted { timestamp, .. }
            | FlowEvent::FlowResumed { timestamp, .. }
            | FlowEvent::StepProcessed { timestamp, .. }
            | FlowEvent::BranchesSpawned { timestamp, .. }
            | FlowEvent::AggregateEmitted { timestamp, .. }
            | FlowEvent::FlowTerminated { timestamp, .. } => *timestamp,
        }
    }
}

/// Handler for flow events, invoked after each checkpoint
#[async_trait]
pub trait FlowEventHandler: Send + Sync {
    /// Handle one event
    async fn handle_event(&self, event: FlowEvent) -> Result<(), CoreError>;
}

/// Logs every event at debug level
#[derive(Debug, Default, Clone)]
pub struct TracingEventHandler;

#[async_trait]
impl FlowEventHandler for TracingEventHandler {
    async fn handle_event(&self, event: FlowEvent) -> Result<(), CoreError> {
        debug!(
            event_type = event.event_type(),
            flow_id = %event.flow_id(),
            "Flow event: {:?}",
            event
        );
        Ok(())
    }
}

/// Forwards every event to a tokio channel
#[derive(Debug, Clone)]
pub struct ChannelEventHandler {
    sender: mpsc::UnboundedSender<FlowEvent>,
}

impl ChannelEventHandler {
    /// Create a handler and the receiving end of its channel
    pub fn new() -> (Self, mpsc::UnboundedReceiver<FlowEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl FlowEventHandler for ChannelEventHandler {
    async fn handle_event(&self, event: FlowEvent) -> Result<(), CoreError> {
        // a dropped receiver only means nobody is listening
        if self.sender.send(event).is_err() {
            debug!("Flow event receiver dropped");
        }
        Ok(())
    }
}
