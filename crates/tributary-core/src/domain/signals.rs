//! Durable signals exchanged between running actions and the outside world.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::flow::{FlowId, StepId};
use crate::CoreError;

/// What an action is asking the outside world for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExternalInputKind {
    /// A human answering questions
    HumanInput,
    /// A web page fetched by a client with browser access
    GetUrlsHtmlContent,
    /// Any other request type
    Other(String),
}

/// Emitted by an action that cannot continue without outside input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalInputRequest {
    /// Deterministic request id
    pub request_id: String,
    /// Step that issued the request
    pub step_id: StepId,
    /// Request kind
    pub kind: ExternalInputKind,
    /// Request details
    pub data: serde_json::Value,
}

/// Answers an [`ExternalInputRequest`] with a matching `request_id`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalInputResponse {
    /// Id of the request being answered
    pub request_id: String,
    /// Response kind
    #[serde(rename = "type")]
    pub kind: ExternalInputKind,
    /// Response data
    pub data: serde_json::Value,
}

/// Asks a specific in-flight task to stop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopWorker {
    /// Task to stop, the runtime id of the step running it
    pub task_id: String,
    /// Why the task should stop
    pub explanation: String,
}

/// A durable signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "signal", content = "payload", rename_all = "kebab-case")]
pub enum Signal {
    /// An action asked for input
    ExternalInputRequest(ExternalInputRequest),
    /// Someone answered a request
    ExternalInputResponse(ExternalInputResponse),
    /// Someone asked a task to stop
    StopWorker(StopWorker),
}

/// A signal as stored in a flow's history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalRecord {
    /// Position in the flow's history, starting at 0
    pub sequence: u64,
    /// When the signal was recorded
    pub recorded_at: DateTime<Utc>,
    /// The signal
    pub signal: Signal,
}

/// Append-only, per-flow signal history that survives restarts
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SignalHistory: Send + Sync {
    /// Append a signal and return its sequence number
    async fn append(&self, flow_id: &FlowId, signal: Signal) -> Result<u64, CoreError>;

    /// Every signal recorded for a flow, in recording order
    async fn list(&self, flow_id: &FlowId) -> Result<Vec<SignalRecord>, CoreError>;
}
