//! The contract between the scheduler and the actions it invokes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::application::external_io::ExternalIoBridge;
use crate::domain::flow::{FlowId, StepId, StepInput, StepOutput};
use crate::domain::flow_definition::{ActionId, OutputDefinition};
use crate::domain::payload::{Payload, PayloadKind};
use crate::domain::signals::{ExternalInputKind, ExternalInputRequest, ExternalInputResponse};
use crate::status::Status;
use crate::CoreError;

/// Declared input of an action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputDefinition {
    /// Input name
    pub name: String,
    /// Accepted kinds, empty accepts any
    #[serde(default)]
    pub one_of_payload_kinds: Vec<PayloadKind>,
    /// Whether the input is an array
    #[serde(default)]
    pub array: bool,
    /// Whether the step cannot run without it
    #[serde(default)]
    pub required: bool,
    /// Applied when a step gives the input no source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Payload>,
}

impl InputDefinition {
    /// A required input
    pub fn required(name: impl Into<String>, kind: PayloadKind, array: bool) -> Self {
        Self {
            name: name.into(),
            one_of_payload_kinds: vec![kind],
            array,
            required: true,
            default: None,
        }
    }

    /// An optional input
    pub fn optional(name: impl Into<String>, kind: PayloadKind, array: bool) -> Self {
        Self {
            required: false,
            ..Self::required(name, kind, array)
        }
    }

    /// Set the default value
    pub fn with_default(mut self, payload: Payload) -> Self {
        self.default = Some(payload);
        self
    }

    /// Whether a payload of `kind` may be bound to this input
    pub fn accepts(&self, kind: PayloadKind) -> bool {
        self.one_of_payload_kinds.is_empty() || self.one_of_payload_kinds.contains(&kind)
    }
}

/// Declared contract of an action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionDefinition {
    /// Action id
    pub action_id: ActionId,
    /// Display name
    pub name: String,
    /// Declared inputs
    #[serde(default)]
    pub inputs: Vec<InputDefinition>,
    /// Declared outputs
    #[serde(default)]
    pub outputs: Vec<OutputDefinition>,
}

impl ActionDefinition {
    /// Look up a declared input
    pub fn input(&self, name: &str) -> Option<&InputDefinition> {
        self.inputs.iter().find(|input| input.name == name)
    }
}

/// What a successful action returns
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionOutputs {
    /// Produced outputs
    pub outputs: Vec<StepOutput>,
}

impl ActionOutputs {
    /// Wrap a list of outputs
    pub fn new(outputs: Vec<StepOutput>) -> Self {
        Self { outputs }
    }
}

/// Handle given to an action for the duration of one invocation
#[derive(Clone)]
pub struct ActionContext {
    flow_id: FlowId,
    step_id: StepId,
    attempt: u32,
    cancel: CancellationToken,
    bridge: Arc<ExternalIoBridge>,
    sequence: Arc<AtomicU32>,
}

impl fmt::Debug for ActionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionContext")
            .field("flow_id", &self.flow_id)
            .field("step_id", &self.step_id)
            .field("attempt", &self.attempt)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl ActionContext {
    /// Create a context for one invocation
    pub fn new(
        flow_id: FlowId,
        step_id: StepId,
        attempt: u32,
        cancel: CancellationToken,
        bridge: Arc<ExternalIoBridge>,
    ) -> Self {
        Self {
            flow_id,
            step_id,
            attempt,
            cancel,
            bridge,
            sequence: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Flow being run
    pub fn flow_id(&self) -> &FlowId {
        &self.flow_id
    }

    /// Step being run
    pub fn step_id(&self) -> &StepId {
        &self.step_id
    }

    /// 1-based attempt number
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Token cancelled when this task is asked to stop
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether this task has been asked to stop
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once this task is asked to stop
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Safe point: fail with [`CoreError::Cancelled`] if a stop was requested,
    /// including one recorded before this process started
    pub async fn check_stop(&self) -> Result<(), CoreError> {
        if self.cancel.is_cancelled() {
            return Err(CoreError::Cancelled(format!("task {} was stopped", self.step_id)));
        }
        if let Some(stop) = self
            .bridge
            .stop_request(&self.flow_id, &self.step_id.0)
            .await?
        {
            self.cancel.cancel();
            return Err(CoreError::Cancelled(stop.explanation));
        }
        Ok(())
    }

    /// Ask the outside world for input and wait until it is answered.
    ///
    /// The request id is derived from the flow, the step and the number of
    /// requests made so far in this invocation, so a replayed invocation
    /// waits on its earlier request instead of issuing a new one.
    pub async fn request_external_input(
        &self,
        kind: ExternalInputKind,
        data: serde_json::Value,
    ) -> Result<ExternalInputResponse, CoreError> {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let request = ExternalInputRequest {
            request_id: ExternalIoBridge::request_id(&self.flow_id, &self.step_id, sequence),
            step_id: self.step_id.clone(),
            kind,
            data,
        };
        self.bridge
            .request_input(&self.flow_id, request, &self.cancel)
            .await
    }
}

/// An opaque unit of work invoked by action steps
#[async_trait]
pub trait Action: Send + Sync {
    /// Declared contract
    fn definition(&self) -> &ActionDefinition;

    /// Run the action. A non-Ok status fails the step.
    async fn execute(&self, inputs: Vec<StepInput>, ctx: ActionContext) -> Status<ActionOutputs>;
}

/// An action backed by an async closure
pub struct FnAction<F> {
    definition: ActionDefinition,
    handler: F,
}

impl<F> FnAction<F> {
    /// Create an action from its definition and handler
    pub fn new(definition: ActionDefinition, handler: F) -> Self {
        Self {
            definition,
            handler,
        }
    }
}

#[async_trait]
impl<F, Fut> Action for FnAction<F>
where
    F: Fn(Vec<StepInput>, ActionContext) -> Fut + Send + Sync,
    Fut: Future<Output = Status<ActionOutputs>> + Send,
{
    fn definition(&self) -> &ActionDefinition {
        &self.definition
    }

    async fn execute(&self, inputs: Vec<StepInput>, ctx: ActionContext) -> Status<ActionOutputs> {
        (self.handler)(inputs, ctx).await
    }
}

/// Actions available to a scheduler, keyed by id
#[derive(Clone, Default)]
pub struct ActionRegistry {
    actions: HashMap<ActionId, Arc<dyn Action>>,
}

impl fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<&ActionId> = self.actions.keys().collect();
        ids.sort();
        f.debug_struct("ActionRegistry").field("actions", &ids).finish()
    }
}

impl ActionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an action under its declared id, replacing any earlier one
    pub fn register(&mut self, action: Arc<dyn Action>) -> &mut Self {
        let action_id = action.definition().action_id.clone();
        if self.actions.insert(action_id.clone(), action).is_some() {
            warn!(action_id = %action_id, "Replacing registered action");
        }
        self
    }

    /// Builder-style registration
    pub fn with(mut self, action: impl Action + 'static) -> Self {
        self.register(Arc::new(action));
        self
    }

    /// Look up an action
    pub fn get(&self, action_id: &ActionId) -> Option<Arc<dyn Action>> {
        self.actions.get(action_id).cloned()
    }

    /// Look up an action's declared contract
    pub fn definition(&self, action_id: &ActionId) -> Option<&ActionDefinition> {
        self.actions.get(action_id).map(|action| action.definition())
    }

    /// Number of registered actions
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Whether no action is registered
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}
