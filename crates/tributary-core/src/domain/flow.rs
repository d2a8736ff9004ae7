use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

use crate::domain::events::FlowEvent;
use crate::domain::flow_definition::{ActionId, FlowDefinitionId};
use crate::domain::payload::Payload;
use crate::status::StatusCode;
use crate::CoreError;

/// Value object: Flow ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowId(pub String);

impl FlowId {
    /// A fresh random flow id
    pub fn generate() -> Self {
        FlowId(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Value object: Step ID
///
/// Steps created inside a parallel group branch carry the branch indices as
/// `~`-separated suffixes, e.g. `fetch~0` or `summarise~1~3`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StepId(pub String);

impl StepId {
    /// Separator between a definition id and its branch indices
    pub const BRANCH_SEPARATOR: char = '~';

    /// Parse into definition id and branch path
    pub fn address(&self) -> StepAddress {
        StepAddress::of(self)
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StepId {
    fn from(id: &str) -> Self {
        StepId(id.to_string())
    }
}

/// A runtime step id split into its definition id and branch path
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StepAddress {
    /// Definition step id
    pub base: StepId,
    /// Branch index at each enclosing parallel group, outermost first
    pub path: Vec<usize>,
}

impl StepAddress {
    /// Parse a runtime step id. Ids whose suffixes are not numeric are treated as top-level.
    pub fn of(id: &StepId) -> Self {
        let mut parts = id.0.split(StepId::BRANCH_SEPARATOR);
        let base = parts.next().unwrap_or_default();
        let path: Result<Vec<usize>, _> = parts.map(str::parse::<usize>).collect();
        match path {
            Ok(path) => Self {
                base: StepId(base.to_string()),
                path,
            },
            Err(_) => Self {
                base: id.clone(),
                path: Vec::new(),
            },
        }
    }

    /// Runtime id of `base` instantiated at `path`
    pub fn step_id_at(base: &StepId, path: &[usize]) -> StepId {
        let mut id = base.0.clone();
        for index in path {
            id.push(StepId::BRANCH_SEPARATOR);
            id.push_str(&index.to_string());
        }
        StepId(id)
    }

    /// Runtime id of this address
    pub fn step_id(&self) -> StepId {
        Self::step_id_at(&self.base, &self.path)
    }

    /// Whether outputs of this step may flow into `consumer`.
    ///
    /// A producer is visible when its branch path is a prefix of the consumer's,
    /// so outputs never cross between sibling branches.
    pub fn is_visible_from(&self, consumer: &StepAddress) -> bool {
        consumer.path.starts_with(&self.path)
    }

    /// Whether this step sits in a branch directly below `group`
    pub fn is_direct_child_of(&self, group: &StepAddress) -> bool {
        self.path.len() == group.path.len() + 1 && self.path.starts_with(&group.path)
    }

    /// Index within the innermost enclosing branch
    pub fn branch_index(&self) -> Option<usize> {
        self.path.last().copied()
    }
}

/// A named value on a step's input side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepInput {
    /// Input name
    pub input_name: String,
    /// Value
    pub payload: Payload,
}

impl StepInput {
    /// Create an input
    pub fn new(input_name: impl Into<String>, payload: Payload) -> Self {
        Self {
            input_name: input_name.into(),
            payload,
        }
    }
}

/// A named value produced by a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepOutput {
    /// Output name
    pub output_name: String,
    /// Value
    pub payload: Payload,
}

impl StepOutput {
    /// Create an output
    pub fn new(output_name: impl Into<String>, payload: Payload) -> Self {
        Self {
            output_name: output_name.into(),
            payload,
        }
    }
}

/// The event that starts a flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trigger {
    /// Trigger definition this trigger satisfies
    pub trigger_definition_id: String,
    /// Trigger outputs
    #[serde(default)]
    pub outputs: Vec<StepOutput>,
}

impl Trigger {
    /// Look up a trigger output by name
    pub fn output(&self, name: &str) -> Option<&StepOutput> {
        self.outputs.iter().find(|output| output.output_name == name)
    }
}

/// Runtime state of an action step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionStep {
    /// Runtime step id
    pub step_id: StepId,
    /// Action to invoke
    pub action_id: ActionId,
    /// Inputs resolved so far
    #[serde(default)]
    pub inputs: Vec<StepInput>,
    /// Outputs, once the action has completed successfully
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Vec<StepOutput>>,
    /// Invocations made so far
    #[serde(default)]
    pub attempts: u32,
}

impl ActionStep {
    /// Look up a resolved input by name
    pub fn input(&self, name: &str) -> Option<&StepInput> {
        self.inputs.iter().find(|input| input.input_name == name)
    }

    /// Insert or replace an input. Returns whether anything changed.
    pub fn upsert_input(&mut self, input: StepInput) -> bool {
        match self
            .inputs
            .iter_mut()
            .find(|existing| existing.input_name == input.input_name)
        {
            Some(existing) if *existing == input => false,
            Some(existing) => {
                *existing = input;
                true
            }
            None => {
                self.inputs.push(input);
                true
            }
        }
    }

    /// Look up a produced output by name
    pub fn output(&self, name: &str) -> Option<&StepOutput> {
        self.outputs
            .as_ref()?
            .iter()
            .find(|output| output.output_name == name)
    }
}

/// Runtime state of a parallel group step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParallelGroupStep {
    /// Runtime step id
    pub step_id: StepId,
    /// The array to fan out over, once known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_to_parallelize_on: Option<StepInput>,
    /// Branch steps, created when the group is processed
    #[serde(default)]
    pub steps: Vec<FlowStep>,
    /// Collected branch outputs keyed by branch index
    #[serde(default)]
    pub aggregate_contributions: BTreeMap<usize, Payload>,
    /// The aggregate, once every branch has reported
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate_output: Option<StepOutput>,
}

impl ParallelGroupStep {
    /// Number of branches, once the fan-out array is known
    pub fn fan_out_len(&self) -> Option<usize> {
        self.input_to_parallelize_on
            .as_ref()
            .map(|input| input.payload.len())
    }
}

/// A runtime step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum FlowStep {
    /// Invokes an action
    Action(ActionStep),
    /// Fans out over an array
    ParallelGroup(ParallelGroupStep),
}

impl FlowStep {
    /// Runtime step id
    pub fn step_id(&self) -> &StepId {
        match self {
            FlowStep::Action(step) => &step.step_id,
            FlowStep::ParallelGroup(group) => &group.step_id,
        }
    }

    /// Look up a produced output by name. For groups this is the aggregate.
    pub fn output(&self, name: &str) -> Option<&StepOutput> {
        match self {
            FlowStep::Action(step) => step.output(name),
            FlowStep::ParallelGroup(group) => group
                .aggregate_output
                .as_ref()
                .filter(|output| output.output_name == name),
        }
    }
}

/// A failure recorded against one step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepError {
    /// Failing step
    pub step_id: StepId,
    /// Failure code
    pub code: StatusCode,
    /// Failure message
    pub message: String,
}

impl StepError {
    /// Create a step error
    pub fn new(step_id: StepId, code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            step_id,
            code,
            message: message.into(),
        }
    }
}

/// Flow status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowStatus {
    /// Flow is initializing
    Initializing,

    /// Flow is being driven in rounds
    Running,

    /// Every step processed without errors and required outputs present
    Completed,

    /// No step is ready but some remain unprocessed
    Stuck,

    /// Terminated with step errors or missing required outputs
    Failed,

    /// Cancelled before reaching a fixpoint
    Cancelled,
}

impl FlowStatus {
    /// Whether the flow is frozen
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            FlowStatus::Completed | FlowStatus::Stuck | FlowStatus::Failed | FlowStatus::Cancelled
        )
    }
}

/// Aggregate: a live run of a flow definition
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flow {
    /// Unique identifier
    pub flow_id: FlowId,

    /// Definition this flow runs
    pub flow_definition_id: FlowDefinitionId,

    /// Current status
    pub status: FlowStatus,

    /// Trigger that started the flow
    pub trigger: Trigger,

    /// Top-level steps, groups own their branch steps
    pub steps: Vec<FlowStep>,

    /// Steps that will not be executed again
    pub processed_step_ids: BTreeSet<StepId>,

    /// Failures recorded so far
    pub step_errors: Vec<StepError>,

    /// Flow outputs, set at termination
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Vec<StepOutput>>,

    /// Rounds completed
    pub round: u32,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,

    /// Domain events
    #[serde(skip)]
    events: Vec<FlowEvent>,
}

// Domain events are not carried over into clones
impl Clone for Flow {
    fn clone(&self) -> Self {
        Self {
            flow_id: self.flow_id.clone(),
            flow_definition_id: self.flow_definition_id.clone(),
            status: self.status,
            trigger: self.trigger.clone(),
            steps: self.steps.clone(),
            processed_step_ids: self.processed_step_ids.clone(),
            step_errors: self.step_errors.clone(),
            outputs: self.outputs.clone(),
            round: self.round,
            created_at: self.created_at,
            updated_at: self.updated_at,
            events: Vec::new(),
        }
    }
}

impl Flow {
    /// Create a new flow in the initializing state
    pub fn new(
        flow_id: FlowId,
        flow_definition_id: FlowDefinitionId,
        trigger: Trigger,
        steps: Vec<FlowStep>,
    ) -> Self {
        let now = Utc::now();
        let mut flow = Self {
            flow_id: flow_id.clone(),
            flow_definition_id,
            status: FlowStatus::Initializing,
            trigger,
            steps,
            processed_step_ids: BTreeSet::new(),
            step_errors: Vec::new(),
            outputs: None,
            round: 0,
            created_at: now,
            updated_at: now,
            events: Vec::with_capacity(8),
        };
        flow.record_event(FlowEvent::FlowStarted {
            flow_id,
            timestamp: now,
        });
        flow
    }

    /// Move from initializing to running
    pub fn start(&mut self) -> Result<(), CoreError> {
        if self.status != FlowStatus::Initializing {
            return Err(CoreError::FlowExecutionError(format!(
                "Cannot start flow in state: {:?}",
                self.status
            )));
        }
        self.status = FlowStatus::Running;
        self.update_timestamp();
        Ok(())
    }

    /// Record that a persisted flow is being driven again
    pub fn resume(&mut self) -> Result<(), CoreError> {
        if self.status != FlowStatus::Running {
            return Err(CoreError::FlowExecutionError(format!(
                "Cannot resume flow in state: {:?}",
                self.status
            )));
        }
        self.record_event(FlowEvent::FlowResumed {
            flow_id: self.flow_id.clone(),
            round: self.round,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Update the timestamp
    #[inline]
    pub fn update_timestamp(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Look up any step, including branch steps
    pub fn step(&self, step_id: &StepId) -> Option<&FlowStep> {
        fn find<'a>(steps: &'a [FlowStep], id: &StepId) -> Option<&'a FlowStep> {
            for step in steps {
                if step.step_id() == id {
                    return Some(step);
                }
                if let FlowStep::ParallelGroup(group) = step {
                    if let Some(found) = find(&group.steps, id) {
                        return Some(found);
                    }
                }
            }
            None
        }
        find(&self.steps, step_id)
    }

    /// Look up any step mutably, including branch steps
    pub fn step_mut(&mut self, step_id: &StepId) -> Option<&mut FlowStep> {
        fn find<'a>(steps: &'a mut [FlowStep], id: &StepId) -> Option<&'a mut FlowStep> {
            for step in steps.iter_mut() {
                if step.step_id() == id {
                    return Some(step);
                }
                if let FlowStep::ParallelGroup(group) = step {
                    if let Some(found) = find(&mut group.steps, id) {
                        return Some(found);
                    }
                }
            }
            None
        }
        find(&mut self.steps, step_id)
    }

    /// Every step in depth-first order, groups before their branch steps
    pub fn all_steps(&self) -> Vec<&FlowStep> {
        let mut out = Vec::new();
        let mut stack: Vec<&FlowStep> = self.steps.iter().rev().collect();
        while let Some(step) = stack.pop() {
            if let FlowStep::ParallelGroup(group) = step {
                stack.extend(group.steps.iter().rev());
            }
            out.push(step);
        }
        out
    }

    /// Number of steps currently in the flow
    pub fn total_steps(&self) -> usize {
        self.all_steps().len()
    }

    /// Whether a step has been processed
    pub fn is_processed(&self, step_id: &StepId) -> bool {
        self.processed_step_ids.contains(step_id)
    }

    /// Mark a step processed. Returns false if it already was.
    pub fn mark_processed(&mut self, step_id: &StepId, code: StatusCode) -> bool {
        if !self.processed_step_ids.insert(step_id.clone()) {
            return false;
        }
        self.record_event(FlowEvent::StepProcessed {
            flow_id: self.flow_id.clone(),
            step_id: step_id.clone(),
            code,
            timestamp: Utc::now(),
        });
        true
    }

    /// Record a step failure
    pub fn record_step_error(&mut self, error: StepError) {
        self.step_errors.push(error);
    }

    /// Ids of steps with recorded errors, in recording order
    pub fn failed_step_ids(&self) -> Vec<&StepId> {
        let mut ids: Vec<&StepId> = Vec::new();
        for error in &self.step_errors {
            if !ids.contains(&&error.step_id) {
                ids.push(&error.step_id);
            }
        }
        ids
    }

    /// Ids of steps not yet processed, in depth-first order
    pub fn unprocessed_step_ids(&self) -> Vec<&StepId> {
        self.all_steps()
            .into_iter()
            .map(FlowStep::step_id)
            .filter(|id| !self.is_processed(id))
            .collect()
    }

    /// Freeze the flow with a terminal status
    pub fn terminate(&mut self, status: FlowStatus) -> Result<(), CoreError> {
        if !status.is_terminal() {
            return Err(CoreError::FlowExecutionError(format!(
                "{:?} is not a terminal status",
                status
            )));
        }
        if self.status.is_terminal() {
            return Err(CoreError::FlowExecutionError(format!(
                "Cannot terminate flow in state: {:?}",
                self.status
            )));
        }
        self.status = status;
        self.update_timestamp();
        self.record_event(FlowEvent::FlowTerminated {
            flow_id: self.flow_id.clone(),
            status,
            timestamp: self.updated_at,
        });
        Ok(())
    }

    /// Record a domain event
    pub fn record_event(&mut self, event: FlowEvent) {
        self.events.push(event);
    }

    /// Drain recorded domain events
    pub fn take_events(&mut self) -> Vec<FlowEvent> {
        std::mem::take(&mut self.events)
    }
}
