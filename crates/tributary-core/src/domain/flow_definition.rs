//! Static flow definitions and their structural validation.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;
use tracing::warn;

use crate::action::ActionRegistry;
use crate::domain::flow::{StepId, Trigger};
use crate::domain::payload::{Payload, PayloadKind, PayloadShape};
use crate::CoreError;

/// Value object: Flow definition ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowDefinitionId(pub String);

impl fmt::Display for FlowDefinitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Value object: Action ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActionId(pub String);

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ActionId {
    fn from(id: &str) -> Self {
        ActionId(id.to_string())
    }
}

/// Where an input's value comes from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum InputSource {
    /// A named output of another step
    #[serde(rename_all = "camelCase")]
    StepOutput {
        /// Producing step
        source_step_id: StepId,
        /// Output name on the producing step
        source_step_output_name: String,
        /// Used when the producing step finishes without this output
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fallback_payload: Option<Payload>,
    },
    /// A named output of the trigger
    #[serde(rename_all = "camelCase")]
    TriggerOutput {
        /// Trigger output name
        trigger_output_name: String,
    },
    /// A literal value
    Hardcoded {
        /// The value
        payload: Payload,
    },
    /// The element a parallel group branch was created for
    ParallelGroupInput,
}

/// Binds one named input to its source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepInputSource {
    /// Input name on the consuming step
    pub input_name: String,
    /// Value source
    pub source: InputSource,
}

/// Declared shape of a named output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputDefinition {
    /// Output name
    pub name: String,
    /// Payload kind
    pub payload_kind: PayloadKind,
    /// Whether the output is an array
    #[serde(default)]
    pub array: bool,
    /// Whether the output must be produced
    #[serde(default)]
    pub required: bool,
}

impl OutputDefinition {
    /// Declared shape
    pub fn shape(&self) -> PayloadShape {
        PayloadShape {
            kind: self.payload_kind,
            array: self.array,
        }
    }
}

/// A step that invokes an action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionStepDefinition {
    /// Step id, unique across the definition tree
    pub step_id: StepId,
    /// Action to invoke
    pub action_id: ActionId,
    /// Input wiring
    #[serde(default)]
    pub input_sources: Vec<StepInputSource>,
    /// Invocation attempts before the step is failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    /// Free-form description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Which child output a parallel group collects
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateOutputDefinition {
    /// Direct child step whose output is collected
    pub step_id: StepId,
    /// Output name on that child
    pub step_output_name: String,
    /// Name of the aggregate output on the group
    pub name: String,
    /// Kind of the collected values
    pub payload_kind: PayloadKind,
}

/// A step that fans out nested steps over an array
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParallelGroupStepDefinition {
    /// Step id, unique across the definition tree
    pub step_id: StepId,
    /// The array to fan out over
    pub input_source_to_parallelize_on: StepInputSource,
    /// Steps instantiated once per array element
    pub steps: Vec<StepDefinition>,
    /// Output collected from every branch
    pub aggregate_output: AggregateOutputDefinition,
}

/// A step definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum StepDefinition {
    /// Invokes an action
    Action(ActionStepDefinition),
    /// Fans out over an array
    ParallelGroup(ParallelGroupStepDefinition),
}

impl StepDefinition {
    /// Step id
    pub fn step_id(&self) -> &StepId {
        match self {
            StepDefinition::Action(step) => &step.step_id,
            StepDefinition::ParallelGroup(group) => &group.step_id,
        }
    }
}

/// Declared outputs of the trigger that starts a flow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerDefinition {
    /// Trigger definition id
    pub trigger_definition_id: String,
    /// Declared outputs
    #[serde(default)]
    pub outputs: Vec<OutputDefinition>,
}

/// A named result of a flow, mapped from a top-level step output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowOutputDefinition {
    /// Flow output name
    pub name: String,
    /// Top-level step producing it
    pub step_id: StepId,
    /// Output name on that step
    pub step_output_name: String,
    /// Payload kind
    pub payload_kind: PayloadKind,
    /// Whether the output is an array
    #[serde(default)]
    pub array: bool,
    /// Whether the run fails without it
    #[serde(default)]
    pub required: bool,
}

/// Aggregate: Flow definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowDefinition {
    /// Unique identifier
    pub flow_definition_id: FlowDefinitionId,
    /// Display name
    pub name: String,
    /// Free-form description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Trigger declaration
    pub trigger: TriggerDefinition,
    /// Top-level steps
    pub steps: Vec<StepDefinition>,
    /// Declared flow outputs
    #[serde(default)]
    pub outputs: Vec<FlowOutputDefinition>,
}

impl FlowDefinition {
    /// Parse a definition from YAML
    pub fn from_yaml(yaml: &str) -> Result<Self, CoreError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Parse a definition from JSON
    pub fn from_json(json: &str) -> Result<Self, CoreError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a definition from a `.json`, `.yaml` or `.yml` file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json(&contents),
            Some("yaml") | Some("yml") => Self::from_yaml(&contents),
            other => Err(CoreError::ConfigurationError(format!(
                "unsupported flow definition extension: {:?}",
                other
            ))),
        }
    }

    /// Check the definition for structural errors against the registered actions.
    ///
    /// All problems found are reported together in one [`CoreError::ValidationError`].
    pub fn validate(&self, registry: &ActionRegistry) -> Result<(), CoreError> {
        let mut issues = Vec::new();

        let mut seen = HashSet::new();
        for (step, _) in walk(&self.steps) {
            let id = step.step_id();
            if id.0.is_empty() {
                issues.push("step id must not be empty".to_string());
            }
            if id.0.contains(StepId::BRANCH_SEPARATOR) {
                issues.push(format!(
                    "step id '{}' must not contain '{}'",
                    id,
                    StepId::BRANCH_SEPARATOR
                ));
            }
            if !seen.insert(id.clone()) {
                issues.push(format!("duplicate step id '{}'", id));
            }
        }

        let index = DefinitionIndex::new(self);
        let validator = Validator {
            definition: self,
            index: &index,
            registry,
        };

        for (step, scope) in walk(&self.steps) {
            match step {
                StepDefinition::Action(action_step) => {
                    validator.check_action_step(action_step, &scope, &mut issues)
                }
                StepDefinition::ParallelGroup(group) => {
                    validator.check_group(group, &scope, &mut issues)
                }
            }
        }

        for output in &self.outputs {
            let produced = index
                .get(&output.step_id)
                .filter(|entry| entry.scope.is_empty())
                .map(|entry| validator.declared_output(&entry.definition, &output.step_output_name));
            match produced {
                None if output.required => issues.push(format!(
                    "required flow output '{}' references unknown top-level step '{}'",
                    output.name, output.step_id
                )),
                None => warn!(
                    output = %output.name,
                    step_id = %output.step_id,
                    "optional flow output references unknown top-level step"
                ),
                Some(None) => issues.push(format!(
                    "flow output '{}' references undeclared output '{}' of step '{}'",
                    output.name, output.step_output_name, output.step_id
                )),
                Some(Some(_)) => {}
            }
        }

        if let Some(step_id) = index.find_cycle() {
            issues.push(format!("dependency cycle through step '{}'", step_id));
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(CoreError::ValidationError(issues.join("; ")))
        }
    }

    /// Check a trigger against the declared trigger outputs
    pub fn validate_trigger(&self, trigger: &Trigger) -> Result<(), CoreError> {
        let mut issues = Vec::new();
        if trigger.trigger_definition_id != self.trigger.trigger_definition_id {
            issues.push(format!(
                "trigger '{}' does not match definition trigger '{}'",
                trigger.trigger_definition_id, self.trigger.trigger_definition_id
            ));
        }
        for output in &trigger.outputs {
            match self
                .trigger
                .outputs
                .iter()
                .find(|declared| declared.name == output.output_name)
            {
                None => issues.push(format!("undeclared trigger output '{}'", output.output_name)),
                Some(declared) => {
                    if declared.payload_kind != output.payload.kind() {
                        issues.push(format!(
                            "trigger output '{}' is {} but {} was declared",
                            output.output_name,
                            output.payload.kind(),
                            declared.payload_kind
                        ));
                    } else if output.payload.is_array() && !declared.array {
                        issues.push(format!(
                            "trigger output '{}' is an array but a single value was declared",
                            output.output_name
                        ));
                    }
                }
            }
        }
        for declared in self.trigger.outputs.iter().filter(|d| d.required) {
            if !trigger.outputs.iter().any(|o| o.output_name == declared.name) {
                issues.push(format!("missing required trigger output '{}'", declared.name));
            }
        }
        for (step, _) in walk(&self.steps) {
            let StepDefinition::ParallelGroup(group) = step else {
                continue;
            };
            if let InputSource::TriggerOutput { trigger_output_name } =
                &group.input_source_to_parallelize_on.source
            {
                if trigger.output(trigger_output_name).is_none() {
                    issues.push(format!(
                        "parallel group '{}' fans out on trigger output '{}' which the trigger does not supply",
                        group.step_id, trigger_output_name
                    ));
                }
            }
        }
        if issues.is_empty() {
            Ok(())
        } else {
            Err(CoreError::ValidationError(issues.join("; ")))
        }
    }
}

/// Depth-first walk over a definition tree, yielding each step with its enclosing group ids
fn walk(steps: &[StepDefinition]) -> Vec<(&StepDefinition, Vec<StepId>)> {
    let mut out = Vec::new();
    let mut stack: Vec<(&StepDefinition, Vec<StepId>)> =
        steps.iter().rev().map(|step| (step, Vec::new())).collect();
    while let Some((step, scope)) = stack.pop() {
        if let StepDefinition::ParallelGroup(group) = step {
            let mut inner = scope.clone();
            inner.push(group.step_id.clone());
            stack.extend(group.steps.iter().rev().map(|child| (child, inner.clone())));
        }
        out.push((step, scope));
    }
    out
}

struct Validator<'a> {
    definition: &'a FlowDefinition,
    index: &'a DefinitionIndex,
    registry: &'a ActionRegistry,
}

impl Validator<'_> {
    fn declared_output(&self, step: &StepDefinition, name: &str) -> Option<PayloadShape> {
        match step {
            StepDefinition::Action(action_step) => self
                .registry
                .definition(&action_step.action_id)?
                .outputs
                .iter()
                .find(|output| output.name == name)
                .map(OutputDefinition::shape),
            StepDefinition::ParallelGroup(group) => (group.aggregate_output.name == name)
                .then_some(PayloadShape {
                    kind: group.aggregate_output.payload_kind,
                    array: true,
                }),
        }
    }

    /// Statically known shape of a source as seen from `scope`, or an issue.
    /// `Ok(None)` means the shape cannot be known before execution.
    fn source_shape(
        &self,
        source: &InputSource,
        scope: &[StepId],
        consumer: &StepId,
    ) -> Result<Option<PayloadShape>, String> {
        match source {
            InputSource::StepOutput {
                source_step_id,
                source_step_output_name,
                ..
            } => {
                let entry = self.index.get(source_step_id).ok_or_else(|| {
                    format!("step '{}' references unknown step '{}'", consumer, source_step_id)
                })?;
                if source_step_id == consumer {
                    return Err(format!("step '{}' references itself", consumer));
                }
                if !scope.starts_with(&entry.scope) {
                    return Err(format!(
                        "step '{}' references step '{}' which is not visible from its scope",
                        consumer, source_step_id
                    ));
                }
                match self.declared_output(&entry.definition, source_step_output_name) {
                    Some(shape) => Ok(Some(shape)),
                    // an unregistered action is reported on its own step
                    None if matches!(
                        &entry.definition,
                        StepDefinition::Action(a) if self.registry.definition(&a.action_id).is_none()
                    ) =>
                    {
                        Ok(None)
                    }
                    None => Err(format!(
                        "step '{}' references undeclared output '{}' of step '{}'",
                        consumer, source_step_output_name, source_step_id
                    )),
                }
            }
            InputSource::TriggerOutput {
                trigger_output_name,
            } => self
                .definition
                .trigger
                .outputs
                .iter()
                .find(|output| &output.name == trigger_output_name)
                .map(|output| Some(output.shape()))
                .ok_or_else(|| {
                    format!(
                        "step '{}' references unknown trigger output '{}'",
                        consumer, trigger_output_name
                    )
                }),
            InputSource::Hardcoded { payload } => Ok(Some(payload.shape())),
            InputSource::ParallelGroupInput => {
                let (group_id, outer) = scope.split_last().ok_or_else(|| {
                    format!(
                        "step '{}' uses a parallel group input outside a parallel group",
                        consumer
                    )
                })?;
                let group = self.index.group(group_id).ok_or_else(|| {
                    format!("step '{}' is nested in unknown group '{}'", consumer, group_id)
                })?;
                let fan_out = self.source_shape(
                    &group.input_source_to_parallelize_on.source,
                    outer,
                    group_id,
                );
                // the group reports its own fan-out problems
                Ok(fan_out.ok().flatten().map(|shape| PayloadShape {
                    kind: shape.kind,
                    array: false,
                }))
            }
        }
    }

    fn check_action_step(
        &self,
        step: &ActionStepDefinition,
        scope: &[StepId],
        issues: &mut Vec<String>,
    ) {
        if step.max_attempts == Some(0) {
            issues.push(format!("step '{}' must allow at least one attempt", step.step_id));
        }
        let Some(action) = self.registry.definition(&step.action_id) else {
            issues.push(format!(
                "step '{}' uses unknown action '{}'",
                step.step_id, step.action_id
            ));
            return;
        };

        let mut bound = HashSet::new();
        for input_source in &step.input_sources {
            if !bound.insert(input_source.input_name.as_str()) {
                issues.push(format!(
                    "step '{}' binds input '{}' more than once",
                    step.step_id, input_source.input_name
                ));
            }
            let Some(input) = action
                .inputs
                .iter()
                .find(|input| input.name == input_source.input_name)
            else {
                issues.push(format!(
                    "step '{}' binds input '{}' which action '{}' does not declare",
                    step.step_id, input_source.input_name, step.action_id
                ));
                continue;
            };
            match self.source_shape(&input_source.source, scope, &step.step_id) {
                Err(issue) => issues.push(issue),
                Ok(None) => {}
                Ok(Some(shape)) => {
                    if !input.accepts(shape.kind) {
                        issues.push(format!(
                            "step '{}' input '{}' does not accept {}",
                            step.step_id, input.name, shape.kind
                        ));
                    }
                    if shape.array && !input.array {
                        issues.push(format!(
                            "step '{}' input '{}' expects a single value but receives {}",
                            step.step_id, input.name, shape
                        ));
                    }
                }
            }
        }
    }

    fn check_group(
        &self,
        group: &ParallelGroupStepDefinition,
        scope: &[StepId],
        issues: &mut Vec<String>,
    ) {
        match self.source_shape(
            &group.input_source_to_parallelize_on.source,
            scope,
            &group.step_id,
        ) {
            Err(issue) => issues.push(issue),
            Ok(Some(shape)) if !shape.array => issues.push(format!(
                "parallel group '{}' cannot fan out over a single {}",
                group.step_id, shape.kind
            )),
            Ok(None)
                if matches!(
                    group.input_source_to_parallelize_on.source,
                    InputSource::ParallelGroupInput
                ) =>
            {
                issues.push(format!(
                    "parallel group '{}' cannot fan out over a single branch element",
                    group.step_id
                ))
            }
            Ok(_) => {}
        }

        let aggregate = &group.aggregate_output;
        match group
            .steps
            .iter()
            .find(|child| child.step_id() == &aggregate.step_id)
        {
            None => issues.push(format!(
                "parallel group '{}' aggregates '{}' which is not one of its direct steps",
                group.step_id, aggregate.step_id
            )),
            Some(child) => match self.declared_output(child, &aggregate.step_output_name) {
                Some(shape) if shape.kind != aggregate.payload_kind => issues.push(format!(
                    "parallel group '{}' aggregates {} but '{}.{}' is {}",
                    group.step_id,
                    aggregate.payload_kind,
                    aggregate.step_id,
                    aggregate.step_output_name,
                    shape.kind
                )),
                Some(_) => {}
                None => {
                    if !matches!(
                        child,
                        StepDefinition::Action(a) if self.registry.definition(&a.action_id).is_none()
                    ) {
                        issues.push(format!(
                            "parallel group '{}' aggregates undeclared output '{}' of step '{}'",
                            group.step_id, aggregate.step_output_name, aggregate.step_id
                        ))
                    }
                }
            },
        }
    }
}

/// A definition step together with the ids of the groups enclosing it
#[derive(Debug, Clone)]
pub struct IndexedStep {
    /// The step definition
    pub definition: StepDefinition,
    /// Enclosing parallel group ids, outermost first
    pub scope: Vec<StepId>,
}

/// Lookup of definition steps by id across the whole tree
#[derive(Debug, Clone, Default)]
pub struct DefinitionIndex {
    steps: HashMap<StepId, IndexedStep>,
}

impl DefinitionIndex {
    /// Index every step of a definition. The first of duplicate ids wins.
    pub fn new(definition: &FlowDefinition) -> Self {
        let mut steps = HashMap::new();
        for (step, scope) in walk(&definition.steps) {
            steps
                .entry(step.step_id().clone())
                .or_insert_with(|| IndexedStep {
                    definition: step.clone(),
                    scope,
                });
        }
        Self { steps }
    }

    /// Look up a step by definition id
    pub fn get(&self, step_id: &StepId) -> Option<&IndexedStep> {
        self.steps.get(step_id)
    }

    /// Look up an action step by definition id
    pub fn action(&self, step_id: &StepId) -> Option<&ActionStepDefinition> {
        match &self.steps.get(step_id)?.definition {
            StepDefinition::Action(step) => Some(step),
            StepDefinition::ParallelGroup(_) => None,
        }
    }

    /// Look up a parallel group by definition id
    pub fn group(&self, step_id: &StepId) -> Option<&ParallelGroupStepDefinition> {
        match &self.steps.get(step_id)?.definition {
            StepDefinition::ParallelGroup(group) => Some(group),
            StepDefinition::Action(_) => None,
        }
    }

    /// Steps this step cannot complete without
    fn dependencies<'a>(&self, step: &'a StepDefinition) -> Vec<&'a StepId> {
        fn source_step(source: &InputSource) -> Option<&StepId> {
            match source {
                InputSource::StepOutput { source_step_id, .. } => Some(source_step_id),
                _ => None,
            }
        }
        match step {
            StepDefinition::Action(action_step) => action_step
                .input_sources
                .iter()
                .filter_map(|input| source_step(&input.source))
                .collect(),
            StepDefinition::ParallelGroup(group) => {
                source_step(&group.input_source_to_parallelize_on.source)
                    .into_iter()
                    .chain(group.steps.iter().map(StepDefinition::step_id))
                    .collect()
            }
        }
    }

    /// Id of a step on a dependency cycle, if any
    pub fn find_cycle(&self) -> Option<StepId> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        let mut marks: HashMap<&StepId, Mark> = HashMap::new();
        let mut roots: Vec<&StepId> = self.steps.keys().collect();
        roots.sort();

        for root in roots {
            if marks.contains_key(root) {
                continue;
            }
            // (step, whether its dependencies were already pushed)
            let mut stack = vec![(root, false)];
            while let Some((id, expanded)) = stack.pop() {
                if expanded {
                    marks.insert(id, Mark::Done);
                    continue;
                }
                match marks.get(id) {
                    Some(Mark::Done) => continue,
                    Some(Mark::Visiting) => return Some(id.clone()),
                    None => {}
                }
                marks.insert(id, Mark::Visiting);
                stack.push((id, true));
                if let Some(entry) = self.steps.get(id) {
                    for dependency in self.dependencies(&entry.definition) {
                        match marks.get(dependency) {
                            Some(Mark::Visiting) => return Some(dependency.clone()),
                            Some(Mark::Done) => {}
                            None if self.steps.contains_key(dependency) => {
                                stack.push((dependency, false))
                            }
                            None => {}
                        }
                    }
                }
            }
        }
        None
    }
}
