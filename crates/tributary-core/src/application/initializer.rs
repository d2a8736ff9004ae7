//! Builds runtime steps from definitions.
//!
//! Used once per run to build the initial [`Flow`], and again whenever a
//! parallel group's fan-out array becomes known to splice its branch steps in.

use chrono::Utc;
use std::collections::BTreeMap;
use tracing::debug;

use crate::action::ActionRegistry;
use crate::application::plan::{resolve_step_output, FlowPlan};
use crate::domain::events::FlowEvent;
use crate::domain::flow::{
    ActionStep, Flow, FlowId, FlowStep, ParallelGroupStep, StepAddress, StepError, StepId,
    StepInput, Trigger,
};
use crate::domain::flow_definition::{
    ActionStepDefinition, InputSource, ParallelGroupStepDefinition, StepDefinition,
};
use crate::domain::payload::Payload;
use crate::status::StatusCode;
use crate::CoreError;

/// Branch steps created for one parallel group
#[derive(Debug, Clone, PartialEq)]
pub struct Expansion {
    /// New branch steps, cohort by cohort in element order
    pub steps: Vec<FlowStep>,
    /// Steps whose inputs could not be bound, to be recorded and marked processed
    pub errors: Vec<StepError>,
}

/// What an instantiated step may resolve its inputs against
struct Bindings<'a> {
    trigger: &'a Trigger,
    flow: Option<&'a Flow>,
    element: Option<&'a Payload>,
}

/// Instantiates runtime steps from a [`FlowPlan`]
pub struct Initializer<'a> {
    plan: &'a FlowPlan,
    registry: &'a ActionRegistry,
}

impl<'a> Initializer<'a> {
    /// Create an initializer
    pub fn new(plan: &'a FlowPlan, registry: &'a ActionRegistry) -> Self {
        Self { plan, registry }
    }

    /// Build the initial flow for a trigger.
    ///
    /// Trigger and hardcoded inputs are bound immediately, declared defaults
    /// fill inputs without a source, and step-output inputs stay empty.
    pub fn initialize(&self, flow_id: FlowId, trigger: Trigger) -> Result<Flow, CoreError> {
        let definition = self.plan.definition();
        definition.validate_trigger(&trigger)?;

        let mut errors = Vec::new();
        let steps = {
            let bindings = Bindings {
                trigger: &trigger,
                flow: None,
                element: None,
            };
            definition
                .steps
                .iter()
                .map(|step| self.instantiate(step, &[], &bindings, &mut errors))
                .collect()
        };

        let mut flow = Flow::new(
            flow_id,
            definition.flow_definition_id.clone(),
            trigger,
            steps,
        );
        for error in errors {
            flow.mark_processed(&error.step_id, error.code);
            flow.record_step_error(error);
        }
        debug!(
            flow_id = %flow.flow_id,
            steps = flow.total_steps(),
            "Initialized flow"
        );
        Ok(flow)
    }

    /// Instantiate one cohort of the group's nested steps per fan-out element.
    ///
    /// Step-output inputs are resolved against outputs already present in the
    /// flow, including enclosing scopes and finished groups.
    pub fn expand_group(
        &self,
        flow: &Flow,
        group: &ParallelGroupStep,
    ) -> Result<Expansion, CoreError> {
        let address = group.step_id.address();
        let definition = self.plan.index().group(&address.base).ok_or_else(|| {
            CoreError::FlowExecutionError(format!(
                "no parallel group definition for step {}",
                group.step_id
            ))
        })?;
        let fan_out = group.input_to_parallelize_on.as_ref().ok_or_else(|| {
            CoreError::FlowExecutionError(format!(
                "parallel group {} expanded before its input was bound",
                group.step_id
            ))
        })?;

        let mut steps = Vec::new();
        let mut errors = Vec::new();
        for (index, element) in fan_out.payload.elements().iter().enumerate() {
            let mut path = address.path.clone();
            path.push(index);
            let bindings = Bindings {
                trigger: &flow.trigger,
                flow: Some(flow),
                element: Some(element),
            };
            for child in &definition.steps {
                steps.push(self.instantiate(child, &path, &bindings, &mut errors));
            }
        }
        Ok(Expansion { steps, errors })
    }

    /// Expand a group inside `flow`, attach its branch steps and record binding errors
    pub fn splice_group(&self, flow: &mut Flow, group_step_id: &StepId) -> Result<usize, CoreError> {
        let group = match flow.step(group_step_id) {
            Some(FlowStep::ParallelGroup(group)) => group.clone(),
            _ => {
                return Err(CoreError::FlowExecutionError(format!(
                    "{} is not a parallel group",
                    group_step_id
                )))
            }
        };
        let Expansion { steps, errors } = self.expand_group(flow, &group)?;
        let branches = group.fan_out_len().unwrap_or_default();

        if let Some(FlowStep::ParallelGroup(target)) = flow.step_mut(group_step_id) {
            target.steps = steps;
        }
        for error in errors {
            flow.mark_processed(&error.step_id, error.code);
            flow.record_step_error(error);
        }
        flow.record_event(FlowEvent::BranchesSpawned {
            flow_id: flow.flow_id.clone(),
            step_id: group_step_id.clone(),
            branches,
            timestamp: Utc::now(),
        });
        Ok(branches)
    }

    fn instantiate(
        &self,
        definition: &StepDefinition,
        path: &[usize],
        bindings: &Bindings<'_>,
        errors: &mut Vec<StepError>,
    ) -> FlowStep {
        match definition {
            StepDefinition::Action(step) => {
                FlowStep::Action(self.instantiate_action(step, path, bindings, errors))
            }
            StepDefinition::ParallelGroup(group) => {
                FlowStep::ParallelGroup(self.instantiate_group(group, path, bindings))
            }
        }
    }

    fn instantiate_action(
        &self,
        definition: &ActionStepDefinition,
        path: &[usize],
        bindings: &Bindings<'_>,
        errors: &mut Vec<StepError>,
    ) -> ActionStep {
        let step_id = StepAddress::step_id_at(&definition.step_id, path);
        let address = step_id.address();
        let mut step = ActionStep {
            step_id: step_id.clone(),
            action_id: definition.action_id.clone(),
            inputs: Vec::new(),
            outputs: None,
            attempts: 0,
        };

        let Some(action) = self.registry.definition(&definition.action_id) else {
            errors.push(StepError::new(
                step_id,
                StatusCode::NotFound,
                format!("action {} is not registered", definition.action_id),
            ));
            return step;
        };

        for input_source in &definition.input_sources {
            let Some(payload) = resolve(&input_source.source, &address, bindings) else {
                continue;
            };
            let array = action
                .input(&input_source.input_name)
                .map(|input| input.array)
                .unwrap_or(payload.is_array());
            match payload.coerce_to(array) {
                Ok(payload) => {
                    step.upsert_input(StepInput::new(input_source.input_name.clone(), payload));
                }
                Err(e) => errors.push(StepError::new(
                    step_id.clone(),
                    StatusCode::InvalidArgument,
                    format!("input {}: {}", input_source.input_name, e),
                )),
            }
        }

        for input in &action.inputs {
            let bound = definition
                .input_sources
                .iter()
                .any(|source| source.input_name == input.name);
            if let (false, Some(default)) = (bound, &input.default) {
                if let Ok(payload) = default.clone().coerce_to(input.array) {
                    step.upsert_input(StepInput::new(input.name.clone(), payload));
                }
            }
        }

        step
    }

    fn instantiate_group(
        &self,
        definition: &ParallelGroupStepDefinition,
        path: &[usize],
        bindings: &Bindings<'_>,
    ) -> ParallelGroupStep {
        let step_id = StepAddress::step_id_at(&definition.step_id, path);
        let source = &definition.input_source_to_parallelize_on;
        let input_to_parallelize_on = resolve(&source.source, &step_id.address(), bindings)
            .map(|payload| StepInput::new(source.input_name.clone(), payload.wrap_to_array()));

        ParallelGroupStep {
            step_id,
            input_to_parallelize_on,
            steps: Vec::new(),
            aggregate_contributions: BTreeMap::new(),
            aggregate_output: None,
        }
    }
}

fn resolve(source: &InputSource, consumer: &StepAddress, bindings: &Bindings<'_>) -> Option<Payload> {
    match source {
        InputSource::Hardcoded { payload } => Some(payload.clone()),
        InputSource::TriggerOutput {
            trigger_output_name,
        } => bindings
            .trigger
            .output(trigger_output_name)
            .map(|output| output.payload.clone()),
        InputSource::ParallelGroupInput => bindings.element.cloned(),
        InputSource::StepOutput { .. } => {
            bindings.flow.and_then(|flow| resolve_step_output(flow, source, consumer))
        }
    }
}
