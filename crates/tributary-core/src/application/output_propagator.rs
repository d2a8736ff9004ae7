//! Wires finished steps' outputs into the steps that consume them.

use chrono::Utc;
use std::collections::VecDeque;
use tracing::{debug, warn};

use crate::action::ActionRegistry;
use crate::application::plan::FlowPlan;
use crate::domain::events::FlowEvent;
use crate::domain::flow::{Flow, FlowStep, StepAddress, StepError, StepId, StepInput, StepOutput};
use crate::domain::flow_definition::InputSource;
use crate::domain::payload::Payload;
use crate::status::StatusCode;

/// Propagates outputs through a flow with an explicit worklist.
///
/// Applying the same outputs twice leaves the flow unchanged.
pub struct OutputPropagator<'a> {
    plan: &'a FlowPlan,
    registry: &'a ActionRegistry,
}

/// What a step-output source yields for a given producer
fn pick(
    source: &InputSource,
    outputs: &[StepOutput],
    producer_is_action: bool,
) -> Option<Payload> {
    let InputSource::StepOutput {
        source_step_output_name,
        fallback_payload,
        ..
    } = source
    else {
        return None;
    };
    outputs
        .iter()
        .find(|output| &output.output_name == source_step_output_name)
        .map(|output| output.payload.clone())
        .or_else(|| {
            if producer_is_action {
                fallback_payload.clone()
            } else {
                None
            }
        })
}

fn references(source: &InputSource, base: &StepId) -> bool {
    matches!(source, InputSource::StepOutput { source_step_id, .. } if source_step_id == base)
}

impl<'a> OutputPropagator<'a> {
    /// Create a propagator
    pub fn new(plan: &'a FlowPlan, registry: &'a ActionRegistry) -> Self {
        Self { plan, registry }
    }

    /// Propagate the outputs of a processed step.
    ///
    /// `outputs` is empty for a step that finished without outputs, which lets
    /// fallback payloads flow to its consumers.
    pub fn propagate(&self, flow: &mut Flow, source: &StepId, outputs: Vec<StepOutput>) {
        let mut worklist = VecDeque::from([(source.clone(), outputs)]);
        while let Some((source, outputs)) = worklist.pop_front() {
            self.propagate_one(flow, &source, &outputs, &mut worklist);
        }
    }

    /// Emit a processed group's aggregate if every branch has reported, then propagate it.
    ///
    /// Used right after expansion so that a group with no branches completes.
    pub fn settle_group(&self, flow: &mut Flow, group_id: &StepId) {
        if let Some(aggregate) = self.try_emit_aggregate(flow, group_id) {
            self.propagate(flow, group_id, vec![aggregate]);
        }
    }

    fn propagate_one(
        &self,
        flow: &mut Flow,
        source: &StepId,
        outputs: &[StepOutput],
        worklist: &mut VecDeque<(StepId, Vec<StepOutput>)>,
    ) {
        let source_address = source.address();
        let producer_is_action = matches!(flow.step(source), Some(FlowStep::Action(_)));
        let targets: Vec<(StepId, bool, bool)> = flow
            .all_steps()
            .into_iter()
            .map(|step| {
                let id = step.step_id().clone();
                let processed = flow.is_processed(&id);
                (id, processed, matches!(step, FlowStep::ParallelGroup(_)))
            })
            .collect();

        for (target_id, processed, is_group) in targets {
            let target_address = target_id.address();
            match (is_group, processed) {
                (false, false) => {
                    if let Some(failed) = self.feed_action(
                        flow,
                        &target_id,
                        &target_address,
                        &source_address,
                        outputs,
                        producer_is_action,
                    ) {
                        worklist.push_back((failed, Vec::new()));
                    }
                }
                (true, false) => self.bind_fan_out(
                    flow,
                    &target_id,
                    &target_address,
                    &source_address,
                    outputs,
                    producer_is_action,
                ),
                (true, true) => {
                    if self.contribute(flow, &target_id, &target_address, &source_address, outputs) {
                        if let Some(aggregate) = self.try_emit_aggregate(flow, &target_id) {
                            worklist.push_back((target_id, vec![aggregate]));
                        }
                    }
                }
                (false, true) => {}
            }
        }
    }

    /// Copy matching outputs into an unprocessed action step's inputs.
    /// Returns the step id if the step failed on a shape mismatch.
    fn feed_action(
        &self,
        flow: &mut Flow,
        target_id: &StepId,
        target_address: &StepAddress,
        source_address: &StepAddress,
        outputs: &[StepOutput],
        producer_is_action: bool,
    ) -> Option<StepId> {
        if !source_address.is_visible_from(target_address) {
            return None;
        }
        let definition = self.plan.index().action(&target_address.base)?;
        let action = self.registry.definition(&definition.action_id)?;

        let mut updates = Vec::new();
        let mut failure = None;
        for input_source in definition
            .input_sources
            .iter()
            .filter(|input| references(&input.source, &source_address.base))
        {
            let Some(payload) = pick(&input_source.source, outputs, producer_is_action) else {
                continue;
            };
            let array = action
                .input(&input_source.input_name)
                .map(|input| input.array)
                .unwrap_or(payload.is_array());
            match payload.coerce_to(array) {
                Ok(payload) => updates.push(StepInput::new(input_source.input_name.clone(), payload)),
                Err(e) => {
                    failure = Some(format!("input {}: {}", input_source.input_name, e));
                    break;
                }
            }
        }

        if let Some(message) = failure {
            warn!(
                flow_id = %flow.flow_id,
                step_id = %target_id,
                "Rejecting input: {}",
                message
            );
            flow.mark_processed(target_id, StatusCode::InvalidArgument);
            flow.record_step_error(StepError::new(
                target_id.clone(),
                StatusCode::InvalidArgument,
                message,
            ));
            return Some(target_id.clone());
        }

        if let Some(FlowStep::Action(step)) = flow.step_mut(target_id) {
            for input in updates {
                if step.upsert_input(input) {
                    debug!(step_id = %target_id, from = %source_address.step_id(), "Bound input");
                }
            }
        }
        None
    }

    /// Bind an unprocessed group's fan-out array
    fn bind_fan_out(
        &self,
        flow: &mut Flow,
        target_id: &StepId,
        target_address: &StepAddress,
        source_address: &StepAddress,
        outputs: &[StepOutput],
        producer_is_action: bool,
    ) {
        if !source_address.is_visible_from(target_address) {
            return;
        }
        let Some(definition) = self.plan.index().group(&target_address.base) else {
            return;
        };
        let source = &definition.input_source_to_parallelize_on;
        if !references(&source.source, &source_address.base) {
            return;
        }
        let Some(payload) = pick(&source.source, outputs, producer_is_action) else {
            return;
        };
        if let Some(FlowStep::ParallelGroup(group)) = flow.step_mut(target_id) {
            if group.input_to_parallelize_on.is_none() {
                group.input_to_parallelize_on =
                    Some(StepInput::new(source.input_name.clone(), payload.wrap_to_array()));
            }
        }
    }

    /// Record a branch's contribution to a processed group's aggregate.
    /// Returns whether a contribution was added.
    fn contribute(
        &self,
        flow: &mut Flow,
        group_id: &StepId,
        group_address: &StepAddress,
        source_address: &StepAddress,
        outputs: &[StepOutput],
    ) -> bool {
        let Some(definition) = self.plan.index().group(&group_address.base) else {
            return false;
        };
        let aggregate = &definition.aggregate_output;
        if source_address.base != aggregate.step_id || !source_address.is_direct_child_of(group_address) {
            return false;
        }
        let (Some(index), Some(output)) = (
            source_address.branch_index(),
            outputs
                .iter()
                .find(|output| output.output_name == aggregate.step_output_name),
        ) else {
            return false;
        };
        match flow.step_mut(group_id) {
            Some(FlowStep::ParallelGroup(group)) if !group.aggregate_contributions.contains_key(&index) => {
                group
                    .aggregate_contributions
                    .insert(index, output.payload.clone());
                true
            }
            _ => false,
        }
    }

    /// Emit the aggregate once contributions cover every branch
    fn try_emit_aggregate(&self, flow: &mut Flow, group_id: &StepId) -> Option<StepOutput> {
        let definition = self.plan.index().group(&group_id.address().base)?;
        let aggregate = &definition.aggregate_output;
        let FlowStep::ParallelGroup(group) = flow.step(group_id)? else {
            return None;
        };
        let expected = group.fan_out_len()?;
        if group.aggregate_output.is_some() || group.aggregate_contributions.len() < expected {
            return None;
        }

        let merged = Payload::concat(
            aggregate.payload_kind,
            group.aggregate_contributions.values().cloned(),
        );
        match merged {
            Ok(payload) => {
                let entries = payload.len();
                let output = StepOutput::new(aggregate.name.clone(), payload);
                if let Some(FlowStep::ParallelGroup(group)) = flow.step_mut(group_id) {
                    group.aggregate_output = Some(output.clone());
                }
                debug!(flow_id = %flow.flow_id, step_id = %group_id, entries, "Emitted aggregate");
                flow.record_event(FlowEvent::AggregateEmitted {
                    flow_id: flow.flow_id.clone(),
                    step_id: group_id.clone(),
                    entries,
                    timestamp: Utc::now(),
                });
                Some(output)
            }
            Err(_) if flow.step_errors.iter().any(|error| &error.step_id == group_id) => None,
            Err(e) => {
                warn!(flow_id = %flow.flow_id, step_id = %group_id, "Cannot aggregate: {}", e);
                flow.record_step_error(StepError::new(
                    group_id.clone(),
                    StatusCode::InvalidArgument,
                    e.to_string(),
                ));
                None
            }
        }
    }
}
