use crate::action::ActionRegistry;
use crate::domain::flow::{Flow, FlowStep, StepAddress, StepId};
use crate::domain::flow_definition::{DefinitionIndex, FlowDefinition, InputSource};
use crate::domain::payload::Payload;
use crate::CoreError;

/// A validated flow definition together with its step index
#[derive(Debug, Clone)]
pub struct FlowPlan {
    definition: FlowDefinition,
    index: DefinitionIndex,
}

impl FlowPlan {
    /// Validate a definition against the registry and index it
    pub fn new(definition: FlowDefinition, registry: &ActionRegistry) -> Result<Self, CoreError> {
        definition.validate(registry)?;
        let index = DefinitionIndex::new(&definition);
        Ok(Self { definition, index })
    }

    /// The definition
    pub fn definition(&self) -> &FlowDefinition {
        &self.definition
    }

    /// The step index
    pub fn index(&self) -> &DefinitionIndex {
        &self.index
    }
}

/// The processed step visible from `consumer` whose definition id is `base`
pub(crate) fn visible_producer<'a>(
    flow: &'a Flow,
    base: &StepId,
    consumer: &StepAddress,
) -> Option<&'a FlowStep> {
    flow.all_steps().into_iter().find(|step| {
        let address = step.step_id().address();
        &address.base == base
            && address.is_visible_from(consumer)
            && flow.is_processed(step.step_id())
    })
}

/// Current value of a step-output source as seen from `consumer`.
///
/// `None` while the producer has not finished. A finished action step without
/// the output yields the source's fallback payload, if any. Parallel groups
/// only ever yield their aggregate.
pub(crate) fn resolve_step_output(
    flow: &Flow,
    source: &InputSource,
    consumer: &StepAddress,
) -> Option<Payload> {
    let InputSource::StepOutput {
        source_step_id,
        source_step_output_name,
        fallback_payload,
    } = source
    else {
        return None;
    };
    match visible_producer(flow, source_step_id, consumer)? {
        FlowStep::Action(step) => step
            .output(source_step_output_name)
            .map(|output| output.payload.clone())
            .or_else(|| fallback_payload.clone()),
        group @ FlowStep::ParallelGroup(_) => group
            .output(source_step_output_name)
            .map(|output| output.payload.clone()),
    }
}
