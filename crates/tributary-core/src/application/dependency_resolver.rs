use crate::action::ActionRegistry;
use crate::domain::flow::{Flow, FlowStep, StepId};

/// Decides which steps can run.
///
/// Readiness is recomputed from scratch over every unprocessed step each round.
pub struct DependencyResolver<'a> {
    registry: &'a ActionRegistry,
}

impl<'a> DependencyResolver<'a> {
    /// Create a resolver
    pub fn new(registry: &'a ActionRegistry) -> Self {
        Self { registry }
    }

    /// Whether a step's dependencies are satisfied.
    ///
    /// An action step is ready once every input its action declares required is
    /// present. A parallel group is ready once its fan-out input is bound.
    pub fn is_satisfied(&self, step: &FlowStep) -> bool {
        match step {
            FlowStep::Action(step) => match self.registry.definition(&step.action_id) {
                Some(action) => action
                    .inputs
                    .iter()
                    .filter(|input| input.required)
                    .all(|input| step.input(&input.name).is_some()),
                None => false,
            },
            FlowStep::ParallelGroup(group) => group.input_to_parallelize_on.is_some(),
        }
    }

    /// Unprocessed steps whose dependencies are satisfied, in depth-first order
    pub fn ready_steps(&self, flow: &Flow) -> Vec<StepId> {
        flow.all_steps()
            .into_iter()
            .filter(|step| !flow.is_processed(step.step_id()) && self.is_satisfied(step))
            .map(|step| step.step_id().clone())
            .collect()
    }
}
