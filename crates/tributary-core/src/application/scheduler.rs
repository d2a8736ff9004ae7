//! The round-based scheduler loop.
//!
//! Each round computes the ready set from the checkpointed flow, runs every
//! ready action concurrently, expands ready parallel groups, folds the results
//! back in and checkpoints again. The loop stops at the first round with an
//! empty ready set and classifies the outcome.

use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::application::context::SchedulerContext;
use crate::application::dependency_resolver::DependencyResolver;
use crate::application::initializer::Initializer;
use crate::application::output_propagator::OutputPropagator;
use crate::application::plan::FlowPlan;
use crate::application::step_processor::StepProcessor;
use crate::domain::flow::{Flow, FlowId, FlowStatus, FlowStep, StepError, StepId, StepOutput, Trigger};
use crate::domain::flow_definition::FlowDefinition;
use crate::domain::signals::{ExternalInputRequest, ExternalInputResponse, StopWorker};
use crate::metrics::{names, MetricType};
use crate::status::{Status, StatusCode};
use crate::CoreError;

/// What a finished run hands back
#[derive(Debug, Clone)]
pub struct FlowRunReport {
    /// Final flow state
    pub flow: Flow,
    /// Declared flow outputs that were produced
    pub outputs: Vec<StepOutput>,
    /// Every step failure recorded during the run
    pub step_errors: Vec<StepError>,
}

impl FlowRunReport {
    fn of(flow: Flow) -> Self {
        Self {
            outputs: flow.outputs.clone().unwrap_or_default(),
            step_errors: flow.step_errors.clone(),
            flow,
        }
    }

    /// A produced flow output by name
    pub fn output(&self, name: &str) -> Option<&StepOutput> {
        self.outputs.iter().find(|output| output.output_name == name)
    }
}

/// How a run ended
#[derive(Debug, Clone, PartialEq)]
struct Verdict {
    status: FlowStatus,
    code: StatusCode,
    message: Option<String>,
}

impl Verdict {
    /// Classify a flow whose ready set is empty.
    ///
    /// Stuck beats failed steps, which beat missing required outputs.
    fn classify(flow: &Flow, plan: &FlowPlan, outputs: &[StepOutput], cancelled: bool) -> Self {
        let join = |ids: Vec<&StepId>| {
            ids.iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        };

        if cancelled {
            return Self {
                status: FlowStatus::Cancelled,
                code: StatusCode::Cancelled,
                message: Some("run was cancelled".to_string()),
            };
        }

        let unprocessed = flow.unprocessed_step_ids();
        let failed = flow.failed_step_ids();
        if !unprocessed.is_empty() {
            let mut message = format!("steps never became ready: {}", join(unprocessed));
            if !failed.is_empty() {
                message.push_str(&format!("; failed steps: {}", join(failed)));
            }
            return Self {
                status: FlowStatus::Stuck,
                code: StatusCode::FailedPrecondition,
                message: Some(message),
            };
        }
        if !failed.is_empty() {
            return Self {
                status: FlowStatus::Failed,
                code: StatusCode::Unknown,
                message: Some(format!("steps failed: {}", join(failed))),
            };
        }

        let missing: Vec<&str> = plan
            .definition()
            .outputs
            .iter()
            .filter(|output| output.required)
            .filter(|output| !outputs.iter().any(|o| o.output_name == output.name))
            .map(|output| output.name.as_str())
            .collect();
        if !missing.is_empty() {
            return Self {
                status: FlowStatus::Failed,
                code: StatusCode::NotFound,
                message: Some(format!("required outputs missing: {}", missing.join(", "))),
            };
        }

        Self {
            status: FlowStatus::Completed,
            code: StatusCode::Ok,
            message: None,
        }
    }

    fn into_status(self, report: FlowRunReport) -> Status<FlowRunReport> {
        match self.message {
            Some(message) => Status::error_with(self.code, message, report),
            None => Status::ok(report),
        }
    }
}

/// Collect the declared flow outputs from top-level steps
fn collect_outputs(flow: &Flow, plan: &FlowPlan) -> Vec<StepOutput> {
    plan.definition()
        .outputs
        .iter()
        .filter_map(|declared| {
            flow.steps
                .iter()
                .find(|step| step.step_id() == &declared.step_id)
                .and_then(|step| step.output(&declared.step_output_name))
                .map(|output| StepOutput::new(declared.name.clone(), output.payload.clone()))
        })
        .collect()
}

/// Removes a run's cancellation token however the run ends
struct RunGuard<'a> {
    ctx: &'a SchedulerContext,
    flow_id: FlowId,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.ctx.runs.remove(&self.flow_id);
    }
}

/// Drives flows to their fixpoint
#[derive(Clone)]
pub struct Scheduler {
    ctx: Arc<SchedulerContext>,
}

impl Scheduler {
    /// Create a scheduler over a context
    pub fn new(ctx: SchedulerContext) -> Self {
        Self { ctx: Arc::new(ctx) }
    }

    /// The scheduler's context
    pub fn context(&self) -> &SchedulerContext {
        &self.ctx
    }

    /// Start a flow and drive it to termination
    pub async fn run(&self, definition: FlowDefinition, trigger: Trigger) -> Status<FlowRunReport> {
        match self.start(definition, trigger).await {
            Ok(flow_id) => self.resume(&flow_id).await,
            Err(e) => e.into(),
        }
    }

    /// Validate the definition, build the initial flow and checkpoint it.
    ///
    /// Structural problems are reported before anything is persisted. The flow
    /// stays `Initializing` until the first drive marks it running.
    pub async fn start(&self, definition: FlowDefinition, trigger: Trigger) -> Result<FlowId, CoreError> {
        let plan = FlowPlan::new(definition, &self.ctx.registry)?;
        let mut flow = Initializer::new(&plan, &self.ctx.registry).initialize(FlowId::generate(), trigger)?;

        self.ctx.definitions.save(plan.definition()).await?;
        self.ctx.flows.save(&flow).await?;
        info!(
            flow_id = %flow.flow_id,
            flow_definition_id = %flow.flow_definition_id,
            steps = flow.total_steps(),
            "Started flow"
        );
        self.publish(&mut flow).await;
        Ok(flow.flow_id)
    }

    /// Drive a checkpointed flow from its last completed round.
    ///
    /// A flow that already terminated is reported as it stands.
    #[instrument(skip_all, fields(flow_id = %flow_id))]
    pub async fn resume(&self, flow_id: &FlowId) -> Status<FlowRunReport> {
        match self.drive(flow_id).await {
            Ok(status) => status,
            Err(e) => {
                warn!(flow_id = %flow_id, "Run aborted: {}", e);
                e.into()
            }
        }
    }

    /// Request cooperative cancellation of a run in this process.
    ///
    /// Returns whether a live run was found.
    pub fn cancel(&self, flow_id: &FlowId) -> bool {
        match self.ctx.runs.get(flow_id) {
            Some(token) => {
                info!(flow_id = %flow_id, "Cancelling run");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Answer an external input request. Only the first answer counts.
    pub async fn submit_external_input(
        &self,
        flow_id: &FlowId,
        response: ExternalInputResponse,
    ) -> Result<bool, CoreError> {
        self.ctx.bridge.submit_response(flow_id, response).await
    }

    /// Requests still waiting for an answer
    pub async fn pending_requests(&self, flow_id: &FlowId) -> Result<Vec<ExternalInputRequest>, CoreError> {
        self.ctx.bridge.pending_requests(flow_id).await
    }

    /// Ask a running or future task to stop
    pub async fn stop_worker(
        &self,
        flow_id: &FlowId,
        task_id: impl Into<String>,
        explanation: impl Into<String>,
    ) -> Result<bool, CoreError> {
        let stop = StopWorker {
            task_id: task_id.into(),
            explanation: explanation.into(),
        };
        self.ctx.bridge.stop_worker(flow_id, stop).await
    }

    async fn drive(&self, flow_id: &FlowId) -> Result<Status<FlowRunReport>, CoreError> {
        let mut flow = self
            .ctx
            .flows
            .find_by_id(flow_id)
            .await?
            .ok_or_else(|| CoreError::FlowNotFound(flow_id.to_string()))?;
        let definition = self
            .ctx
            .definitions
            .find_by_id(&flow.flow_definition_id)
            .await?
            .ok_or_else(|| CoreError::FlowDefinitionNotFound(flow.flow_definition_id.to_string()))?;
        let plan = FlowPlan::new(definition, &self.ctx.registry)?;

        if flow.status.is_terminal() {
            let outputs = flow.outputs.clone().unwrap_or_default();
            let verdict = Verdict::classify(&flow, &plan, &outputs, flow.status == FlowStatus::Cancelled);
            return Ok(verdict.into_status(FlowRunReport::of(flow)));
        }
        // a flow persisted as running was already driven by some process
        if flow.status == FlowStatus::Initializing {
            flow.start()?;
            self.ctx.flows.save(&flow).await?;
        } else {
            flow.resume()?;
            info!(flow_id = %flow_id, round = flow.round, "Resuming flow");
        }

        let token = CancellationToken::new();
        self.ctx.runs.insert(flow_id.clone(), token.clone());
        let _guard = RunGuard {
            ctx: self.context(),
            flow_id: flow_id.clone(),
        };

        let initializer = Initializer::new(&plan, &self.ctx.registry);
        let propagator = OutputPropagator::new(&plan, &self.ctx.registry);
        let resolver = DependencyResolver::new(&self.ctx.registry);
        let processor = StepProcessor::new(&self.ctx, &plan);

        loop {
            if token.is_cancelled() {
                break;
            }
            let ready = resolver.ready_steps(&flow);
            if ready.is_empty() {
                break;
            }
            if flow.round >= self.ctx.config.max_rounds {
                return self
                    .finish(
                        flow,
                        &plan,
                        Verdict {
                            status: FlowStatus::Failed,
                            code: StatusCode::Internal,
                            message: Some(format!(
                                "no fixpoint after {} rounds",
                                self.ctx.config.max_rounds
                            )),
                        },
                    )
                    .await;
            }

            let (actions, groups): (Vec<StepId>, Vec<StepId>) = ready
                .into_iter()
                .partition(|id| matches!(flow.step(id), Some(FlowStep::Action(_))));

            let outcomes = processor.run_actions(&flow, &actions, &token).await;
            for outcome in outcomes {
                processor.apply_outcome(&mut flow, &propagator, outcome);
            }
            for group_id in &groups {
                processor.expand_group(&mut flow, &initializer, &propagator, group_id)?;
            }

            flow.round += 1;
            flow.update_timestamp();
            self.ctx.flows.save(&flow).await?;
            self.publish(&mut flow).await;
        }

        let outputs = collect_outputs(&flow, &plan);
        let verdict = Verdict::classify(&flow, &plan, &outputs, token.is_cancelled());
        self.finish(flow, &plan, verdict).await
    }

    async fn finish(
        &self,
        mut flow: Flow,
        plan: &FlowPlan,
        verdict: Verdict,
    ) -> Result<Status<FlowRunReport>, CoreError> {
        flow.outputs = Some(collect_outputs(&flow, plan));
        flow.terminate(verdict.status)?;
        self.ctx.flows.save(&flow).await?;
        self.publish(&mut flow).await;

        let labels = HashMap::from([
            (
                "flow_definition_id".to_string(),
                flow.flow_definition_id.to_string(),
            ),
            ("status".to_string(), format!("{:?}", verdict.status)),
        ]);
        self.ctx.metrics.record_metric(
            names::FLOW_ROUNDS,
            f64::from(flow.round),
            MetricType::Gauge,
            labels.clone(),
        );
        self.ctx
            .metrics
            .record_metric(names::FLOW_TERMINATED, 1.0, MetricType::Counter, labels);
        info!(
            flow_id = %flow.flow_id,
            status = ?verdict.status,
            code = %verdict.code,
            rounds = flow.round,
            "Flow terminated"
        );

        Ok(verdict.into_status(FlowRunReport::of(flow)))
    }

    async fn publish(&self, flow: &mut Flow) {
        for event in flow.take_events() {
            if let Err(e) = self.ctx.events.handle_event(event).await {
                warn!(flow_id = %flow.flow_id, "Event handler failed: {}", e);
            }
        }
    }
}
