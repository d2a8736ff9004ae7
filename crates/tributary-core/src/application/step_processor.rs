//! Runs the steps chosen for a round and folds their results back into the flow.

use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::action::{Action, ActionContext, ActionOutputs};
use crate::application::context::SchedulerContext;
use crate::application::external_io::ExternalIoBridge;
use crate::application::initializer::Initializer;
use crate::application::output_propagator::OutputPropagator;
use crate::application::plan::FlowPlan;
use crate::domain::flow::{ActionStep, Flow, FlowId, FlowStep, StepError, StepId, StepInput};
use crate::metrics::{names, MetricType};
use crate::status::{Status, StatusCode};
use crate::CoreError;

/// Result of running one action step, retries included
#[derive(Debug, Clone)]
pub struct ActionOutcome {
    /// Step that ran
    pub step_id: StepId,
    /// Final status
    pub status: Status<ActionOutputs>,
    /// Invocations made
    pub attempts: u32,
    /// Wall time across all attempts
    pub elapsed: Duration,
}

impl ActionOutcome {
    fn immediate(step_id: StepId, code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            step_id,
            status: Status::error(code, message),
            attempts: 0,
            elapsed: Duration::ZERO,
        }
    }
}

/// One action step's invocation loop, owned by its task
struct Invocation {
    action: Arc<dyn Action>,
    inputs: Vec<StepInput>,
    flow_id: FlowId,
    step_id: StepId,
    token: CancellationToken,
    bridge: Arc<ExternalIoBridge>,
    max_attempts: u32,
    backoff: Duration,
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

impl Invocation {
    async fn run(self) -> ActionOutcome {
        let started = Instant::now();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let ctx = ActionContext::new(
                self.flow_id.clone(),
                self.step_id.clone(),
                attempt,
                self.token.clone(),
                self.bridge.clone(),
            );
            let execution = self.action.execute(self.inputs.clone(), ctx);
            let mut status = match AssertUnwindSafe(execution).catch_unwind().await {
                Ok(status) => status,
                Err(panic) => Status::error(
                    StatusCode::Internal,
                    format!("action panicked: {}", panic_message(panic.as_ref())),
                ),
            };
            if !status.is_ok() && self.token.is_cancelled() {
                status.code = StatusCode::Cancelled;
            }

            let exhausted = attempt >= self.max_attempts;
            if status.is_ok() || exhausted || !status.code.is_retryable() {
                return ActionOutcome {
                    step_id: self.step_id,
                    status,
                    attempts: attempt,
                    elapsed: started.elapsed(),
                };
            }

            warn!(
                step_id = %self.step_id,
                attempt,
                max_attempts = self.max_attempts,
                code = %status.code,
                "Action failed, retrying: {}",
                status.message.as_deref().unwrap_or_default()
            );
            tokio::select! {
                _ = self.token.cancelled() => {
                    return ActionOutcome {
                        step_id: self.step_id,
                        status: Status::error(StatusCode::Cancelled, "stopped while waiting to retry"),
                        attempts: attempt,
                        elapsed: started.elapsed(),
                    };
                }
                _ = tokio::time::sleep(self.backoff) => {}
            }
        }
    }
}

/// Executes ready steps for the scheduler loop
pub struct StepProcessor<'a> {
    ctx: &'a SchedulerContext,
    plan: &'a FlowPlan,
}

impl<'a> StepProcessor<'a> {
    /// Create a processor
    pub fn new(ctx: &'a SchedulerContext, plan: &'a FlowPlan) -> Self {
        Self { ctx, plan }
    }

    /// Run the given action steps concurrently and wait for all of them.
    ///
    /// Outcomes come back in the order of `step_ids`. Steps that are not
    /// action steps are skipped. Dropping the returned future aborts every
    /// task it spawned.
    pub async fn run_actions(
        &self,
        flow: &Flow,
        step_ids: &[StepId],
        run_token: &CancellationToken,
    ) -> Vec<ActionOutcome> {
        let steps: Vec<&ActionStep> = step_ids
            .iter()
            .filter_map(|step_id| match flow.step(step_id) {
                Some(FlowStep::Action(step)) => Some(step),
                _ => None,
            })
            .collect();
        let mut slots: Vec<Option<ActionOutcome>> = steps.iter().map(|_| None).collect();
        let mut tasks = JoinSet::new();

        for (position, step) in steps.iter().enumerate() {
            match self.prepare(flow, step, run_token).await {
                Ok(invocation) => {
                    let span = info_span!("step", flow_id = %flow.flow_id, step_id = %step.step_id);
                    tasks.spawn(async move { (position, invocation.run().await) }.instrument(span));
                }
                Err(outcome) => slots[position] = Some(outcome),
            }
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((position, outcome)) => {
                    self.record_metrics(&outcome);
                    slots[position] = Some(outcome);
                }
                Err(e) => warn!(flow_id = %flow.flow_id, "Step task did not complete: {}", e),
            }
        }

        steps
            .iter()
            .zip(slots)
            .map(|(step, slot)| {
                self.ctx.bridge.unregister_worker(&flow.flow_id, &step.step_id.0);
                slot.unwrap_or_else(|| {
                    ActionOutcome::immediate(
                        step.step_id.clone(),
                        StatusCode::Internal,
                        "step task was lost",
                    )
                })
            })
            .collect()
    }

    /// Build the invocation for a step, or the outcome it ends with without running
    async fn prepare(
        &self,
        flow: &Flow,
        step: &ActionStep,
        run_token: &CancellationToken,
    ) -> Result<Invocation, ActionOutcome> {
        let step_id = &step.step_id;
        let action = self.ctx.registry.get(&step.action_id).ok_or_else(|| {
            ActionOutcome::immediate(
                step_id.clone(),
                StatusCode::NotFound,
                format!("action {} is not registered", step.action_id),
            )
        })?;

        let stop = self
            .ctx
            .bridge
            .stop_request(&flow.flow_id, &step_id.0)
            .await
            .map_err(|e| {
                ActionOutcome::immediate(
                    step_id.clone(),
                    StatusCode::Internal,
                    format!("cannot read signal history: {}", e),
                )
            })?;
        if let Some(stop) = stop {
            info!(flow_id = %flow.flow_id, step_id = %step_id, "Step stopped before it started");
            return Err(ActionOutcome::immediate(
                step_id.clone(),
                StatusCode::Cancelled,
                stop.explanation,
            ));
        }

        let max_attempts = self
            .plan
            .index()
            .action(&step_id.address().base)
            .and_then(|definition| definition.max_attempts)
            .unwrap_or(self.ctx.config.default_max_attempts)
            .max(1);
        let token = run_token.child_token();
        self.ctx
            .bridge
            .register_worker(&flow.flow_id, &step_id.0, token.clone());
        debug!(
            flow_id = %flow.flow_id,
            step_id = %step_id,
            action_id = %step.action_id,
            max_attempts,
            "Invoking action"
        );

        Ok(Invocation {
            action,
            inputs: step.inputs.clone(),
            flow_id: flow.flow_id.clone(),
            step_id: step_id.clone(),
            token,
            bridge: self.ctx.bridge.clone(),
            max_attempts,
            backoff: self.ctx.config.retry_backoff(),
        })
    }

    /// Fold an action outcome into the flow and propagate what it produced.
    ///
    /// The step is marked processed whatever the outcome. A failed step
    /// propagates no outputs, which still lets fallback payloads through.
    pub fn apply_outcome(
        &self,
        flow: &mut Flow,
        propagator: &OutputPropagator<'_>,
        outcome: ActionOutcome,
    ) {
        let ActionOutcome {
            step_id,
            status,
            attempts,
            ..
        } = outcome;
        let code = status.code;
        let message = status.message.clone();

        let produced = match status.into_content() {
            Some(content) if code.is_ok() => content.outputs,
            _ => Vec::new(),
        };
        let Some(FlowStep::Action(step)) = flow.step(&step_id) else {
            return;
        };
        if let Some(definition) = self.ctx.registry.definition(&step.action_id) {
            for output in &produced {
                if !definition.outputs.iter().any(|d| d.name == output.output_name) {
                    warn!(
                        step_id = %step_id,
                        output = %output.output_name,
                        "Action produced an undeclared output"
                    );
                }
            }
        }

        if let Some(FlowStep::Action(step)) = flow.step_mut(&step_id) {
            step.attempts += attempts;
            if code.is_ok() {
                step.outputs = Some(produced.clone());
            }
        }
        if !flow.mark_processed(&step_id, code) {
            return;
        }
        if !code.is_ok() {
            flow.record_step_error(StepError::new(
                step_id.clone(),
                code,
                message.unwrap_or_else(|| format!("step failed with {}", code)),
            ));
        }
        propagator.propagate(flow, &step_id, produced);
    }

    /// Process a ready parallel group: mark it, spawn its branches and
    /// settle its aggregate when there is nothing to wait for.
    pub fn expand_group(
        &self,
        flow: &mut Flow,
        initializer: &Initializer<'_>,
        propagator: &OutputPropagator<'_>,
        group_id: &StepId,
    ) -> Result<usize, CoreError> {
        if !flow.mark_processed(group_id, StatusCode::Ok) {
            return Ok(0);
        }
        let branches = initializer.splice_group(flow, group_id)?;
        debug!(flow_id = %flow.flow_id, step_id = %group_id, branches, "Expanded parallel group");
        propagator.settle_group(flow, group_id);
        Ok(branches)
    }

    fn record_metrics(&self, outcome: &ActionOutcome) {
        let labels = HashMap::from([
            ("step_id".to_string(), outcome.step_id.address().base.0),
            ("code".to_string(), outcome.status.code.to_string()),
        ]);
        self.ctx.metrics.record_metric(
            names::STEP_DURATION_MS,
            outcome.elapsed.as_secs_f64() * 1000.0,
            MetricType::Histogram,
            labels.clone(),
        );
        if outcome.attempts > 1 {
            self.ctx.metrics.record_metric(
                names::STEP_RETRIED,
                f64::from(outcome.attempts - 1),
                MetricType::Counter,
                labels.clone(),
            );
        }
        if !outcome.status.is_ok() {
            self.ctx
                .metrics
                .record_metric(names::STEP_FAILED, 1.0, MetricType::Counter, labels);
        }
    }
}
