//! Shared harness for the Tributary integration tests.
//!
//! Builds schedulers over an [`InMemoryStateStoreProvider`] and provides a
//! small set of actions exercising every part of the action contract.

use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tributary_core::domain::flow_definition::{
    ActionStepDefinition, FlowDefinitionId, FlowOutputDefinition, InputSource, OutputDefinition,
    StepDefinition, StepInputSource, TriggerDefinition,
};
use tributary_core::{
    Action, ActionContext, ActionDefinition, ActionId, ActionOutputs, ActionRegistry, ExternalInputKind,
    FlowDefinition, FnAction, InputDefinition, Items, Payload, PayloadKind, Scheduler,
    SchedulerConfig, SchedulerContext, Status, StatusCode, StepId, StepInput, StepOutput, Trigger,
};
use tributary_monitoring::{init_test_logging, InMemoryMetricsSink};
use tributary_state_inmemory::InMemoryStateStoreProvider;

/// Trigger id used by every fixture
pub const TRIGGER_ID: &str = "manual";

/// Short intervals so waiting tests stay fast
pub fn fast_config() -> SchedulerConfig {
    SchedulerConfig {
        retry_backoff_ms: 1,
        input_poll_interval_ms: 5,
        ..SchedulerConfig::default()
    }
}

/// A scheduler over the provider's stores, recording metrics in `metrics`
pub fn scheduler_with(
    provider: &InMemoryStateStoreProvider,
    registry: ActionRegistry,
    config: SchedulerConfig,
    metrics: Arc<InMemoryMetricsSink>,
) -> Scheduler {
    init_test_logging();
    let (flows, definitions, signals) = provider.create_repositories();
    Scheduler::new(
        SchedulerContext::builder(flows, definitions, signals, registry)
            .config(config)
            .metrics(metrics)
            .build(),
    )
}

/// A scheduler over the provider's stores with [`fast_config`]
pub fn scheduler(provider: &InMemoryStateStoreProvider, registry: ActionRegistry) -> Scheduler {
    scheduler_with(
        provider,
        registry,
        fast_config(),
        Arc::new(InMemoryMetricsSink::new()),
    )
}

/// A trigger with the given outputs
pub fn trigger(outputs: Vec<(&str, Payload)>) -> Trigger {
    Trigger {
        trigger_definition_id: TRIGGER_ID.to_string(),
        outputs: outputs
            .into_iter()
            .map(|(name, payload)| StepOutput::new(name, payload))
            .collect(),
    }
}

/// Load a definition from `tests/fixtures`
pub fn fixture(name: &str) -> FlowDefinition {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("fixtures")
        .join(name);
    FlowDefinition::from_file(&path)
        .unwrap_or_else(|e| panic!("cannot load fixture {}: {}", path.display(), e))
}

/// A definition with a manual trigger declaring `trigger_outputs`
pub fn flow(
    id: &str,
    trigger_outputs: Vec<OutputDefinition>,
    steps: Vec<StepDefinition>,
    outputs: Vec<FlowOutputDefinition>,
) -> FlowDefinition {
    FlowDefinition {
        flow_definition_id: FlowDefinitionId(id.to_string()),
        name: id.to_string(),
        description: None,
        trigger: TriggerDefinition {
            trigger_definition_id: TRIGGER_ID.to_string(),
            outputs: trigger_outputs,
        },
        steps,
        outputs,
    }
}

/// An action step
pub fn action_step(step_id: &str, action_id: &str, inputs: Vec<StepInputSource>) -> StepDefinition {
    StepDefinition::Action(ActionStepDefinition {
        step_id: StepId::from(step_id),
        action_id: ActionId::from(action_id),
        input_sources: inputs,
        max_attempts: None,
        description: None,
    })
}

/// Wire `input_name` to `source_step`'s `source_output`
pub fn from_step(input_name: &str, source_step: &str, source_output: &str) -> StepInputSource {
    StepInputSource {
        input_name: input_name.to_string(),
        source: InputSource::StepOutput {
            source_step_id: StepId::from(source_step),
            source_step_output_name: source_output.to_string(),
            fallback_payload: None,
        },
    }
}

/// Wire `input_name` to a literal value
pub fn hardcoded(input_name: &str, payload: Payload) -> StepInputSource {
    StepInputSource {
        input_name: input_name.to_string(),
        source: InputSource::Hardcoded { payload },
    }
}

/// Expose `step_id`'s `step_output_name` as flow output `name`
pub fn flow_output(
    name: &str,
    step_id: &str,
    step_output_name: &str,
    kind: PayloadKind,
    required: bool,
) -> FlowOutputDefinition {
    FlowOutputDefinition {
        name: name.to_string(),
        step_id: StepId::from(step_id),
        step_output_name: step_output_name.to_string(),
        payload_kind: kind,
        array: false,
        required,
    }
}

/// Poll `condition` until it holds, failing the test after five seconds
pub async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "condition not reached within five seconds");
}

/// Text value of a single-valued input
pub fn text_input(inputs: &[StepInput], name: &str) -> Option<String> {
    inputs
        .iter()
        .find(|input| input.input_name == name)
        .and_then(|input| match &input.payload {
            Payload::Text(Items::One(text)) => Some(text.clone()),
            _ => None,
        })
}

/// Number value of a single-valued input
pub fn number_input(inputs: &[StepInput], name: &str) -> Option<f64> {
    inputs
        .iter()
        .find(|input| input.input_name == name)
        .and_then(|input| match &input.payload {
            Payload::Number(Items::One(value)) => Some(*value),
            _ => None,
        })
}

fn output(name: &str, kind: PayloadKind) -> OutputDefinition {
    OutputDefinition {
        name: name.to_string(),
        payload_kind: kind,
        array: false,
        required: false,
    }
}

fn definition(
    action_id: &str,
    inputs: Vec<InputDefinition>,
    outputs: Vec<OutputDefinition>,
) -> ActionDefinition {
    ActionDefinition {
        action_id: ActionId::from(action_id),
        name: action_id.to_string(),
        inputs,
        outputs,
    }
}

fn single(name: &str, payload: Payload) -> Status<ActionOutputs> {
    Status::ok(ActionOutputs::new(vec![StepOutput::new(name, payload)]))
}

/// Test actions
pub mod actions {
    use super::*;

    /// `fetch(url: Text) -> page: Text`
    pub fn fetch() -> impl Action {
        FnAction::new(
            definition(
                "fetch",
                vec![InputDefinition::required("url", PayloadKind::Text, false)],
                vec![output("page", PayloadKind::Text)],
            ),
            |inputs: Vec<StepInput>, _ctx: ActionContext| {
                std::future::ready(match text_input(&inputs, "url") {
                    Some(url) => single("page", Payload::text(format!("<html>{}</html>", url))),
                    None => Status::error(StatusCode::InvalidArgument, "url is missing"),
                })
            },
        )
    }

    /// `summarise(pages: Text[]) -> summary: Text`
    pub fn summarise() -> impl Action {
        FnAction::new(
            definition(
                "summarise",
                vec![InputDefinition::required("pages", PayloadKind::Text, true)],
                vec![output("summary", PayloadKind::Text)],
            ),
            |inputs: Vec<StepInput>, _ctx: ActionContext| {
                let pages: Vec<String> = inputs
                    .iter()
                    .find(|input| input.input_name == "pages")
                    .map(|input| match &input.payload {
                        Payload::Text(items) => items.as_slice().to_vec(),
                        _ => Vec::new(),
                    })
                    .unwrap_or_default();
                std::future::ready(single("summary", Payload::text(pages.join("|"))))
            },
        )
    }

    /// `count() -> count: Number`, always 3
    pub fn count() -> impl Action {
        FnAction::new(
            definition("count", Vec::new(), vec![output("count", PayloadKind::Number)]),
            |_inputs: Vec<StepInput>, _ctx: ActionContext| {
                std::future::ready(single("count", Payload::number(3.0)))
            },
        )
    }

    /// `increment(value: Number) -> value: Number`
    pub fn increment() -> impl Action {
        FnAction::new(
            definition(
                "increment",
                vec![InputDefinition::required("value", PayloadKind::Number, false)],
                vec![output("value", PayloadKind::Number)],
            ),
            |inputs: Vec<StepInput>, _ctx: ActionContext| {
                let value = number_input(&inputs, "value").unwrap_or_default();
                std::future::ready(single("value", Payload::number(value + 1.0)))
            },
        )
    }

    /// `fail(value: Number)`, always fails with Internal
    pub fn fail() -> impl Action {
        FnAction::new(
            definition(
                "fail",
                vec![InputDefinition::required("value", PayloadKind::Number, false)],
                vec![output("result", PayloadKind::Number)],
            ),
            |_inputs: Vec<StepInput>, _ctx: ActionContext| {
                std::future::ready(Status::error(StatusCode::Internal, "backend unavailable"))
            },
        )
    }

    /// `needs_x(x: Text)`, never wired in the fixtures that use it
    pub fn needs_x() -> impl Action {
        FnAction::new(
            definition(
                "needs_x",
                vec![InputDefinition::required("x", PayloadKind::Text, false)],
                Vec::new(),
            ),
            |_inputs: Vec<StepInput>, _ctx: ActionContext| {
                std::future::ready(Status::ok(ActionOutputs::default()))
            },
        )
    }

    /// `ask(question: Text) -> answer: Text`, answered by a human input response.
    ///
    /// `invocations` counts how often the action was entered.
    pub fn ask(invocations: Arc<AtomicU32>) -> impl Action {
        FnAction::new(
            definition(
                "ask",
                vec![InputDefinition::required("question", PayloadKind::Text, false)],
                vec![output("answer", PayloadKind::Text)],
            ),
            move |inputs: Vec<StepInput>, ctx: ActionContext| {
                invocations.fetch_add(1, Ordering::SeqCst);
                async move {
                    let question = text_input(&inputs, "question").unwrap_or_default();
                    match ctx
                        .request_external_input(
                            ExternalInputKind::HumanInput,
                            json!({ "question": question }),
                        )
                        .await
                    {
                        Ok(response) => single(
                            "answer",
                            Payload::text(response.data["answer"].as_str().unwrap_or_default()),
                        ),
                        Err(e) => e.into(),
                    }
                }
            },
        )
    }

    /// `wait()`, runs until it is stopped and then reports Cancelled.
    ///
    /// `invocations` counts how often the action was entered.
    pub fn wait(invocations: Arc<AtomicU32>) -> impl Action {
        FnAction::new(
            definition("wait", Vec::new(), vec![output("done", PayloadKind::Boolean)]),
            move |_inputs: Vec<StepInput>, ctx: ActionContext| {
                invocations.fetch_add(1, Ordering::SeqCst);
                async move {
                    loop {
                        if let Err(e) = ctx.check_stop().await {
                            return Status::<ActionOutputs>::from(e);
                        }
                        tokio::select! {
                            _ = ctx.cancelled() => {}
                            _ = tokio::time::sleep(Duration::from_millis(5)) => {}
                        }
                    }
                }
            },
        )
    }
}

/// Registry with every test action; `ask` and `wait` share `invocations`
pub fn registry(invocations: Arc<AtomicU32>) -> ActionRegistry {
    ActionRegistry::new()
        .with(actions::fetch())
        .with(actions::summarise())
        .with(actions::count())
        .with(actions::increment())
        .with(actions::fail())
        .with(actions::needs_x())
        .with(actions::ask(invocations.clone()))
        .with(actions::wait(invocations))
}
