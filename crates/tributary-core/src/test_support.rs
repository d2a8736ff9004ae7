//! Fixtures shared by the unit tests.

use crate::action::{
    Action, ActionContext, ActionDefinition, ActionOutputs, ActionRegistry, FnAction,
    InputDefinition,
};
use crate::domain::flow::{StepId, StepInput, StepOutput, Trigger};
use crate::domain::flow_definition::{
    ActionId, ActionStepDefinition, AggregateOutputDefinition, FlowDefinition, FlowDefinitionId,
    InputSource, OutputDefinition, ParallelGroupStepDefinition, StepDefinition, StepInputSource,
    TriggerDefinition,
};
use crate::domain::payload::{Payload, PayloadKind};
use crate::status::Status;

pub(crate) const TRIGGER_ID: &str = "manual";

fn output(name: &str, kind: PayloadKind) -> OutputDefinition {
    OutputDefinition {
        name: name.to_string(),
        payload_kind: kind,
        array: false,
        required: false,
    }
}

fn declared(
    action_id: &str,
    inputs: Vec<InputDefinition>,
    outputs: Vec<OutputDefinition>,
) -> impl Action {
    FnAction::new(
        ActionDefinition {
            action_id: ActionId::from(action_id),
            name: action_id.to_string(),
            inputs,
            outputs,
        },
        |_inputs: Vec<StepInput>, _ctx: ActionContext| {
            std::future::ready(Status::ok(ActionOutputs::default()))
        },
    )
}

/// Actions with declared contracts only, their handlers produce nothing
pub(crate) fn registry() -> ActionRegistry {
    ActionRegistry::new()
        .with(declared(
            "fetch",
            vec![
                InputDefinition::required("url", PayloadKind::Text, false),
                InputDefinition::optional("format", PayloadKind::Text, false),
                InputDefinition::optional("retries", PayloadKind::Number, false)
                    .with_default(Payload::number(0.0)),
            ],
            vec![output("page", PayloadKind::Text)],
        ))
        .with(declared("count", vec![], vec![output("count", PayloadKind::Number)]))
        .with(declared(
            "consume",
            vec![InputDefinition::required("value", PayloadKind::Number, false)],
            vec![],
        ))
        .with(declared(
            "collect",
            vec![InputDefinition::required("values", PayloadKind::Number, true)],
            vec![],
        ))
        .with(declared(
            "summarise",
            vec![InputDefinition::required("pages", PayloadKind::Text, true)],
            vec![output("summary", PayloadKind::Text)],
        ))
        .with(declared(
            "summarise_text",
            vec![InputDefinition::required("text", PayloadKind::Text, false)],
            vec![output("summary", PayloadKind::Text)],
        ))
}

pub(crate) fn flow_definition(
    steps: Vec<StepDefinition>,
    trigger_outputs: Vec<OutputDefinition>,
) -> FlowDefinition {
    FlowDefinition {
        flow_definition_id: FlowDefinitionId("test-flow".to_string()),
        name: "Test flow".to_string(),
        description: None,
        trigger: TriggerDefinition {
            trigger_definition_id: TRIGGER_ID.to_string(),
            outputs: trigger_outputs,
        },
        steps,
        outputs: Vec::new(),
    }
}

pub(crate) fn action_step(
    step_id: &str,
    action_id: &str,
    input_sources: Vec<StepInputSource>,
) -> StepDefinition {
    StepDefinition::Action(ActionStepDefinition {
        step_id: StepId::from(step_id),
        action_id: ActionId::from(action_id),
        input_sources,
        max_attempts: None,
        description: None,
    })
}

pub(crate) fn trigger_input(input_name: &str, trigger_output_name: &str) -> StepInputSource {
    StepInputSource {
        input_name: input_name.to_string(),
        source: InputSource::TriggerOutput {
            trigger_output_name: trigger_output_name.to_string(),
        },
    }
}

pub(crate) fn hardcoded_input(input_name: &str, payload: Payload) -> StepInputSource {
    StepInputSource {
        input_name: input_name.to_string(),
        source: InputSource::Hardcoded { payload },
    }
}

pub(crate) fn step_input(input_name: &str, source_step: &str, source_output: &str) -> StepInputSource {
    StepInputSource {
        input_name: input_name.to_string(),
        source: InputSource::StepOutput {
            source_step_id: StepId::from(source_step),
            source_step_output_name: source_output.to_string(),
            fallback_payload: None,
        },
    }
}

fn element_input(input_name: &str) -> StepInputSource {
    StepInputSource {
        input_name: input_name.to_string(),
        source: InputSource::ParallelGroupInput,
    }
}

pub(crate) fn text_trigger_output(name: &str, array: bool) -> OutputDefinition {
    OutputDefinition {
        name: name.to_string(),
        payload_kind: PayloadKind::Text,
        array,
        required: true,
    }
}

pub(crate) fn text_trigger(outputs: Vec<(&str, Payload)>) -> Trigger {
    Trigger {
        trigger_definition_id: TRIGGER_ID.to_string(),
        outputs: outputs
            .into_iter()
            .map(|(name, payload)| StepOutput::new(name, payload))
            .collect(),
    }
}

/// `fetch_all` fans `fetch` out over the trigger's urls, `summarise` reads the pages
pub(crate) fn fan_out_definition() -> FlowDefinition {
    flow_definition(
        vec![
            StepDefinition::ParallelGroup(ParallelGroupStepDefinition {
                step_id: StepId::from("fetch_all"),
                input_source_to_parallelize_on: trigger_input("urls", "urls"),
                steps: vec![action_step("fetch", "fetch", vec![element_input("url")])],
                aggregate_output: AggregateOutputDefinition {
                    step_id: StepId::from("fetch"),
                    step_output_name: "page".to_string(),
                    name: "pages".to_string(),
                    payload_kind: PayloadKind::Text,
                },
            }),
            action_step("summarise", "summarise", vec![step_input("pages", "fetch_all", "pages")]),
        ],
        vec![text_trigger_output("urls", true)],
    )
}

/// Each branch fetches and then summarises its own page
pub(crate) fn two_stage_fan_out_definition() -> FlowDefinition {
    flow_definition(
        vec![StepDefinition::ParallelGroup(ParallelGroupStepDefinition {
            step_id: StepId::from("fetch_all"),
            input_source_to_parallelize_on: trigger_input("urls", "urls"),
            steps: vec![
                action_step("fetch", "fetch", vec![element_input("url")]),
                action_step(
                    "summarise_page",
                    "summarise_text",
                    vec![step_input("text", "fetch", "page")],
                ),
            ],
            aggregate_output: AggregateOutputDefinition {
                step_id: StepId::from("summarise_page"),
                step_output_name: "summary".to_string(),
                name: "summaries".to_string(),
                payload_kind: PayloadKind::Text,
            },
        })],
        vec![text_trigger_output("urls", true)],
    )
}
