use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use pretty_assertions::assert_eq;
use tributary_core::{
    CoreError, FlowDefinition, FlowDefinitionId, FlowDefinitionRepository, FlowRepository, Payload,
    StatusCode, StepId,
};
use tributary_state_inmemory::InMemoryStateStoreProvider;
use tributary_tests::{fixture, registry, scheduler, trigger};

#[test]
fn test_fixtures_validate_against_registry() {
    let registry = registry(Arc::new(AtomicU32::new(0)));
    for name in ["fan_out_summary.yaml", "fallback.yaml", "ask_question.yaml"] {
        let definition = fixture(name);
        assert!(
            definition.validate(&registry).is_ok(),
            "{} should validate: {:?}",
            name,
            definition.validate(&registry)
        );
    }
}

#[test]
fn test_yaml_and_json_forms_agree() -> anyhow::Result<()> {
    let from_yaml = fixture("fan_out_summary.yaml");
    let json = serde_json::to_string(&from_yaml)?;
    let from_json = FlowDefinition::from_json(&json)?;
    assert_eq!(from_json, from_yaml);
    Ok(())
}

#[test]
fn test_unknown_step_kind_is_rejected() {
    let yaml = r#"
flowDefinitionId: bad
name: Bad
trigger:
  triggerDefinitionId: manual
steps:
  - kind: loop
    stepId: forever
"#;
    let err = FlowDefinition::from_yaml(yaml).unwrap_err();
    assert!(matches!(err, CoreError::SerializationError(_)), "{:?}", err);
}

// An optional fan-out source left out of the trigger is rejected like a missing required one
#[tokio::test]
async fn test_fan_out_on_omitted_optional_trigger_output_is_rejected() {
    let provider = InMemoryStateStoreProvider::new();
    let scheduler = scheduler(&provider, registry(Arc::new(AtomicU32::new(0))));
    let mut optional = fixture("fan_out_summary.yaml");
    optional.trigger.outputs[0].required = false;

    let missing_required = scheduler
        .run(fixture("fan_out_summary.yaml"), trigger(vec![]))
        .await;
    let status = scheduler.run(optional.clone(), trigger(vec![])).await;

    assert_eq!(missing_required.code, StatusCode::InvalidArgument);
    assert_eq!(status.code, missing_required.code);
    assert!(
        status
            .message
            .as_deref()
            .is_some_and(|m| m.contains("fans out on trigger output 'urls'")),
        "{:?}",
        status.message
    );
    assert!(status.contents.is_empty());
    let (flows, definitions, _) = provider.create_repositories();
    assert!(flows.list(None).await.expect("store readable").is_empty());
    assert_eq!(
        definitions
            .find_by_id(&optional.flow_definition_id)
            .await
            .expect("store readable"),
        None
    );
    assert!(matches!(
        scheduler.start(optional, trigger(vec![])).await,
        Err(CoreError::ValidationError(_))
    ));
}

// The failing producer still hands its fallback to the consumer
#[tokio::test]
async fn test_fallback_payload_feeds_consumer_of_failed_step() {
    let provider = InMemoryStateStoreProvider::new();
    let scheduler = scheduler(&provider, registry(Arc::new(AtomicU32::new(0))));

    let status = scheduler.run(fixture("fallback.yaml"), trigger(vec![])).await;

    assert_eq!(status.code, StatusCode::Unknown);
    let report = status.into_content().expect("run report");
    assert_eq!(report.step_errors.len(), 1);
    assert_eq!(report.step_errors[0].step_id, StepId::from("fail"));
    let fail_attempts = match report.flow.step(&StepId::from("fail")) {
        Some(tributary_core::FlowStep::Action(step)) => step.attempts,
        other => panic!("fail should be an action step, got {:?}", other),
    };
    assert_eq!(fail_attempts, 2);
    assert_eq!(
        report.output("total").map(|o| o.payload.clone()),
        Some(Payload::number(11.0))
    );
}

#[tokio::test]
async fn test_started_flow_stores_its_definition() {
    let provider = InMemoryStateStoreProvider::new();
    let scheduler = scheduler(&provider, registry(Arc::new(AtomicU32::new(0))));

    scheduler
        .start(
            fixture("fan_out_summary.yaml"),
            trigger(vec![("urls", Payload::texts(["a"]))]),
        )
        .await
        .expect("flow starts");

    let (_, definitions, _) = provider.create_repositories();
    let stored = definitions
        .find_by_id(&FlowDefinitionId("fan-out-summary".to_string()))
        .await
        .expect("store readable");
    assert_eq!(stored, Some(fixture("fan_out_summary.yaml")));
}
