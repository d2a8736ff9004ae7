use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use pretty_assertions::assert_eq;
use tributary_core::{FlowStatus, FlowStep, Payload, PayloadKind, StatusCode, StepId};
use tributary_state_inmemory::InMemoryStateStoreProvider;
use tributary_tests::{
    action_step, fixture, flow, flow_output, from_step, registry, scheduler, trigger,
};

fn counter() -> Arc<AtomicU32> {
    Arc::new(AtomicU32::new(0))
}

// Fan-out over two urls, then a summary over the collected pages
#[tokio::test]
async fn test_fan_out_collects_pages_in_branch_order() {
    let provider = InMemoryStateStoreProvider::new();
    let scheduler = scheduler(&provider, registry(counter()));

    let status = scheduler
        .run(
            fixture("fan_out_summary.yaml"),
            trigger(vec![("urls", Payload::texts(["a", "b"]))]),
        )
        .await;

    assert_eq!(status.code, StatusCode::Ok, "{:?}", status.message);
    let report = status.into_content().expect("run report");
    assert_eq!(report.flow.status, FlowStatus::Completed);
    assert_eq!(
        report.output("summary").map(|o| o.payload.clone()),
        Some(Payload::text("<html>a</html>|<html>b</html>"))
    );

    let Some(FlowStep::ParallelGroup(group)) = report.flow.step(&StepId::from("fetch_all")) else {
        panic!("fetch_all should be a parallel group");
    };
    let branch_ids: Vec<&str> = group.steps.iter().map(|s| s.step_id().0.as_str()).collect();
    assert_eq!(branch_ids, vec!["fetch~0", "fetch~1"]);
    assert_eq!(
        group.aggregate_output.as_ref().map(|o| o.payload.clone()),
        Some(Payload::texts(["<html>a</html>", "<html>b</html>"]))
    );
    assert!(report.step_errors.is_empty());
}

// A required input nothing provides keeps its step from ever running
#[tokio::test]
async fn test_unwired_required_input_leaves_flow_stuck() {
    let provider = InMemoryStateStoreProvider::new();
    let scheduler = scheduler(&provider, registry(counter()));
    let definition = flow(
        "needs-x",
        vec![],
        vec![action_step("needs_x", "needs_x", vec![])],
        vec![],
    );

    let status = scheduler.run(definition, trigger(vec![])).await;

    assert_eq!(status.code, StatusCode::FailedPrecondition);
    assert!(status
        .message
        .as_deref()
        .unwrap_or_default()
        .contains("needs_x"));
    let report = status.into_content().expect("run report");
    assert_eq!(report.flow.status, FlowStatus::Stuck);
    assert!(report.flow.processed_step_ids.is_empty());
    assert_eq!(report.flow.round, 0);
}

// One consumer fails, its sibling still completes
#[tokio::test]
async fn test_failed_step_does_not_stop_independent_siblings() {
    let provider = InMemoryStateStoreProvider::new();
    let scheduler = scheduler(&provider, registry(counter()));
    let definition = flow(
        "count-fail-increment",
        vec![],
        vec![
            action_step("count", "count", vec![]),
            action_step("fail", "fail", vec![from_step("value", "count", "count")]),
            action_step(
                "increment",
                "increment",
                vec![from_step("value", "count", "count")],
            ),
        ],
        vec![flow_output("total", "increment", "value", PayloadKind::Number, false)],
    );

    let status = scheduler.run(definition, trigger(vec![])).await;

    assert_eq!(status.code, StatusCode::Unknown);
    assert_eq!(status.message.as_deref(), Some("steps failed: fail"));
    let report = status.into_content().expect("run report");
    assert_eq!(report.flow.status, FlowStatus::Failed);
    assert_eq!(report.step_errors.len(), 1);
    assert_eq!(report.step_errors[0].step_id, StepId::from("fail"));
    assert_eq!(report.step_errors[0].code, StatusCode::Internal);
    assert_eq!(report.step_errors[0].message, "backend unavailable");

    let increment = report
        .flow
        .step(&StepId::from("increment"))
        .and_then(|step| step.output("value"))
        .map(|output| output.payload.clone());
    assert_eq!(increment, Some(Payload::number(4.0)));
    assert_eq!(
        report.output("total").map(|o| o.payload.clone()),
        Some(Payload::number(4.0))
    );
}
