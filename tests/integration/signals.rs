use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use serde_json::json;
use tributary_core::{
    ExternalInputKind, ExternalInputResponse, FlowDefinition, FlowId, FlowStatus, Payload,
    Scheduler, StatusCode, StepId,
};
use tributary_state_inmemory::InMemoryStateStoreProvider;
use tributary_tests::{action_step, fixture, flow, registry, scheduler, trigger, wait_until};

fn waiting() -> FlowDefinition {
    flow("wait", vec![], vec![action_step("wait", "wait", vec![])], vec![])
}

async fn live_worker(scheduler: &Scheduler) {
    wait_until(|| {
        let live = scheduler.context().bridge().live_workers();
        async move { live == 1 }
    })
    .await;
}

async fn pending_request(scheduler: &Scheduler, flow_id: &FlowId) -> String {
    wait_until(|| async move {
        !scheduler
            .pending_requests(flow_id)
            .await
            .unwrap_or_default()
            .is_empty()
    })
    .await;
    scheduler
        .pending_requests(flow_id)
        .await
        .expect("history readable")
        .remove(0)
        .request_id
}

#[tokio::test]
async fn test_stop_worker_cancels_running_step() {
    let provider = InMemoryStateStoreProvider::new();
    let invocations = Arc::new(AtomicU32::new(0));
    let scheduler = scheduler(&provider, registry(invocations.clone()));
    let flow_id = scheduler.start(waiting(), trigger(vec![])).await.expect("flow starts");

    let run = {
        let scheduler = scheduler.clone();
        let flow_id = flow_id.clone();
        tokio::spawn(async move { scheduler.resume(&flow_id).await })
    };
    live_worker(&scheduler).await;
    let stopped = scheduler
        .stop_worker(&flow_id, "wait", "no longer needed")
        .await
        .expect("stop recorded");
    assert!(stopped);

    let status = run.await.expect("run task finishes");
    assert_eq!(status.code, StatusCode::Unknown);
    let report = status.into_content().expect("run report");
    assert_eq!(report.flow.status, FlowStatus::Failed);
    assert_eq!(report.step_errors.len(), 1);
    assert_eq!(report.step_errors[0].step_id, StepId::from("wait"));
    assert_eq!(report.step_errors[0].code, StatusCode::Cancelled);
    assert!(report.flow.is_processed(&StepId::from("wait")));
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    assert_eq!(scheduler.context().bridge().live_workers(), 0);
}

#[tokio::test]
async fn test_stop_recorded_before_run_skips_invocation() {
    let provider = InMemoryStateStoreProvider::new();
    let invocations = Arc::new(AtomicU32::new(0));
    let scheduler = scheduler(&provider, registry(invocations.clone()));
    let flow_id = scheduler.start(waiting(), trigger(vec![])).await.expect("flow starts");

    let stopped = scheduler
        .stop_worker(&flow_id, "wait", "cancelled upfront")
        .await
        .expect("stop recorded");
    assert!(!stopped);

    let status = scheduler.resume(&flow_id).await;

    assert_eq!(status.code, StatusCode::Unknown);
    let report = status.into_content().expect("run report");
    assert_eq!(report.step_errors[0].code, StatusCode::Cancelled);
    assert_eq!(report.step_errors[0].message, "cancelled upfront");
    assert_eq!(invocations.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_cancel_stops_run() {
    let provider = InMemoryStateStoreProvider::new();
    let scheduler = scheduler(&provider, registry(Arc::new(AtomicU32::new(0))));
    let flow_id = scheduler.start(waiting(), trigger(vec![])).await.expect("flow starts");

    let run = {
        let scheduler = scheduler.clone();
        let flow_id = flow_id.clone();
        tokio::spawn(async move { scheduler.resume(&flow_id).await })
    };
    live_worker(&scheduler).await;
    assert!(scheduler.cancel(&flow_id));

    let status = run.await.expect("run task finishes");
    assert_eq!(status.code, StatusCode::Cancelled);
    let report = status.into_content().expect("run report");
    assert_eq!(report.flow.status, FlowStatus::Cancelled);
    assert!(!scheduler.cancel(&flow_id));
}

#[tokio::test]
async fn test_first_response_wins() {
    let provider = InMemoryStateStoreProvider::new();
    let scheduler = scheduler(&provider, registry(Arc::new(AtomicU32::new(0))));
    let flow_id = scheduler
        .start(fixture("ask_question.yaml"), trigger(vec![]))
        .await
        .expect("flow starts");

    let run = {
        let scheduler = scheduler.clone();
        let flow_id = flow_id.clone();
        tokio::spawn(async move { scheduler.resume(&flow_id).await })
    };
    let request_id = pending_request(&scheduler, &flow_id).await;
    assert_eq!(request_id, format!("{}:ask:0", flow_id));

    let respond = |answer: &str| ExternalInputResponse {
        request_id: request_id.clone(),
        kind: ExternalInputKind::HumanInput,
        data: json!({ "answer": answer }),
    };
    assert!(scheduler
        .submit_external_input(&flow_id, respond("yes"))
        .await
        .expect("response recorded"));
    assert!(!scheduler
        .submit_external_input(&flow_id, respond("no"))
        .await
        .expect("duplicate ignored"));

    let status = run.await.expect("run task finishes");
    assert_eq!(status.code, StatusCode::Ok, "{:?}", status.message);
    let report = status.into_content().expect("run report");
    assert_eq!(
        report.output("answer").map(|o| o.payload.clone()),
        Some(Payload::text("yes"))
    );
    assert!(scheduler
        .pending_requests(&flow_id)
        .await
        .expect("history readable")
        .is_empty());
}
