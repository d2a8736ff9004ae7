use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use serde_json::json;
use tributary_core::{
    ExternalInputKind, ExternalInputResponse, FlowRepository, FlowStatus, Payload, Signal,
    SignalHistory, StatusCode,
};
use tributary_state_inmemory::InMemoryStateStoreProvider;
use tributary_tests::{fixture, registry, scheduler, trigger, wait_until};

// A process dies while a step waits for input. A fresh process over the same
// stores re-runs the step, re-attaches to the original request and finishes.
#[tokio::test]
async fn test_restarted_process_reattaches_to_pending_request() {
    let provider = InMemoryStateStoreProvider::new();
    let invocations = Arc::new(AtomicU32::new(0));

    let first = scheduler(&provider, registry(invocations.clone()));
    let flow_id = first
        .start(fixture("ask_question.yaml"), trigger(vec![]))
        .await
        .expect("flow starts");

    let running = {
        let first = first.clone();
        let flow_id = flow_id.clone();
        tokio::spawn(async move { first.resume(&flow_id).await })
    };
    wait_until(|| {
        let first = first.clone();
        let flow_id = flow_id.clone();
        async move {
            !first
                .pending_requests(&flow_id)
                .await
                .unwrap_or_default()
                .is_empty()
        }
    })
    .await;
    running.abort();
    assert!(running.await.unwrap_err().is_cancelled());

    let (flows, _, signals) = provider.create_repositories();
    let checkpoint = flows
        .find_by_id(&flow_id)
        .await
        .expect("store readable")
        .expect("flow checkpointed");
    assert_eq!(checkpoint.status, FlowStatus::Running);
    assert_eq!(checkpoint.round, 0);

    let second = scheduler(&provider, registry(invocations.clone()));
    let resumed = {
        let second = second.clone();
        let flow_id = flow_id.clone();
        tokio::spawn(async move { second.resume(&flow_id).await })
    };
    wait_until(|| {
        let invocations = invocations.clone();
        async move { invocations.load(Ordering::SeqCst) == 2 }
    })
    .await;

    let requests: Vec<String> = signals
        .list(&flow_id)
        .await
        .expect("history readable")
        .into_iter()
        .filter_map(|record| match record.signal {
            Signal::ExternalInputRequest(request) => Some(request.request_id),
            _ => None,
        })
        .collect();
    assert_eq!(requests, vec![format!("{}:ask:0", flow_id)]);

    let accepted = second
        .submit_external_input(
            &flow_id,
            ExternalInputResponse {
                request_id: requests[0].clone(),
                kind: ExternalInputKind::HumanInput,
                data: json!({ "answer": "yes" }),
            },
        )
        .await
        .expect("response recorded");
    assert!(accepted);

    let status = resumed.await.expect("run task finishes");
    assert_eq!(status.code, StatusCode::Ok, "{:?}", status.message);
    let report = status.into_content().expect("run report");
    assert_eq!(
        report.output("answer").map(|o| o.payload.clone()),
        Some(Payload::text("yes"))
    );
    assert_eq!(invocations.load(Ordering::SeqCst), 2);
}

// Resuming a terminated flow reports it without running anything
#[tokio::test]
async fn test_resume_of_terminated_flow_is_a_no_op() {
    let provider = InMemoryStateStoreProvider::new();
    let invocations = Arc::new(AtomicU32::new(0));
    let scheduler = scheduler(&provider, registry(invocations.clone()));

    let flow_id = scheduler
        .start(fixture("ask_question.yaml"), trigger(vec![]))
        .await
        .expect("flow starts");
    scheduler
        .submit_external_input(
            &flow_id,
            ExternalInputResponse {
                request_id: format!("{}:ask:0", flow_id),
                kind: ExternalInputKind::HumanInput,
                data: json!({ "answer": "early" }),
            },
        )
        .await
        .expect("response recorded");

    let first = scheduler.resume(&flow_id).await;
    assert_eq!(first.code, StatusCode::Ok, "{:?}", first.message);
    assert_eq!(invocations.load(Ordering::SeqCst), 1);

    let again = scheduler.resume(&flow_id).await;
    assert_eq!(again.code, StatusCode::Ok);
    let report = again.into_content().expect("run report");
    assert_eq!(report.flow.status, FlowStatus::Completed);
    assert_eq!(
        report.output("answer").map(|o| o.payload.clone()),
        Some(Payload::text("early"))
    );
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
}
