//! Durable signal plumbing between running actions and the outside world.
//!
//! Requests, responses and stop requests are appended to a [`SignalHistory`],
//! so a process that restarts mid-run sees everything that happened before.
//! Live tasks additionally register a cancellation token here so that a stop
//! request reaches them without waiting for their next poll.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::flow::{FlowId, StepId};
use crate::domain::signals::{
    ExternalInputRequest, ExternalInputResponse, Signal, SignalHistory, StopWorker,
};
use crate::CoreError;

/// Bridge between actions and the durable signal history
pub struct ExternalIoBridge {
    history: Arc<dyn SignalHistory>,
    poll_interval: Duration,
    workers: DashMap<String, CancellationToken>,
}

impl ExternalIoBridge {
    /// Create a bridge over a signal history
    pub fn new(history: Arc<dyn SignalHistory>, poll_interval: Duration) -> Self {
        Self {
            history,
            poll_interval,
            workers: DashMap::new(),
        }
    }

    /// Deterministic id of the `sequence`-th request made by a step
    pub fn request_id(flow_id: &FlowId, step_id: &StepId, sequence: u32) -> String {
        format!("{}:{}:{}", flow_id, step_id, sequence)
    }

    fn worker_key(flow_id: &FlowId, task_id: &str) -> String {
        format!("{}/{}", flow_id, task_id)
    }

    /// Record a request unless it is already in the history, then wait for its response
    pub async fn request_input(
        &self,
        flow_id: &FlowId,
        request: ExternalInputRequest,
        cancel: &CancellationToken,
    ) -> Result<ExternalInputResponse, CoreError> {
        let request_id = request.request_id.clone();
        let already_requested = self.history.list(flow_id).await?.iter().any(|record| {
            matches!(&record.signal, Signal::ExternalInputRequest(existing) if existing.request_id == request_id)
        });

        if already_requested {
            debug!(flow_id = %flow_id, request_id = %request_id, "Re-attaching to earlier input request");
        } else {
            info!(
                flow_id = %flow_id,
                step_id = %request.step_id,
                request_id = %request_id,
                "Requesting external input"
            );
            self.history
                .append(flow_id, Signal::ExternalInputRequest(request))
                .await?;
        }

        loop {
            if let Some(response) = self.get_external_input_response(flow_id, &request_id).await? {
                debug!(flow_id = %flow_id, request_id = %request_id, "Received external input");
                return Ok(response);
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(CoreError::Cancelled(format!(
                        "stopped while waiting for input request {}",
                        request_id
                    )));
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// Record a response. The first response per request id wins; later ones are ignored.
    ///
    /// Returns whether the response was recorded.
    pub async fn submit_response(
        &self,
        flow_id: &FlowId,
        response: ExternalInputResponse,
    ) -> Result<bool, CoreError> {
        let history = self.history.list(flow_id).await?;
        let mut requested = false;
        for record in &history {
            match &record.signal {
                Signal::ExternalInputResponse(existing)
                    if existing.request_id == response.request_id =>
                {
                    warn!(
                        flow_id = %flow_id,
                        request_id = %response.request_id,
                        "Ignoring duplicate external input response"
                    );
                    return Ok(false);
                }
                Signal::ExternalInputRequest(request)
                    if request.request_id == response.request_id =>
                {
                    requested = true
                }
                _ => {}
            }
        }
        if !requested {
            debug!(
                flow_id = %flow_id,
                request_id = %response.request_id,
                "Recording response ahead of its request"
            );
        }
        self.history
            .append(flow_id, Signal::ExternalInputResponse(response))
            .await?;
        Ok(true)
    }

    /// The first response recorded for a request, if any
    pub async fn get_external_input_response(
        &self,
        flow_id: &FlowId,
        request_id: &str,
    ) -> Result<Option<ExternalInputResponse>, CoreError> {
        Ok(self
            .history
            .list(flow_id)
            .await?
            .into_iter()
            .find_map(|record| match record.signal {
                Signal::ExternalInputResponse(response) if response.request_id == request_id => {
                    Some(response)
                }
                _ => None,
            }))
    }

    /// Requests that have no response yet, in request order
    pub async fn pending_requests(
        &self,
        flow_id: &FlowId,
    ) -> Result<Vec<ExternalInputRequest>, CoreError> {
        let history = self.history.list(flow_id).await?;
        let answered: Vec<&str> = history
            .iter()
            .filter_map(|record| match &record.signal {
                Signal::ExternalInputResponse(response) => Some(response.request_id.as_str()),
                _ => None,
            })
            .collect();
        Ok(history
            .iter()
            .filter_map(|record| match &record.signal {
                Signal::ExternalInputRequest(request)
                    if !answered.contains(&request.request_id.as_str()) =>
                {
                    Some(request.clone())
                }
                _ => None,
            })
            .collect())
    }

    /// Record a stop request and cancel the task if it is running in this process.
    ///
    /// Returns whether a live task was cancelled.
    pub async fn stop_worker(&self, flow_id: &FlowId, stop: StopWorker) -> Result<bool, CoreError> {
        let key = Self::worker_key(flow_id, &stop.task_id);
        info!(
            flow_id = %flow_id,
            task_id = %stop.task_id,
            explanation = %stop.explanation,
            "Stop requested"
        );
        self.history.append(flow_id, Signal::StopWorker(stop)).await?;
        match self.workers.get(&key) {
            Some(token) => {
                token.cancel();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// The first stop request recorded for a task, if any
    pub async fn stop_request(
        &self,
        flow_id: &FlowId,
        task_id: &str,
    ) -> Result<Option<StopWorker>, CoreError> {
        Ok(self
            .history
            .list(flow_id)
            .await?
            .into_iter()
            .find_map(|record| match record.signal {
                Signal::StopWorker(stop) if stop.task_id == task_id => Some(stop),
                _ => None,
            }))
    }

    /// Make a running task reachable by [`Self::stop_worker`]
    pub fn register_worker(&self, flow_id: &FlowId, task_id: &str, token: CancellationToken) {
        self.workers.insert(Self::worker_key(flow_id, task_id), token);
    }

    /// Forget a task once it has finished
    pub fn unregister_worker(&self, flow_id: &FlowId, task_id: &str) {
        self.workers.remove(&Self::worker_key(flow_id, task_id));
    }

    /// Number of tasks currently registered
    pub fn live_workers(&self) -> usize {
        self.workers.len()
    }
}
