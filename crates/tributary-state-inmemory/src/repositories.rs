use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use tributary_core::domain::signals::SignalRecord;
use tributary_core::{
    CoreError, Flow, FlowDefinition, FlowDefinitionId, FlowDefinitionRepository, FlowId,
    FlowRepository, FlowStatus, Signal, SignalHistory,
};

/// In-memory implementation of the FlowRepository
pub struct InMemoryFlowRepository {
    flows: Arc<RwLock<HashMap<String, Flow>>>,
}

impl InMemoryFlowRepository {
    /// Create a new in-memory flow repository
    pub fn new(flows: Arc<RwLock<HashMap<String, Flow>>>) -> Self {
        Self { flows }
    }
}

#[async_trait]
impl FlowRepository for InMemoryFlowRepository {
    async fn find_by_id(&self, id: &FlowId) -> Result<Option<Flow>, CoreError> {
        let flows = self.flows.read().await;
        Ok(flows.get(&id.0).cloned())
    }

    async fn save(&self, flow: &Flow) -> Result<(), CoreError> {
        let mut flows = self.flows.write().await;
        debug!(flow_id = %flow.flow_id, round = flow.round, "Checkpointing flow");
        flows.insert(flow.flow_id.0.clone(), flow.clone());
        Ok(())
    }

    async fn delete(&self, id: &FlowId) -> Result<(), CoreError> {
        let mut flows = self.flows.write().await;
        flows.remove(&id.0);
        Ok(())
    }

    async fn list(&self, status: Option<FlowStatus>) -> Result<Vec<Flow>, CoreError> {
        let flows = self.flows.read().await;
        let mut result: Vec<Flow> = flows
            .values()
            .filter(|flow| status.map_or(true, |status| flow.status == status))
            .cloned()
            .collect();
        result.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(result)
    }
}

/// In-memory implementation of the FlowDefinitionRepository
pub struct InMemoryFlowDefinitionRepository {
    definitions: Arc<RwLock<HashMap<String, FlowDefinition>>>,
}

impl InMemoryFlowDefinitionRepository {
    /// Create a new in-memory flow definition repository
    pub fn new(definitions: Arc<RwLock<HashMap<String, FlowDefinition>>>) -> Self {
        Self { definitions }
    }
}

#[async_trait]
impl FlowDefinitionRepository for InMemoryFlowDefinitionRepository {
    async fn find_by_id(&self, id: &FlowDefinitionId) -> Result<Option<FlowDefinition>, CoreError> {
        let definitions = self.definitions.read().await;
        Ok(definitions.get(&id.0).cloned())
    }

    async fn save(&self, definition: &FlowDefinition) -> Result<(), CoreError> {
        let mut definitions = self.definitions.write().await;
        definitions.insert(definition.flow_definition_id.0.clone(), definition.clone());
        Ok(())
    }

    async fn delete(&self, id: &FlowDefinitionId) -> Result<(), CoreError> {
        let mut definitions = self.definitions.write().await;
        definitions.remove(&id.0);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<FlowDefinitionId>, CoreError> {
        let definitions = self.definitions.read().await;
        let mut ids: Vec<FlowDefinitionId> = definitions
            .values()
            .map(|definition| definition.flow_definition_id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }
}

/// In-memory implementation of the SignalHistory
pub struct InMemorySignalHistory {
    records: Arc<RwLock<HashMap<String, Vec<SignalRecord>>>>,
}

impl InMemorySignalHistory {
    /// Create a new in-memory signal history
    pub fn new(records: Arc<RwLock<HashMap<String, Vec<SignalRecord>>>>) -> Self {
        Self { records }
    }
}

#[async_trait]
impl SignalHistory for InMemorySignalHistory {
    async fn append(&self, flow_id: &FlowId, signal: Signal) -> Result<u64, CoreError> {
        let mut records = self.records.write().await;
        let log = records.entry(flow_id.0.clone()).or_default();
        let sequence = log.len() as u64;
        log.push(SignalRecord {
            sequence,
            recorded_at: Utc::now(),
            signal,
        });
        Ok(sequence)
    }

    async fn list(&self, flow_id: &FlowId) -> Result<Vec<SignalRecord>, CoreError> {
        let records = self.records.read().await;
        Ok(records.get(&flow_id.0).cloned().unwrap_or_default())
    }
}
