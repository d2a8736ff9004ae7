use async_trait::async_trait;

use crate::domain::flow::{Flow, FlowId, FlowStatus};
use crate::domain::flow_definition::{FlowDefinition, FlowDefinitionId};
use crate::CoreError;

/// Repository for flows, checkpointed after every round
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FlowRepository: Send + Sync {
    /// Find a flow by ID
    async fn find_by_id(&self, id: &FlowId) -> Result<Option<Flow>, CoreError>;

    /// Save a flow, replacing any earlier checkpoint
    async fn save(&self, flow: &Flow) -> Result<(), CoreError>;

    /// Delete a flow
    async fn delete(&self, id: &FlowId) -> Result<(), CoreError>;

    /// List flows, optionally filtered by status
    async fn list(&self, status: Option<FlowStatus>) -> Result<Vec<Flow>, CoreError>;
}

/// Repository for flow definitions
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FlowDefinitionRepository: Send + Sync {
    /// Find a flow definition by ID
    async fn find_by_id(&self, id: &FlowDefinitionId) -> Result<Option<FlowDefinition>, CoreError>;

    /// Save a flow definition
    async fn save(&self, definition: &FlowDefinition) -> Result<(), CoreError>;

    /// Delete a flow definition
    async fn delete(&self, id: &FlowDefinitionId) -> Result<(), CoreError>;

    /// List all flow definition IDs
    async fn list(&self) -> Result<Vec<FlowDefinitionId>, CoreError>;
}
