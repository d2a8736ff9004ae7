//! In-memory state store implementation for Tributary
//!
//! This crate provides in-memory implementations of the repository and
//! signal history interfaces defined in tributary-core. State lives as long
//! as the provider, so a scheduler rebuilt over the same provider sees every
//! checkpoint and signal written before it.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

pub mod repositories;
pub use repositories::{
    InMemoryFlowDefinitionRepository, InMemoryFlowRepository, InMemorySignalHistory,
};

use tributary_core::domain::signals::SignalRecord;
use tributary_core::{
    Flow, FlowDefinition, FlowDefinitionRepository, FlowRepository, SignalHistory,
};

/// Provider for in-memory state store repositories
#[derive(Clone, Default)]
pub struct InMemoryStateStoreProvider {
    // Flows keyed by flow id
    flows: Arc<RwLock<HashMap<String, Flow>>>,

    // Definitions keyed by definition id
    flow_definitions: Arc<RwLock<HashMap<String, FlowDefinition>>>,

    // Append-only signal log per flow id
    signals: Arc<RwLock<HashMap<String, Vec<SignalRecord>>>>,
}

impl InMemoryStateStoreProvider {
    /// Create a new in-memory state store provider
    pub fn new() -> Self {
        Self::default()
    }

    /// Create repositories sharing this provider's storage
    pub fn create_repositories(
        &self,
    ) -> (
        Arc<dyn FlowRepository>,
        Arc<dyn FlowDefinitionRepository>,
        Arc<dyn SignalHistory>,
    ) {
        (
            Arc::new(InMemoryFlowRepository::new(self.flows.clone())),
            Arc::new(InMemoryFlowDefinitionRepository::new(
                self.flow_definitions.clone(),
            )),
            Arc::new(InMemorySignalHistory::new(self.signals.clone())),
        )
    }
}
