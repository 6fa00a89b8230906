use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;

use maestro_core::error::Result;
use maestro_core::traits::Agent;
use maestro_core::workflow::WorkflowDefinition;

/// Registered workflow definitions, keyed by id.
///
/// Registering an id that already exists replaces the old definition. Runs
/// already in flight keep the `Arc` they started with.
#[derive(Default)]
pub struct WorkflowRegistry {
    workflows: RwLock<HashMap<String, Arc<WorkflowDefinition>>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and store a definition.
    pub async fn register(&self, workflow: WorkflowDefinition) -> Result<()> {
        workflow.validate()?;
        let id = workflow.id.clone();
        let steps = workflow.steps.len();
        let replaced = self
            .workflows
            .write()
            .await
            .insert(id.clone(), Arc::new(workflow))
            .is_some();
        info!(workflow_id = %id, steps, replaced, "Workflow registered");
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Option<Arc<WorkflowDefinition>> {
        self.workflows.read().await.get(id).cloned()
    }

    /// All definitions, ordered by id.
    pub async fn list(&self) -> Vec<Arc<WorkflowDefinition>> {
        let mut all: Vec<_> = self.workflows.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }
}

/// Registered agents, keyed by the id steps refer to them by.
#[derive(Default)]
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, Arc<dyn Agent>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent. An existing agent with the same id is replaced.
    pub async fn register(&self, id: impl Into<String>, agent: Arc<dyn Agent>) {
        let id = id.into();
        info!(agent_id = %id, "Agent registered");
        self.agents.write().await.insert(id, agent);
    }

    pub async fn get(&self, id: &str) -> Option<Arc<dyn Agent>> {
        self.agents.read().await.get(id).cloned()
    }

    /// Registered agent ids, sorted.
    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.agents.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}
