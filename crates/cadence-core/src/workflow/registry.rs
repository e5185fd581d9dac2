//! Registry of validated workflow definitions.

use std::sync::Arc;

use cadence_types::workflow::WorkflowDefinition;
use dashmap::DashMap;

use super::dag::WorkflowGraph;
use super::WorkflowError;

/// Workflow definitions keyed by name, each validated into a
/// [`WorkflowGraph`] when registered.
#[derive(Debug, Default)]
pub struct WorkflowRegistry {
    workflows: DashMap<String, Arc<WorkflowGraph>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and register `definition`, replacing any previous version.
    pub fn register(&self, definition: WorkflowDefinition) -> Result<Arc<WorkflowGraph>, WorkflowError> {
        let graph = Arc::new(WorkflowGraph::build(definition)?);
        self.workflows
            .insert(graph.name().to_string(), Arc::clone(&graph));
        tracing::info!(workflow = graph.name(), steps = graph.len(), "workflow registered");
        Ok(graph)
    }

    pub fn get(&self, name: &str) -> Option<Arc<WorkflowGraph>> {
        self.workflows.get(name).map(|g| Arc::clone(g.value()))
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<WorkflowGraph>, WorkflowError> {
        self.get(name)
            .ok_or_else(|| WorkflowError::NotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.workflows.contains_key(name)
    }

    pub fn remove(&self, name: &str) -> bool {
        self.workflows.remove(name).is_some()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.workflows.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}
