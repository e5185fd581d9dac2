//! DAG construction, cycle detection, and ready-set computation.
//!
//! Uses `petgraph` to model step dependencies as a directed graph built once
//! at registration time. Topological sort detects cycles eagerly; at run time
//! the runner asks the graph which steps are ready given the statuses seen so
//! far.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use cadence_types::workflow::{StepDefinition, StepStatus, WorkflowDefinition};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use petgraph::Direction;

use super::WorkflowError;

// ---------------------------------------------------------------------------
// WorkflowGraph
// ---------------------------------------------------------------------------

/// A validated workflow definition together with its dependency graph.
///
/// Edges point from a dependency to its dependent. Node weights are indices
/// into `definition.steps`.
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    definition: WorkflowDefinition,
    graph: DiGraph<usize, ()>,
    nodes: HashMap<String, NodeIndex>,
}

impl WorkflowGraph {
    /// Validate `definition` and build its graph.
    ///
    /// Rejects empty workflows, zero concurrency, duplicate step names,
    /// duplicate `step_order` values, unknown dependencies, and cycles.
    pub fn build(definition: WorkflowDefinition) -> Result<Self, WorkflowError> {
        if definition.name.trim().is_empty() {
            return Err(WorkflowError::InvalidDefinition(
                "workflow name must not be empty".to_string(),
            ));
        }
        if definition.steps.is_empty() {
            return Err(WorkflowError::Empty(definition.name.clone()));
        }
        if definition.max_concurrency == 0 {
            return Err(WorkflowError::InvalidDefinition(format!(
                "workflow '{}' has max_concurrency 0",
                definition.name
            )));
        }

        let mut graph = DiGraph::<usize, ()>::new();
        let mut nodes: HashMap<String, NodeIndex> = HashMap::new();
        let mut orders: HashMap<u32, &str> = HashMap::new();

        for (i, step) in definition.steps.iter().enumerate() {
            if nodes.contains_key(&step.name) {
                return Err(WorkflowError::DuplicateStep(step.name.clone()));
            }
            if let Some(first) = orders.insert(step.step_order, step.name.as_str()) {
                return Err(WorkflowError::DuplicateOrder {
                    order: step.step_order,
                    first: first.to_string(),
                    second: step.name.clone(),
                });
            }
            nodes.insert(step.name.clone(), graph.add_node(i));
        }

        for step in &definition.steps {
            let to = nodes[&step.name];
            for dep in &step.depends_on {
                let from = nodes.get(dep).ok_or_else(|| {
                    WorkflowError::UnknownDependency(format!(
                        "step '{}' depends on unknown step '{}'",
                        step.name, dep
                    ))
                })?;
                graph.add_edge(*from, to, ());
            }
        }

        // Topological sort -- detects cycles (including self-dependencies)
        toposort(&graph, None).map_err(|cycle| {
            let step = &definition.steps[graph[cycle.node_id()]];
            WorkflowError::CycleDetected(format!("cycle detected involving step '{}'", step.name))
        })?;

        Ok(Self {
            definition,
            graph,
            nodes,
        })
    }

    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn len(&self) -> usize {
        self.definition.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definition.steps.is_empty()
    }

    pub fn step(&self, name: &str) -> Option<&StepDefinition> {
        self.nodes.get(name).map(|n| &self.definition.steps[self.graph[*n]])
    }

    /// Steps sorted by `step_order`.
    pub fn steps_by_order(&self) -> Vec<&StepDefinition> {
        let mut steps: Vec<&StepDefinition> = self.definition.steps.iter().collect();
        steps.sort_by_key(|s| s.step_order);
        steps
    }

    /// Serial execution order: a topological order where ties between ready
    /// steps go to the lowest `step_order`. This is the exact dispatch order
    /// of a run with `max_concurrency = 1` when every step succeeds.
    pub fn execution_plan(&self) -> Vec<&StepDefinition> {
        let mut in_degree: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|n| (n, self.graph.neighbors_directed(n, Direction::Incoming).count()))
            .collect();

        let mut heap = BinaryHeap::new();
        for (node, degree) in &in_degree {
            if *degree == 0 {
                heap.push(Reverse((self.step_at(*node).step_order, *node)));
            }
        }

        let mut plan = Vec::with_capacity(self.len());
        while let Some(Reverse((_, node))) = heap.pop() {
            plan.push(self.step_at(node));
            for next in self.graph.neighbors_directed(node, Direction::Outgoing) {
                if let Some(degree) = in_degree.get_mut(&next) {
                    *degree -= 1;
                    if *degree == 0 {
                        heap.push(Reverse((self.step_at(next).step_order, next)));
                    }
                }
            }
        }
        plan
    }

    /// Steps not yet started whose dependencies have all completed, in
    /// ascending `step_order`. Steps absent from `statuses` count as pending.
    pub fn ready_steps(&self, statuses: &HashMap<String, StepStatus>) -> Vec<&StepDefinition> {
        let mut ready: Vec<&StepDefinition> = self
            .definition
            .steps
            .iter()
            .filter(|step| {
                statuses
                    .get(&step.name)
                    .is_none_or(|s| *s == StepStatus::Pending)
            })
            .filter(|step| {
                step.depends_on
                    .iter()
                    .all(|dep| statuses.get(dep) == Some(&StepStatus::Completed))
            })
            .collect();
        ready.sort_by_key(|s| s.step_order);
        ready
    }

    /// Every step reachable downstream of `name`, in ascending `step_order`.
    pub fn transitive_dependents(&self, name: &str) -> Vec<&StepDefinition> {
        let Some(start) = self.nodes.get(name) else {
            return Vec::new();
        };
        let mut dfs = Dfs::new(&self.graph, *start);
        let mut found = Vec::new();
        while let Some(node) = dfs.next(&self.graph) {
            if node != *start {
                found.push(self.step_at(node));
            }
        }
        found.sort_by_key(|s| s.step_order);
        found
    }

    fn step_at(&self, node: NodeIndex) -> &StepDefinition {
        &self.definition.steps[self.graph[node]]
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
