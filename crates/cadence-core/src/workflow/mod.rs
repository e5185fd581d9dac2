//! Workflow engine core: DAG validation, the workflow registry, and the
//! ready-set DAG runner.
//!
//! - `dag` -- graph construction, eager cycle detection, ready-set computation
//! - `registry` -- validated workflow definitions keyed by name
//! - `runner` -- bounded-concurrency step dispatch with StepRun tracking

pub mod dag;
pub mod registry;
pub mod runner;

use cadence_types::error::PipelineError;

/// Errors raised while registering or resolving workflows.
///
/// Every variant is a configuration problem: it is detected before any step
/// runs and retrying cannot fix it.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("workflow '{0}' has no steps")]
    Empty(String),

    #[error("cycle detected: {0}")]
    CycleDetected(String),

    #[error("unknown dependency: {0}")]
    UnknownDependency(String),

    #[error("duplicate step name '{0}'")]
    DuplicateStep(String),

    #[error("duplicate step_order {order} on steps '{first}' and '{second}'")]
    DuplicateOrder {
        order: u32,
        first: String,
        second: String,
    },

    #[error("invalid workflow definition: {0}")]
    InvalidDefinition(String),

    #[error("workflow '{0}' is not registered")]
    NotFound(String),
}

impl From<WorkflowError> for PipelineError {
    fn from(err: WorkflowError) -> Self {
        PipelineError::configuration(err.to_string())
    }
}
