//! Time-based triggering of workflows.
//!
//! - `trigger` -- schedule string normalization and next-fire computation
//! - `scheduler` -- the tick loop that fires due schedules and records job runs

pub mod scheduler;
pub mod trigger;

use cadence_types::error::{PipelineError, RepositoryError};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during scheduling operations.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// Invalid cron expression, interval, or schedule definition.
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("unknown timezone '{0}'")]
    InvalidTimezone(String),

    #[error("schedule '{0}' not found")]
    ScheduleNotFound(String),

    #[error(transparent)]
    Store(#[from] RepositoryError),
}

impl From<SchedulerError> for PipelineError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::Store(e) => e.into(),
            other => PipelineError::configuration(other.to_string()),
        }
    }
}
