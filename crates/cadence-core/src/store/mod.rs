//! State store trait definition (port).
//!
//! `StateStore` is the persistence contract for every engine entity. The
//! infrastructure layer (cadence-infra) implements it with SQLite; the
//! in-memory implementation in [`memory`] backs tests and embedded use.

pub mod memory;

use std::future::Future;

use cadence_types::dead_letter::{DeadLetter, DeadLetterFilter};
use cadence_types::error::RepositoryError;
use cadence_types::run::{Page, Run, RunFilter, RunStats, RunTransition};
use cadence_types::schedule::{JobRun, Schedule};
use cadence_types::workflow::{StepRun, WorkflowRun};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Row counts removed by a retention purge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeReport {
    pub runs: u64,
    pub step_runs: u64,
    pub job_runs: u64,
    pub dead_letters: u64,
}

/// Durable storage for runs, steps, schedules, job runs and dead letters.
///
/// Covers five entity families:
/// - **Runs:** idempotent creation, compare-and-set status transitions, queries.
/// - **Steps:** per-step execution records of workflow runs.
/// - **Schedules:** whole-value upsert and delete.
/// - **Job runs:** schedule firing history.
/// - **Dead letters:** exhausted work awaiting replay.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait StateStore: Send + Sync {
    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Insert a run. If `run.idempotency_key` is already taken, the existing
    /// run is returned unchanged and nothing is written.
    fn create_run(&self, run: &Run) -> impl Future<Output = Result<Run, RepositoryError>> + Send;

    /// Insert a workflow run with the same idempotency rule as `create_run`.
    fn create_workflow_run(
        &self,
        run: &WorkflowRun,
    ) -> impl Future<Output = Result<WorkflowRun, RepositoryError>> + Send;

    fn get_run(&self, run_id: &Uuid) -> impl Future<Output = Result<Option<Run>, RepositoryError>> + Send;

    fn get_workflow_run(
        &self,
        run_id: &Uuid,
    ) -> impl Future<Output = Result<Option<WorkflowRun>, RepositoryError>> + Send;

    /// Atomically apply `transition` to a run.
    ///
    /// Fails with `Conflict` when the stored `(status, attempt)` differs from
    /// the transition's expectation, and with `InvalidTransition` when the
    /// state machine forbids the move. Returns the updated run.
    fn transition_run(
        &self,
        run_id: &Uuid,
        transition: &RunTransition,
    ) -> impl Future<Output = Result<Run, RepositoryError>> + Send;

    /// Set the `cancel_requested` flag. Returns the updated run.
    fn request_cancel(&self, run_id: &Uuid) -> impl Future<Output = Result<Run, RepositoryError>> + Send;

    /// Runs matching `filter`, newest first, plus the unpaginated total.
    fn list_runs(
        &self,
        filter: &RunFilter,
        limit: u32,
        offset: u32,
    ) -> impl Future<Output = Result<Page<Run>, RepositoryError>> + Send;

    /// Pending runs whose backoff has elapsed at `now`, highest priority
    /// first then oldest first. Callers claim a run by transitioning it to
    /// `running`; losing that race yields `Conflict`.
    fn claim_due_runs(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> impl Future<Output = Result<Vec<Run>, RepositoryError>> + Send;

    fn run_stats(&self, filter: &RunFilter) -> impl Future<Output = Result<RunStats, RepositoryError>> + Send;

    /// Replace the accumulated outputs and metrics of a workflow run.
    fn update_workflow_outputs(
        &self,
        run_id: &Uuid,
        outputs: &std::collections::HashMap<String, serde_json::Value>,
        metrics: &std::collections::HashMap<String, serde_json::Value>,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    fn create_step_run(&self, step: &StepRun) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// Overwrite the mutable fields of an existing step run.
    fn update_step_run(&self, step: &StepRun) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// Step runs of a workflow run ordered by `step_order`.
    fn list_step_runs(
        &self,
        run_id: &Uuid,
    ) -> impl Future<Output = Result<Vec<StepRun>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Schedules
    // -----------------------------------------------------------------------

    /// Insert or replace a schedule by name.
    fn upsert_schedule(&self, schedule: &Schedule) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    fn get_schedule(&self, name: &str) -> impl Future<Output = Result<Option<Schedule>, RepositoryError>> + Send;

    /// Delete a schedule by name. Returns `true` if it existed.
    fn delete_schedule(&self, name: &str) -> impl Future<Output = Result<bool, RepositoryError>> + Send;

    /// All schedules ordered by name.
    fn list_schedules(&self) -> impl Future<Output = Result<Vec<Schedule>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Job runs
    // -----------------------------------------------------------------------

    /// Insert or replace a job run by id.
    fn record_job_run(&self, job: &JobRun) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// Most recent job runs of a schedule, newest first.
    fn list_job_runs(
        &self,
        schedule_name: &str,
        limit: u32,
    ) -> impl Future<Output = Result<Vec<JobRun>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Dead letters
    // -----------------------------------------------------------------------

    fn write_dead_letter(&self, letter: &DeadLetter) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    fn get_dead_letter(
        &self,
        id: &Uuid,
    ) -> impl Future<Output = Result<Option<DeadLetter>, RepositoryError>> + Send;

    /// Replace an existing dead letter.
    fn update_dead_letter(&self, letter: &DeadLetter) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    fn list_dead_letters(
        &self,
        filter: &DeadLetterFilter,
        limit: u32,
        offset: u32,
    ) -> impl Future<Output = Result<Page<DeadLetter>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Retention
    // -----------------------------------------------------------------------

    /// Delete terminal history that finished before `cutoff`: finished runs
    /// (with their step runs), terminal job runs, and resolved dead letters.
    fn purge_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> impl Future<Output = Result<PurgeReport, RepositoryError>> + Send;
}
