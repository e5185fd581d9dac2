//! SQLite `StateStore` implementation.
//!
//! Implements `StateStore` from `cadence-core` using sqlx with split
//! read/write pools. Runs of every kind share the `runs` table; workflow
//! runs fill the workflow-only columns. Status transitions are
//! compare-and-set updates on the single writer connection, so two
//! dispatchers can never both claim the same run.

use std::collections::HashMap;

use cadence_core::store::{PurgeReport, StateStore};
use cadence_types::dead_letter::{DeadLetter, DeadLetterFilter};
use cadence_types::error::RepositoryError;
use cadence_types::run::{Page, Run, RunFilter, RunStats, RunStatus, RunTransition};
use cadence_types::schedule::{JobRun, Schedule};
use cadence_types::workflow::{StepRun, WorkflowRun};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::sqlite::{Sqlite, SqliteRow};
use sqlx::{QueryBuilder, Row};
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `StateStore`.
#[derive(Clone)]
pub struct SqliteStateStore {
    pool: DatabasePool,
}

impl SqliteStateStore {
    /// Create a new store backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DatabasePool {
        &self.pool
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct RunRow {
    id: String,
    kind: String,
    name: String,
    status: String,
    params: String,
    result: Option<String>,
    error: Option<String>,
    error_category: Option<String>,
    retryable: Option<bool>,
    priority: i32,
    idempotency_key: Option<String>,
    attempt: i64,
    max_attempts: i64,
    created_at: String,
    started_at: Option<String>,
    finished_at: Option<String>,
    next_retry_at: Option<String>,
    cancel_requested: bool,
    metadata: String,
    workflow_name: Option<String>,
    domain: Option<String>,
    partition_key: Option<String>,
    outputs: Option<String>,
    metrics: Option<String>,
    triggered_by: Option<String>,
}

impl RunRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            kind: row.try_get("kind")?,
            name: row.try_get("name")?,
            status: row.try_get("status")?,
            params: row.try_get("params")?,
            result: row.try_get("result")?,
            error: row.try_get("error")?,
            error_category: row.try_get("error_category")?,
            retryable: row.try_get("retryable")?,
            priority: row.try_get("priority")?,
            idempotency_key: row.try_get("idempotency_key")?,
            attempt: row.try_get("attempt")?,
            max_attempts: row.try_get("max_attempts")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            next_retry_at: row.try_get("next_retry_at")?,
            cancel_requested: row.try_get("cancel_requested")?,
            metadata: row.try_get("metadata")?,
            workflow_name: row.try_get("workflow_name")?,
            domain: row.try_get("domain")?,
            partition_key: row.try_get("partition_key")?,
            outputs: row.try_get("outputs")?,
            metrics: row.try_get("metrics")?,
            triggered_by: row.try_get("triggered_by")?,
        })
    }

    fn into_run(self) -> Result<Run, RepositoryError> {
        Ok(Run {
            id: parse_uuid(&self.id)?,
            kind: parse_enum(&self.kind, "run kind")?,
            name: self.name,
            status: parse_enum(&self.status, "run status")?,
            params: parse_json(&self.params, "params")?,
            result: self.result.as_deref().map(|s| parse_json(s, "result")).transpose()?,
            error: self.error,
            error_category: self
                .error_category
                .as_deref()
                .map(|s| parse_enum(s, "error category"))
                .transpose()?,
            retryable: self.retryable,
            priority: self.priority,
            idempotency_key: self.idempotency_key,
            attempt: to_u32(self.attempt, "attempt")?,
            max_attempts: to_u32(self.max_attempts, "max_attempts")?,
            created_at: parse_datetime(&self.created_at)?,
            started_at: parse_opt_datetime(self.started_at.as_deref())?,
            finished_at: parse_opt_datetime(self.finished_at.as_deref())?,
            next_retry_at: parse_opt_datetime(self.next_retry_at.as_deref())?,
            cancel_requested: self.cancel_requested,
            metadata: parse_json(&self.metadata, "metadata")?,
        })
    }

    /// `None` for rows that are not workflow runs.
    fn into_workflow_run(mut self) -> Result<Option<WorkflowRun>, RepositoryError> {
        let Some(workflow_name) = self.workflow_name.take() else {
            return Ok(None);
        };
        let domain = self.domain.take();
        let partition_key = self.partition_key.take();
        let outputs: HashMap<String, serde_json::Value> = match self.outputs.take() {
            Some(s) => parse_json(&s, "outputs")?,
            None => HashMap::new(),
        };
        let metrics: HashMap<String, serde_json::Value> = match self.metrics.take() {
            Some(s) => parse_json(&s, "metrics")?,
            None => HashMap::new(),
        };
        let triggered_by = match self.triggered_by.take() {
            Some(s) => parse_enum(&s, "triggered_by")?,
            None => Default::default(),
        };

        Ok(Some(WorkflowRun {
            run: self.into_run()?,
            workflow_name,
            domain,
            partition_key,
            outputs,
            metrics,
            triggered_by,
        }))
    }
}

struct StepRunRow {
    id: String,
    run_id: String,
    step_name: String,
    step_type: String,
    step_order: i64,
    status: String,
    input_params: String,
    output_data: Option<String>,
    error: Option<String>,
    error_category: Option<String>,
    records_processed: i64,
    attempt: i64,
    max_attempts: i64,
    started_at: Option<String>,
    finished_at: Option<String>,
    duration_ms: Option<i64>,
}

impl StepRunRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            run_id: row.try_get("run_id")?,
            step_name: row.try_get("step_name")?,
            step_type: row.try_get("step_type")?,
            step_order: row.try_get("step_order")?,
            status: row.try_get("status")?,
            input_params: row.try_get("input_params")?,
            output_data: row.try_get("output_data")?,
            error: row.try_get("error")?,
            error_category: row.try_get("error_category")?,
            records_processed: row.try_get("records_processed")?,
            attempt: row.try_get("attempt")?,
            max_attempts: row.try_get("max_attempts")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            duration_ms: row.try_get("duration_ms")?,
        })
    }

    fn into_step_run(self) -> Result<StepRun, RepositoryError> {
        Ok(StepRun {
            id: parse_uuid(&self.id)?,
            run_id: parse_uuid(&self.run_id)?,
            step_name: self.step_name,
            step_type: self.step_type,
            step_order: to_u32(self.step_order, "step_order")?,
            status: parse_enum(&self.status, "step status")?,
            input_params: parse_json(&self.input_params, "input_params")?,
            output_data: self
                .output_data
                .as_deref()
                .map(|s| parse_json(s, "output_data"))
                .transpose()?,
            error: self.error,
            error_category: self
                .error_category
                .as_deref()
                .map(|s| parse_enum(s, "error category"))
                .transpose()?,
            records_processed: self.records_processed.max(0) as u64,
            attempt: to_u32(self.attempt, "attempt")?,
            max_attempts: to_u32(self.max_attempts, "max_attempts")?,
            started_at: parse_opt_datetime(self.started_at.as_deref())?,
            finished_at: parse_opt_datetime(self.finished_at.as_deref())?,
            duration_ms: self.duration_ms.map(|d| d.max(0) as u64),
        })
    }
}

struct ScheduleRow {
    name: String,
    workflow: String,
    trigger: String,
    timezone: String,
    params: String,
    enabled: bool,
    max_instances: i64,
    misfire_grace_seconds: i64,
    misfire_policy: String,
    created_at: String,
    updated_at: String,
}

impl ScheduleRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            name: row.try_get("name")?,
            workflow: row.try_get("workflow")?,
            trigger: row.try_get("trigger_spec")?,
            timezone: row.try_get("timezone")?,
            params: row.try_get("params")?,
            enabled: row.try_get("enabled")?,
            max_instances: row.try_get("max_instances")?,
            misfire_grace_seconds: row.try_get("misfire_grace_seconds")?,
            misfire_policy: row.try_get("misfire_policy")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_schedule(self) -> Result<Schedule, RepositoryError> {
        Ok(Schedule {
            name: self.name,
            workflow: self.workflow,
            trigger: parse_json(&self.trigger, "trigger")?,
            timezone: self.timezone,
            params: parse_json(&self.params, "params")?,
            enabled: self.enabled,
            max_instances: to_u32(self.max_instances, "max_instances")?,
            misfire_grace_seconds: self.misfire_grace_seconds.max(0) as u64,
            misfire_policy: parse_enum(&self.misfire_policy, "misfire policy")?,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

struct JobRunRow {
    id: String,
    schedule_name: String,
    status: String,
    scheduled_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    error: Option<String>,
    result: Option<String>,
    workflow_run_id: Option<String>,
}

impl JobRunRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            schedule_name: row.try_get("schedule_name")?,
            status: row.try_get("status")?,
            scheduled_at: row.try_get("scheduled_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            error: row.try_get("error")?,
            result: row.try_get("result")?,
            workflow_run_id: row.try_get("workflow_run_id")?,
        })
    }

    fn into_job_run(self) -> Result<JobRun, RepositoryError> {
        Ok(JobRun {
            id: parse_uuid(&self.id)?,
            schedule_name: self.schedule_name,
            status: parse_enum(&self.status, "job run status")?,
            scheduled_at: parse_datetime(&self.scheduled_at)?,
            started_at: parse_opt_datetime(self.started_at.as_deref())?,
            completed_at: parse_opt_datetime(self.completed_at.as_deref())?,
            error: self.error,
            result: self.result.as_deref().map(|s| parse_json(s, "result")).transpose()?,
            workflow_run_id: self.workflow_run_id.as_deref().map(parse_uuid).transpose()?,
        })
    }
}

struct DeadLetterRow {
    id: String,
    source_run_id: String,
    source_step: Option<String>,
    payload: String,
    error: String,
    error_category: String,
    retry_count: i64,
    max_retries: i64,
    first_failed_at: String,
    last_failed_at: String,
    next_retry_at: Option<String>,
    status: String,
    replay_attempts: String,
}

impl DeadLetterRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            source_run_id: row.try_get("source_run_id")?,
            source_step: row.try_get("source_step")?,
            payload: row.try_get("payload")?,
            error: row.try_get("error")?,
            error_category: row.try_get("error_category")?,
            retry_count: row.try_get("retry_count")?,
            max_retries: row.try_get("max_retries")?,
            first_failed_at: row.try_get("first_failed_at")?,
            last_failed_at: row.try_get("last_failed_at")?,
            next_retry_at: row.try_get("next_retry_at")?,
            status: row.try_get("status")?,
            replay_attempts: row.try_get("replay_attempts")?,
        })
    }

    fn into_dead_letter(self) -> Result<DeadLetter, RepositoryError> {
        Ok(DeadLetter {
            id: parse_uuid(&self.id)?,
            source_run_id: parse_uuid(&self.source_run_id)?,
            source_step: self.source_step,
            payload: parse_json(&self.payload, "payload")?,
            error: self.error,
            error_category: parse_enum(&self.error_category, "error category")?,
            retry_count: to_u32(self.retry_count, "retry_count")?,
            max_retries: to_u32(self.max_retries, "max_retries")?,
            first_failed_at: parse_datetime(&self.first_failed_at)?,
            last_failed_at: parse_datetime(&self.last_failed_at)?,
            next_retry_at: parse_opt_datetime(self.next_retry_at.as_deref())?,
            status: parse_enum(&self.status, "dead letter status")?,
            replay_attempts: parse_json(&self.replay_attempts, "replay_attempts")?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn db_err(e: sqlx::Error) -> RepositoryError {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            tracing::warn!("database connection error: {e}");
            RepositoryError::Connection
        }
        other => RepositoryError::Query(other.to_string()),
    }
}

fn row_err(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

fn is_constraint(e: &sqlx::Error, needle: &str) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.message().contains(needle))
}

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn parse_opt_datetime(s: Option<&str>) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    s.map(parse_datetime).transpose()
}

/// Fixed-width UTC so string comparison in SQL is chronological.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_json<T: DeserializeOwned>(s: &str, what: &str) -> Result<T, RepositoryError> {
    serde_json::from_str(s).map_err(|e| RepositoryError::Query(format!("invalid {what} JSON: {e}")))
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(format!("serialize: {e}")))
}

/// Decode a snake_case/SCREAMING_CASE enum column through its serde form.
fn parse_enum<T: DeserializeOwned>(s: &str, what: &str) -> Result<T, RepositoryError> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| RepositoryError::Query(format!("invalid {what}: {s}")))
}

fn to_u32(value: i64, what: &str) -> Result<u32, RepositoryError> {
    u32::try_from(value).map_err(|_| RepositoryError::Query(format!("{what} out of range: {value}")))
}

fn push_run_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: &RunFilter) {
    qb.push(" WHERE 1 = 1");
    if let Some(status) = filter.status {
        qb.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(kind) = filter.kind {
        qb.push(" AND kind = ").push_bind(kind.as_str());
    }
    if let Some(name) = &filter.name {
        qb.push(" AND name = ").push_bind(name.clone());
    }
    if let Some(since) = &filter.since {
        qb.push(" AND created_at >= ").push_bind(format_datetime(since));
    }
    if let Some(until) = &filter.until {
        qb.push(" AND created_at < ").push_bind(format_datetime(until));
    }
}

fn push_dead_letter_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: &DeadLetterFilter) {
    qb.push(" WHERE 1 = 1");
    if let Some(status) = filter.status {
        qb.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(category) = filter.category {
        qb.push(" AND error_category = ").push_bind(category.as_str());
    }
    if let Some(source) = &filter.source_run_id {
        qb.push(" AND source_run_id = ").push_bind(source.to_string());
    }
    if let Some(since) = &filter.since {
        qb.push(" AND last_failed_at >= ").push_bind(format_datetime(since));
    }
    if let Some(until) = &filter.until {
        qb.push(" AND last_failed_at < ").push_bind(format_datetime(until));
    }
}

impl SqliteStateStore {
    /// Insert a run row. Returns `false` if a uniqueness constraint (id or
    /// idempotency key) already holds the slot.
    async fn insert_run(&self, run: &Run, workflow: Option<&WorkflowRun>) -> Result<bool, RepositoryError> {
        let result_json = run.result.as_ref().map(to_json).transpose()?;
        let outputs = workflow.map(|w| to_json(&w.outputs)).transpose()?;
        let metrics = workflow.map(|w| to_json(&w.metrics)).transpose()?;

        let result = sqlx::query(
            r#"INSERT INTO runs
               (id, kind, name, status, params, result, error, error_category, retryable,
                priority, idempotency_key, attempt, max_attempts, created_at, started_at,
                finished_at, next_retry_at, cancel_requested, metadata,
                workflow_name, domain, partition_key, outputs, metrics, triggered_by)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT DO NOTHING"#,
        )
        .bind(run.id.to_string())
        .bind(run.kind.as_str())
        .bind(&run.name)
        .bind(run.status.as_str())
        .bind(to_json(&run.params)?)
        .bind(&result_json)
        .bind(&run.error)
        .bind(run.error_category.map(|c| c.as_str()))
        .bind(run.retryable)
        .bind(run.priority)
        .bind(&run.idempotency_key)
        .bind(i64::from(run.attempt))
        .bind(i64::from(run.max_attempts))
        .bind(format_datetime(&run.created_at))
        .bind(run.started_at.as_ref().map(format_datetime))
        .bind(run.finished_at.as_ref().map(format_datetime))
        .bind(run.next_retry_at.as_ref().map(format_datetime))
        .bind(run.cancel_requested)
        .bind(to_json(&run.metadata)?)
        .bind(workflow.map(|w| w.workflow_name.as_str()))
        .bind(workflow.and_then(|w| w.domain.as_deref()))
        .bind(workflow.and_then(|w| w.partition_key.as_deref()))
        .bind(&outputs)
        .bind(&metrics)
        .bind(workflow.map(|w| w.triggered_by.as_str()))
        .execute(&self.pool.writer)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn fetch_run_row(&self, run_id: &Uuid) -> Result<Option<RunRow>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM runs WHERE id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool.writer)
            .await
            .map_err(db_err)?;
        row.as_ref().map(RunRow::from_row).transpose().map_err(row_err)
    }

    /// The run holding `run`'s idempotency key, when the insert collided.
    async fn existing_for_key(&self, run: &Run) -> Result<RunRow, RepositoryError> {
        let Some(key) = &run.idempotency_key else {
            return Err(RepositoryError::Conflict(format!("run {} already exists", run.id)));
        };
        let row = sqlx::query("SELECT * FROM runs WHERE idempotency_key = ?")
            .bind(key)
            .fetch_optional(&self.pool.writer)
            .await
            .map_err(db_err)?
            .ok_or_else(|| RepositoryError::Conflict(format!("run {} already exists", run.id)))?;
        RunRow::from_row(&row).map_err(row_err)
    }
}

// ---------------------------------------------------------------------------
// StateStore impl
// ---------------------------------------------------------------------------

impl StateStore for SqliteStateStore {
    async fn create_run(&self, run: &Run) -> Result<Run, RepositoryError> {
        if self.insert_run(run, None).await? {
            return Ok(run.clone());
        }
        let existing = self.existing_for_key(run).await?.into_run()?;
        tracing::debug!(run_id = %existing.id, "idempotency key already used");
        Ok(existing)
    }

    async fn create_workflow_run(&self, run: &WorkflowRun) -> Result<WorkflowRun, RepositoryError> {
        if self.insert_run(&run.run, Some(run)).await? {
            return Ok(run.clone());
        }
        let existing = self.existing_for_key(&run.run).await?;
        let id = existing.id.clone();
        existing.into_workflow_run()?.ok_or_else(|| {
            RepositoryError::Conflict(format!("idempotency key belongs to non-workflow run {id}"))
        })
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<Run>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM runs WHERE id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(db_err)?;

        match row {
            Some(row) => Ok(Some(RunRow::from_row(&row).map_err(row_err)?.into_run()?)),
            None => Ok(None),
        }
    }

    async fn get_workflow_run(&self, run_id: &Uuid) -> Result<Option<WorkflowRun>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM runs WHERE id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(db_err)?;

        match row {
            Some(row) => RunRow::from_row(&row).map_err(row_err)?.into_workflow_run(),
            None => Ok(None),
        }
    }

    async fn transition_run(
        &self,
        run_id: &Uuid,
        transition: &RunTransition,
    ) -> Result<Run, RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(db_err)?;

        let row = sqlx::query("SELECT * FROM runs WHERE id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .ok_or(RepositoryError::NotFound)?;
        let current = RunRow::from_row(&row).map_err(row_err)?.into_run()?;
        let next = current.apply_transition(transition, Utc::now())?;

        let result_json = next.result.as_ref().map(to_json).transpose()?;
        let result = sqlx::query(
            r#"UPDATE runs SET
                 status = ?, result = ?, error = ?, error_category = ?, retryable = ?,
                 attempt = ?, started_at = ?, finished_at = ?, next_retry_at = ?, metadata = ?
               WHERE id = ? AND status = ? AND attempt = ?"#,
        )
        .bind(next.status.as_str())
        .bind(&result_json)
        .bind(&next.error)
        .bind(next.error_category.map(|c| c.as_str()))
        .bind(next.retryable)
        .bind(i64::from(next.attempt))
        .bind(next.started_at.as_ref().map(format_datetime))
        .bind(next.finished_at.as_ref().map(format_datetime))
        .bind(next.next_retry_at.as_ref().map(format_datetime))
        .bind(to_json(&next.metadata)?)
        .bind(run_id.to_string())
        .bind(transition.expected_status.as_str())
        .bind(i64::from(transition.expected_attempt))
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::Conflict(format!(
                "run {run_id} changed during transition to {}",
                transition.status
            )));
        }

        tx.commit().await.map_err(db_err)?;
        Ok(next)
    }

    async fn request_cancel(&self, run_id: &Uuid) -> Result<Run, RepositoryError> {
        let result = sqlx::query("UPDATE runs SET cancel_requested = 1 WHERE id = ?")
            .bind(run_id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }

        self.fetch_run_row(run_id)
            .await?
            .ok_or(RepositoryError::NotFound)?
            .into_run()
    }

    async fn list_runs(
        &self,
        filter: &RunFilter,
        limit: u32,
        offset: u32,
    ) -> Result<Page<Run>, RepositoryError> {
        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM runs");
        push_run_filter(&mut count, filter);
        let total: i64 = count
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool.reader)
            .await
            .map_err(db_err)?;

        let mut query = QueryBuilder::<Sqlite>::new("SELECT * FROM runs");
        push_run_filter(&mut query, filter);
        query
            .push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(i64::from(limit))
            .push(" OFFSET ")
            .push_bind(i64::from(offset));
        let rows = query.build().fetch_all(&self.pool.reader).await.map_err(db_err)?;

        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            items.push(RunRow::from_row(row).map_err(row_err)?.into_run()?);
        }
        Ok(Page {
            items,
            total: total.max(0) as u64,
            limit,
            offset,
        })
    }

    async fn claim_due_runs(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<Run>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT * FROM runs
               WHERE status = 'pending' AND cancel_requested = 0
                 AND (next_retry_at IS NULL OR next_retry_at <= ?)
               ORDER BY priority DESC, created_at ASC, id ASC
               LIMIT ?"#,
        )
        .bind(format_datetime(&now))
        .bind(i64::from(limit))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(db_err)?;

        let mut runs = Vec::with_capacity(rows.len());
        for row in &rows {
            runs.push(RunRow::from_row(row).map_err(row_err)?.into_run()?);
        }
        Ok(runs)
    }

    async fn run_stats(&self, filter: &RunFilter) -> Result<RunStats, RepositoryError> {
        let mut query = QueryBuilder::<Sqlite>::new("SELECT status, started_at, finished_at FROM runs");
        push_run_filter(&mut query, filter);
        let rows = query.build().fetch_all(&self.pool.reader).await.map_err(db_err)?;

        let mut parsed = Vec::with_capacity(rows.len());
        for row in &rows {
            let status: String = row.try_get("status").map_err(row_err)?;
            let started_at: Option<String> = row.try_get("started_at").map_err(row_err)?;
            let finished_at: Option<String> = row.try_get("finished_at").map_err(row_err)?;
            parsed.push((
                parse_enum::<RunStatus>(&status, "run status")?,
                parse_opt_datetime(started_at.as_deref())?,
                parse_opt_datetime(finished_at.as_deref())?,
            ));
        }
        Ok(RunStats::from_rows(parsed))
    }

    async fn update_workflow_outputs(
        &self,
        run_id: &Uuid,
        outputs: &HashMap<String, serde_json::Value>,
        metrics: &HashMap<String, serde_json::Value>,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE runs SET outputs = ?, metrics = ? WHERE id = ? AND workflow_name IS NOT NULL",
        )
        .bind(to_json(outputs)?)
        .bind(to_json(metrics)?)
        .bind(run_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn create_step_run(&self, step: &StepRun) -> Result<(), RepositoryError> {
        let output = step.output_data.as_ref().map(to_json).transpose()?;

        sqlx::query(
            r#"INSERT INTO step_runs
               (id, run_id, step_name, step_type, step_order, status, input_params, output_data,
                error, error_category, records_processed, attempt, max_attempts,
                started_at, finished_at, duration_ms)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(step.id.to_string())
        .bind(step.run_id.to_string())
        .bind(&step.step_name)
        .bind(&step.step_type)
        .bind(i64::from(step.step_order))
        .bind(step.status.as_str())
        .bind(to_json(&step.input_params)?)
        .bind(&output)
        .bind(&step.error)
        .bind(step.error_category.map(|c| c.as_str()))
        .bind(step.records_processed as i64)
        .bind(i64::from(step.attempt))
        .bind(i64::from(step.max_attempts))
        .bind(step.started_at.as_ref().map(format_datetime))
        .bind(step.finished_at.as_ref().map(format_datetime))
        .bind(step.duration_ms.map(|d| d as i64))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| {
            if is_constraint(&e, "FOREIGN KEY") {
                return RepositoryError::NotFound;
            }
            if is_constraint(&e, "UNIQUE") {
                return RepositoryError::Conflict(format!("step run {} already exists", step.id));
            }
            db_err(e)
        })?;

        Ok(())
    }

    async fn update_step_run(&self, step: &StepRun) -> Result<(), RepositoryError> {
        let output = step.output_data.as_ref().map(to_json).transpose()?;

        let result = sqlx::query(
            r#"UPDATE step_runs SET
                 status = ?, output_data = ?, error = ?, error_category = ?,
                 records_processed = ?, attempt = ?, started_at = ?, finished_at = ?, duration_ms = ?
               WHERE id = ?"#,
        )
        .bind(step.status.as_str())
        .bind(&output)
        .bind(&step.error)
        .bind(step.error_category.map(|c| c.as_str()))
        .bind(step.records_processed as i64)
        .bind(i64::from(step.attempt))
        .bind(step.started_at.as_ref().map(format_datetime))
        .bind(step.finished_at.as_ref().map(format_datetime))
        .bind(step.duration_ms.map(|d| d as i64))
        .bind(step.id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn list_step_runs(&self, run_id: &Uuid) -> Result<Vec<StepRun>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM step_runs WHERE run_id = ? ORDER BY step_order ASC, id ASC")
            .bind(run_id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(db_err)?;

        let mut steps = Vec::with_capacity(rows.len());
        for row in &rows {
            steps.push(StepRunRow::from_row(row).map_err(row_err)?.into_step_run()?);
        }
        Ok(steps)
    }

    async fn upsert_schedule(&self, schedule: &Schedule) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO schedules
               (name, workflow, trigger_type, trigger_spec, timezone, params, enabled, max_instances,
                misfire_grace_seconds, misfire_policy, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(name) DO UPDATE SET
                 workflow = excluded.workflow,
                 trigger_type = excluded.trigger_type,
                 trigger_spec = excluded.trigger_spec,
                 timezone = excluded.timezone,
                 params = excluded.params,
                 enabled = excluded.enabled,
                 max_instances = excluded.max_instances,
                 misfire_grace_seconds = excluded.misfire_grace_seconds,
                 misfire_policy = excluded.misfire_policy,
                 created_at = excluded.created_at,
                 updated_at = excluded.updated_at"#,
        )
        .bind(&schedule.name)
        .bind(&schedule.workflow)
        .bind(schedule.trigger.trigger_type())
        .bind(to_json(&schedule.trigger)?)
        .bind(&schedule.timezone)
        .bind(to_json(&schedule.params)?)
        .bind(schedule.enabled)
        .bind(i64::from(schedule.max_instances))
        .bind(schedule.misfire_grace_seconds as i64)
        .bind(schedule.misfire_policy.as_str())
        .bind(format_datetime(&schedule.created_at))
        .bind(format_datetime(&schedule.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn get_schedule(&self, name: &str) -> Result<Option<Schedule>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM schedules WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(db_err)?;

        match row {
            Some(row) => Ok(Some(ScheduleRow::from_row(&row).map_err(row_err)?.into_schedule()?)),
            None => Ok(None),
        }
    }

    async fn delete_schedule(&self, name: &str) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM schedules WHERE name = ?")
            .bind(name)
            .execute(&self.pool.writer)
            .await
            .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_schedules(&self) -> Result<Vec<Schedule>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM schedules ORDER BY name ASC")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(db_err)?;

        let mut schedules = Vec::with_capacity(rows.len());
        for row in &rows {
            schedules.push(ScheduleRow::from_row(row).map_err(row_err)?.into_schedule()?);
        }
        Ok(schedules)
    }

    async fn record_job_run(&self, job: &JobRun) -> Result<(), RepositoryError> {
        let result_json = job.result.as_ref().map(to_json).transpose()?;

        sqlx::query(
            r#"INSERT INTO job_runs
               (id, schedule_name, status, scheduled_at, started_at, completed_at, error, result, workflow_run_id)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 status = excluded.status,
                 started_at = excluded.started_at,
                 completed_at = excluded.completed_at,
                 error = excluded.error,
                 result = excluded.result,
                 workflow_run_id = excluded.workflow_run_id"#,
        )
        .bind(job.id.to_string())
        .bind(&job.schedule_name)
        .bind(job.status.as_str())
        .bind(format_datetime(&job.scheduled_at))
        .bind(job.started_at.as_ref().map(format_datetime))
        .bind(job.completed_at.as_ref().map(format_datetime))
        .bind(&job.error)
        .bind(&result_json)
        .bind(job.workflow_run_id.map(|id| id.to_string()))
        .execute(&self.pool.writer)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn list_job_runs(&self, schedule_name: &str, limit: u32) -> Result<Vec<JobRun>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM job_runs WHERE schedule_name = ? ORDER BY scheduled_at DESC, id DESC LIMIT ?",
        )
        .bind(schedule_name)
        .bind(i64::from(limit))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(db_err)?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in &rows {
            jobs.push(JobRunRow::from_row(row).map_err(row_err)?.into_job_run()?);
        }
        Ok(jobs)
    }

    async fn write_dead_letter(&self, letter: &DeadLetter) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO dead_letters
               (id, source_run_id, source_step, payload, error, error_category, retry_count,
                max_retries, first_failed_at, last_failed_at, next_retry_at, status, replay_attempts)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(letter.id.to_string())
        .bind(letter.source_run_id.to_string())
        .bind(&letter.source_step)
        .bind(to_json(&letter.payload)?)
        .bind(&letter.error)
        .bind(letter.error_category.as_str())
        .bind(i64::from(letter.retry_count))
        .bind(i64::from(letter.max_retries))
        .bind(format_datetime(&letter.first_failed_at))
        .bind(format_datetime(&letter.last_failed_at))
        .bind(letter.next_retry_at.as_ref().map(format_datetime))
        .bind(letter.status.as_str())
        .bind(to_json(&letter.replay_attempts)?)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| {
            if is_constraint(&e, "UNIQUE") {
                return RepositoryError::Conflict(format!("dead letter {} already exists", letter.id));
            }
            db_err(e)
        })?;

        Ok(())
    }

    async fn get_dead_letter(&self, id: &Uuid) -> Result<Option<DeadLetter>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM dead_letters WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(db_err)?;

        match row {
            Some(row) => Ok(Some(DeadLetterRow::from_row(&row).map_err(row_err)?.into_dead_letter()?)),
            None => Ok(None),
        }
    }

    async fn update_dead_letter(&self, letter: &DeadLetter) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE dead_letters SET
                 error = ?, error_category = ?, retry_count = ?, last_failed_at = ?,
                 next_retry_at = ?, status = ?, replay_attempts = ?
               WHERE id = ?"#,
        )
        .bind(&letter.error)
        .bind(letter.error_category.as_str())
        .bind(i64::from(letter.retry_count))
        .bind(format_datetime(&letter.last_failed_at))
        .bind(letter.next_retry_at.as_ref().map(format_datetime))
        .bind(letter.status.as_str())
        .bind(to_json(&letter.replay_attempts)?)
        .bind(letter.id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn list_dead_letters(
        &self,
        filter: &DeadLetterFilter,
        limit: u32,
        offset: u32,
    ) -> Result<Page<DeadLetter>, RepositoryError> {
        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM dead_letters");
        push_dead_letter_filter(&mut count, filter);
        let total: i64 = count
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool.reader)
            .await
            .map_err(db_err)?;

        let mut query = QueryBuilder::<Sqlite>::new("SELECT * FROM dead_letters");
        push_dead_letter_filter(&mut query, filter);
        query
            .push(" ORDER BY last_failed_at DESC, id DESC LIMIT ")
            .push_bind(i64::from(limit))
            .push(" OFFSET ")
            .push_bind(i64::from(offset));
        let rows = query.build().fetch_all(&self.pool.reader).await.map_err(db_err)?;

        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            items.push(DeadLetterRow::from_row(row).map_err(row_err)?.into_dead_letter()?);
        }
        Ok(Page {
            items,
            total: total.max(0) as u64,
            limit,
            offset,
        })
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<PurgeReport, RepositoryError> {
        let cutoff = format_datetime(&cutoff);
        let mut tx = self.pool.writer.begin().await.map_err(db_err)?;

        let step_runs = sqlx::query(
            r#"DELETE FROM step_runs WHERE run_id IN (
                 SELECT id FROM runs
                 WHERE status IN ('completed', 'failed', 'cancelled') AND finished_at < ?
               )"#,
        )
        .bind(&cutoff)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?
        .rows_affected();

        let runs = sqlx::query(
            "DELETE FROM runs WHERE status IN ('completed', 'failed', 'cancelled') AND finished_at < ?",
        )
        .bind(&cutoff)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?
        .rows_affected();

        let job_runs = sqlx::query(
            "DELETE FROM job_runs WHERE status IN ('completed', 'failed', 'skipped') AND completed_at < ?",
        )
        .bind(&cutoff)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?
        .rows_affected();

        let dead_letters = sqlx::query("DELETE FROM dead_letters WHERE status = 'resolved' AND last_failed_at < ?")
            .bind(&cutoff)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?
            .rows_affected();

        tx.commit().await.map_err(db_err)?;

        Ok(PurgeReport {
            runs,
            step_runs,
            job_runs,
            dead_letters,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
