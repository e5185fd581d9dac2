//! Run domain types: the unit of submitted work and its status lifecycle.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ErrorCategory, PipelineError, RepositoryError};

/// Metadata key holding the instant of a run's first failed attempt.
pub const FIRST_FAILED_AT_KEY: &str = "first_failed_at";

// ---------------------------------------------------------------------------
// RunKind
// ---------------------------------------------------------------------------

/// What kind of work a run executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Task,
    Pipeline,
    Workflow,
}

impl RunKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RunKind::Task => "task",
            RunKind::Pipeline => "pipeline",
            RunKind::Workflow => "workflow",
        }
    }
}

// ---------------------------------------------------------------------------
// RunStatus
// ---------------------------------------------------------------------------

/// Lifecycle status shared by runs.
///
/// ```text
/// pending -> running -> completed | failed | cancelled
/// pending -> cancelled
/// failed  -> pending            (retry, while attempt < max_attempts)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal in the sense of "finished executing". A failed run may still
    /// move back to pending for a retry.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    /// Whether the state machine has an edge from `self` to `next`.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Failed, Pending)
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// One unit of submitted work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// UUIDv7, time-sortable.
    pub id: Uuid,
    pub kind: RunKind,
    /// Executor name for tasks and pipelines, workflow name for workflows.
    pub name: String,
    pub status: RunStatus,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_category: Option<ErrorCategory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    /// Higher values are dispatched first.
    #[serde(default)]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// 1-based attempt counter.
    pub attempt: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Earliest instant the dispatcher may pick this run up.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cancel_requested: bool,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Run {
    /// A fresh pending run on its first attempt.
    pub fn new(kind: RunKind, name: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            id: Uuid::now_v7(),
            kind,
            name: name.into(),
            status: RunStatus::Pending,
            params,
            result: None,
            error: None,
            error_category: None,
            retryable: None,
            priority: 0,
            idempotency_key: None,
            attempt: 1,
            max_attempts: 1,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            next_retry_at: None,
            cancel_requested: false,
            metadata: HashMap::new(),
        }
    }

    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }

    /// When the first attempt of this run failed. Survives retries.
    pub fn first_failed_at(&self) -> Option<DateTime<Utc>> {
        self.metadata
            .get(FIRST_FAILED_AT_KEY)
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|at| at.with_timezone(&Utc))
    }

    /// Rebuild the submission that produced this run (used for replay and
    /// manual retry). The idempotency key is intentionally not carried over.
    pub fn to_submission(&self) -> SubmitRequest {
        SubmitRequest {
            kind: self.kind,
            name: self.name.clone(),
            params: self.params.clone(),
            idempotency_key: None,
            priority: Some(self.priority),
            max_attempts: Some(self.max_attempts),
            metadata: HashMap::new(),
        }
    }

    /// Apply a transition, validating the state machine and the expected
    /// `(status, attempt)` pair. Returns the updated run.
    pub fn apply_transition(
        &self,
        transition: &RunTransition,
        now: DateTime<Utc>,
    ) -> Result<Run, RepositoryError> {
        if self.status != transition.expected_status || self.attempt != transition.expected_attempt {
            return Err(RepositoryError::Conflict(format!(
                "run {} is {} (attempt {}), expected {} (attempt {})",
                self.id,
                self.status,
                self.attempt,
                transition.expected_status,
                transition.expected_attempt
            )));
        }

        let invalid = || RepositoryError::InvalidTransition {
            from: self.status.to_string(),
            to: transition.status.to_string(),
        };
        if !self.status.can_transition_to(transition.status) {
            return Err(invalid());
        }

        let mut next = self.clone();
        next.status = transition.status;

        match transition.status {
            RunStatus::Running => {
                next.started_at = Some(now);
                next.finished_at = None;
                next.next_retry_at = None;
            }
            RunStatus::Pending => {
                // failed -> pending: one more attempt
                if self.attempt >= self.max_attempts {
                    return Err(invalid());
                }
                next.attempt = self.attempt + 1;
                next.started_at = None;
                next.finished_at = None;
                next.next_retry_at = transition.next_retry_at;
            }
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled => {
                next.started_at = Some(self.started_at.unwrap_or(now));
                next.finished_at = Some(now);
                if transition.status == RunStatus::Failed {
                    next.metadata
                        .entry(FIRST_FAILED_AT_KEY.to_string())
                        .or_insert_with(|| serde_json::Value::String(now.to_rfc3339()));
                }
                if transition.status == RunStatus::Completed {
                    next.error = None;
                    next.error_category = None;
                    next.retryable = None;
                }
            }
        }

        if let Some(result) = &transition.result {
            next.result = Some(result.clone());
        }
        if let Some(error) = &transition.error {
            next.error = Some(error.message.clone());
            next.error_category = Some(error.category);
            next.retryable = Some(error.retryable);
        }

        Ok(next)
    }
}

// ---------------------------------------------------------------------------
// RunTransition
// ---------------------------------------------------------------------------

/// A compare-and-set status change.
///
/// Applies only if the stored run is still at `(expected_status,
/// expected_attempt)`; otherwise the store reports a conflict.
#[derive(Debug, Clone)]
pub struct RunTransition {
    pub expected_status: RunStatus,
    pub expected_attempt: u32,
    pub status: RunStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<TransitionError>,
    pub next_retry_at: Option<DateTime<Utc>>,
}

/// Error fields written alongside a transition.
#[derive(Debug, Clone)]
pub struct TransitionError {
    pub message: String,
    pub category: ErrorCategory,
    pub retryable: bool,
}

impl RunTransition {
    /// Transition `run` from its current state to `status`.
    pub fn from_current(run: &Run, status: RunStatus) -> Self {
        Self {
            expected_status: run.status,
            expected_attempt: run.attempt,
            status,
            result: None,
            error: None,
            next_retry_at: None,
        }
    }

    pub fn with_result(mut self, result: serde_json::Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_error(mut self, error: &PipelineError) -> Self {
        self.error = Some(TransitionError {
            message: error.message().to_string(),
            category: error.category(),
            retryable: error.retryable(),
        });
        self
    }

    pub fn with_next_retry_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_retry_at = Some(at);
        self
    }
}

// ---------------------------------------------------------------------------
// Submission
// ---------------------------------------------------------------------------

/// The original submission of a run. Also stored as a dead letter payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub kind: RunKind,
    pub name: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl SubmitRequest {
    pub fn new(kind: RunKind, name: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            kind,
            name: name.into(),
            params,
            idempotency_key: None,
            priority: None,
            max_attempts: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Materialize a pending run, falling back to `default_max_attempts`.
    pub fn into_run(self, default_max_attempts: u32) -> Run {
        let mut run = Run::new(self.kind, self.name, self.params);
        run.idempotency_key = self.idempotency_key;
        run.priority = self.priority.unwrap_or(0);
        run.max_attempts = self.max_attempts.unwrap_or(default_max_attempts).max(1);
        run.metadata = self.metadata;
        run
    }
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Filters for run listing and statistics. `None` fields match everything.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub status: Option<RunStatus>,
    pub kind: Option<RunKind>,
    pub name: Option<String>,
    /// Inclusive lower bound on `created_at`.
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `created_at`.
    pub until: Option<DateTime<Utc>>,
}

impl RunFilter {
    pub fn matches(&self, run: &Run) -> bool {
        self.status.is_none_or(|s| run.status == s)
            && self.kind.is_none_or(|k| run.kind == k)
            && self.name.as_deref().is_none_or(|n| run.name == n)
            && self.since.is_none_or(|t| run.created_at >= t)
            && self.until.is_none_or(|t| run.created_at < t)
    }
}

/// One page of a listing, plus the unpaginated total.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub limit: u32,
    pub offset: u32,
}

/// Aggregate statistics over a filtered set of runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub total: u64,
    pub by_status: BTreeMap<RunStatus, u64>,
    /// Mean wall-clock duration of finished runs.
    pub avg_duration_ms: Option<f64>,
    /// completed / (completed + failed).
    pub success_rate: Option<f64>,
}

impl RunStats {
    /// Accumulate statistics from `(status, started_at, finished_at)` rows.
    pub fn from_rows<I>(rows: I) -> Self
    where
        I: IntoIterator<Item = (RunStatus, Option<DateTime<Utc>>, Option<DateTime<Utc>>)>,
    {
        let mut stats = RunStats::default();
        let mut duration_sum = 0f64;
        let mut duration_count = 0u64;

        for (status, started_at, finished_at) in rows {
            stats.total += 1;
            *stats.by_status.entry(status).or_insert(0) += 1;
            if let (Some(start), Some(end)) = (started_at, finished_at) {
                duration_sum += (end - start).num_milliseconds() as f64;
                duration_count += 1;
            }
        }

        if duration_count > 0 {
            stats.avg_duration_ms = Some(duration_sum / duration_count as f64);
        }
        let completed = stats.count(RunStatus::Completed);
        let failed = stats.count(RunStatus::Failed);
        if completed + failed > 0 {
            stats.success_rate = Some(completed as f64 / (completed + failed) as f64);
        }
        stats
    }

    pub fn count(&self, status: RunStatus) -> u64 {
        self.by_status.get(&status).copied().unwrap_or(0)
    }
}
