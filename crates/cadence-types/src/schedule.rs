//! Schedule and job-run types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Trigger
// ---------------------------------------------------------------------------

/// When a schedule fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// 5-field cron expression (or a supported shorthand such as "daily"),
    /// evaluated in the schedule's timezone.
    Cron { expression: String },
    /// Fixed period measured from the previous fire.
    Interval { seconds: u64 },
    /// Fires exactly once.
    Date { run_at: DateTime<Utc> },
}

impl Trigger {
    pub fn trigger_type(&self) -> &'static str {
        match self {
            Trigger::Cron { .. } => "cron",
            Trigger::Interval { .. } => "interval",
            Trigger::Date { .. } => "date",
        }
    }
}

/// What to do with a fire time missed by more than the grace period.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MisfirePolicy {
    /// Record a skipped job run and wait for the next future fire.
    #[default]
    Drop,
    /// Run once now, then continue from the next future fire.
    Coalesce,
}

impl MisfirePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            MisfirePolicy::Drop => "drop",
            MisfirePolicy::Coalesce => "coalesce",
        }
    }
}

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_enabled() -> bool {
    true
}

fn default_max_instances() -> u32 {
    1
}

fn default_misfire_grace() -> u64 {
    60
}

/// Persistent trigger definition. Replaced as a whole, never patched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    /// Unique schedule name.
    pub name: String,
    /// Workflow to run when the schedule fires.
    pub workflow: String,
    pub trigger: Trigger,
    /// IANA timezone name used for cron evaluation.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_max_instances")]
    pub max_instances: u32,
    #[serde(default = "default_misfire_grace")]
    pub misfire_grace_seconds: u64,
    #[serde(default)]
    pub misfire_policy: MisfirePolicy,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Schedule {
    pub fn new(name: impl Into<String>, workflow: impl Into<String>, trigger: Trigger) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            workflow: workflow.into(),
            trigger,
            timezone: default_timezone(),
            params: serde_json::Value::Null,
            enabled: true,
            max_instances: default_max_instances(),
            misfire_grace_seconds: default_misfire_grace(),
            misfire_policy: MisfirePolicy::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = timezone.into();
        self
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_max_instances(mut self, max_instances: u32) -> Self {
        self.max_instances = max_instances;
        self
    }

    pub fn with_misfire(mut self, grace_seconds: u64, policy: MisfirePolicy) -> Self {
        self.misfire_grace_seconds = grace_seconds;
        self.misfire_policy = policy;
        self
    }

    /// A copy with `enabled` replaced and `updated_at` bumped.
    pub fn with_enabled(&self, enabled: bool) -> Self {
        let mut next = self.clone();
        next.enabled = enabled;
        next.updated_at = Utc::now();
        next
    }
}

// ---------------------------------------------------------------------------
// JobRun
// ---------------------------------------------------------------------------

/// Status of one schedule firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobRunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl JobRunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobRunStatus::Pending => "pending",
            JobRunStatus::Running => "running",
            JobRunStatus::Completed => "completed",
            JobRunStatus::Failed => "failed",
            JobRunStatus::Skipped => "skipped",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobRunStatus::Completed | JobRunStatus::Failed | JobRunStatus::Skipped
        )
    }
}

impl fmt::Display for JobRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One firing of a schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRun {
    /// Job run identifier.
    pub id: Uuid,
    pub schedule_name: String,
    pub status: JobRunStatus,
    /// The fire time this job run was created for.
    pub scheduled_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// The workflow run started by this firing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_run_id: Option<Uuid>,
}

impl JobRun {
    pub fn pending(schedule_name: impl Into<String>, scheduled_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            schedule_name: schedule_name.into(),
            status: JobRunStatus::Pending,
            scheduled_at,
            started_at: None,
            completed_at: None,
            error: None,
            result: None,
            workflow_run_id: None,
        }
    }

    /// A terminal skipped record explaining why the fire did not execute.
    pub fn skipped(
        schedule_name: impl Into<String>,
        scheduled_at: DateTime<Utc>,
        reason: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        let mut job = Self::pending(schedule_name, scheduled_at);
        job.status = JobRunStatus::Skipped;
        job.started_at = Some(now);
        job.completed_at = Some(now);
        job.error = Some(reason.into());
        job
    }

    pub fn start(&mut self, now: DateTime<Utc>) {
        self.status = JobRunStatus::Running;
        self.started_at = Some(now);
    }

    pub fn finish(&mut self, status: JobRunStatus, now: DateTime<Utc>) {
        self.status = status;
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
        self.completed_at = Some(now);
    }
}
