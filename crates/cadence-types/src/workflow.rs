//! Workflow domain types for Cadence.
//!
//! A `WorkflowDefinition` describes a DAG of steps. Executing it produces a
//! `WorkflowRun` (a `Run` of kind `workflow` plus workflow-specific fields)
//! and one `StepRun` per step attempt record.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorCategory;
use crate::run::{Run, RunKind};

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

fn default_max_concurrency() -> usize {
    4
}

/// The shape of a multi-step workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Unique workflow name.
    pub name: String,
    /// Business domain the workflow belongs to (e.g. "billing").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Steps forming the DAG.
    pub steps: Vec<StepDefinition>,
    /// Maximum steps executing at once within one run.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default)]
    pub on_failure: OnFailure,
    /// Workflow-level timeout in seconds (overrides the engine default).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Run-level attempt budget (overrides the engine default).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, steps: Vec<StepDefinition>) -> Self {
        Self {
            name: name.into(),
            domain: None,
            description: None,
            steps,
            max_concurrency: default_max_concurrency(),
            on_failure: OnFailure::default(),
            timeout_secs: None,
            max_attempts: None,
            metadata: HashMap::new(),
        }
    }

    pub fn step(&self, name: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.name == name)
    }
}

/// What happens to the rest of the DAG when a step fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    /// Stop dispatching; every not-yet-started step is skipped.
    #[default]
    Halt,
    /// Keep running independent branches; only dependents are skipped.
    Continue,
}

// ---------------------------------------------------------------------------
// Step Definition
// ---------------------------------------------------------------------------

/// A single step in the workflow DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Unique within a workflow.
    pub name: String,
    /// Name of the executor that runs this step.
    pub step_type: String,
    /// Unique within a workflow; ascending order breaks ties among ready steps.
    pub step_order: u32,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl StepDefinition {
    pub fn new(name: impl Into<String>, step_type: impl Into<String>, step_order: u32) -> Self {
        Self {
            name: name.into(),
            step_type: step_type.into(),
            step_order,
            depends_on: Vec::new(),
            timeout_secs: None,
            max_attempts: None,
            params: serde_json::Value::Null,
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }
}

// ---------------------------------------------------------------------------
// Workflow Run
// ---------------------------------------------------------------------------

/// Who or what started a workflow run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggeredBy {
    #[default]
    Manual,
    Schedule,
    Api,
}

impl TriggeredBy {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggeredBy::Manual => "manual",
            TriggeredBy::Schedule => "schedule",
            TriggeredBy::Api => "api",
        }
    }
}

/// A run executing a workflow DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub run: Run,
    pub workflow_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_key: Option<String>,
    /// Step outputs keyed by step name.
    #[serde(default)]
    pub outputs: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub metrics: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub triggered_by: TriggeredBy,
}

impl WorkflowRun {
    /// A pending workflow run for `definition`.
    pub fn new(
        definition: &WorkflowDefinition,
        params: serde_json::Value,
        triggered_by: TriggeredBy,
    ) -> Self {
        let run = Run::new(RunKind::Workflow, definition.name.clone(), params);
        Self {
            run,
            workflow_name: definition.name.clone(),
            domain: definition.domain.clone(),
            partition_key: None,
            outputs: HashMap::new(),
            metrics: HashMap::new(),
            triggered_by,
        }
    }

    pub fn id(&self) -> Uuid {
        self.run.id
    }
}

// ---------------------------------------------------------------------------
// Step Run
// ---------------------------------------------------------------------------

/// Execution status of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
            StepStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, StepStatus::Pending | StepStatus::Running)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution record of one step within a workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRun {
    pub id: Uuid,
    pub run_id: Uuid,
    pub step_name: String,
    pub step_type: String,
    pub step_order: u32,
    pub status: StepStatus,
    #[serde(default)]
    pub input_params: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_category: Option<ErrorCategory>,
    #[serde(default)]
    pub records_processed: u64,
    pub attempt: u32,
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl StepRun {
    /// A pending record for `step` within `run_id`.
    pub fn pending(run_id: Uuid, step: &StepDefinition, max_attempts: u32) -> Self {
        Self {
            id: Uuid::now_v7(),
            run_id,
            step_name: step.name.clone(),
            step_type: step.step_type.clone(),
            step_order: step.step_order,
            status: StepStatus::Pending,
            input_params: step.params.clone(),
            output_data: None,
            error: None,
            error_category: None,
            records_processed: 0,
            attempt: 1,
            max_attempts,
            started_at: None,
            finished_at: None,
            duration_ms: None,
        }
    }

    /// Close the record with a terminal `status`. Timestamps stay ordered
    /// even for steps that never started.
    pub fn finish(&mut self, status: StepStatus, now: DateTime<Utc>) {
        let started = self.started_at.unwrap_or(now);
        self.status = status;
        self.started_at = Some(started);
        self.finished_at = Some(now);
        self.duration_ms = Some((now - started).num_milliseconds().max(0) as u64);
    }
}
