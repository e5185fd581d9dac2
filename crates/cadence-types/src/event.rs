//! Event types for the Cadence engine event bus.
//!
//! `EngineEvent` is the unified event type broadcast while runs, steps, and
//! schedules progress. All variants are Clone + Send + Sync for use with
//! tokio broadcast channels.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ErrorCategory, PipelineError};
use crate::run::RunKind;

/// How loud an alert is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

/// An operator-facing alert. Delivery channels live outside the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub severity: AlertSeverity,
    pub category: ErrorCategory,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    pub message: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl AlertEvent {
    /// Build an alert from a categorized error.
    pub fn from_error(severity: AlertSeverity, error: &PipelineError, run_id: Option<Uuid>) -> Self {
        let ctx = error.context();
        let mut metadata = ctx.metadata.clone();
        if let Some(pipeline) = &ctx.pipeline {
            metadata.insert("pipeline".to_string(), pipeline.clone().into());
        }
        if let Some(step) = &ctx.step {
            metadata.insert("step".to_string(), step.clone().into());
        }
        Self {
            severity,
            category: error.category(),
            retryable: error.retryable(),
            run_id: run_id.or(ctx.run_id),
            message: error.message().to_string(),
            metadata,
            timestamp: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Events emitted by the engine.
///
/// Used by the event bus to communicate run, step, and schedule lifecycle to
/// subscribers (dashboards, logging, alert routing).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    RunSubmitted {
        run_id: Uuid,
        kind: RunKind,
        name: String,
    },

    RunStarted {
        run_id: Uuid,
        name: String,
        attempt: u32,
    },

    RunCompleted {
        run_id: Uuid,
        name: String,
        duration_ms: u64,
    },

    RunFailed {
        run_id: Uuid,
        name: String,
        category: ErrorCategory,
        retryable: bool,
        error: String,
    },

    /// A failed run was moved back to pending.
    RunRetryScheduled {
        run_id: Uuid,
        attempt: u32,
        next_retry_at: DateTime<Utc>,
    },

    RunCancelled { run_id: Uuid },

    StepStarted {
        run_id: Uuid,
        step_name: String,
        step_order: u32,
        attempt: u32,
    },

    StepCompleted {
        run_id: Uuid,
        step_name: String,
        duration_ms: u64,
        records_processed: u64,
    },

    StepFailed {
        run_id: Uuid,
        step_name: String,
        category: ErrorCategory,
        error: String,
        will_retry: bool,
    },

    StepSkipped { run_id: Uuid, step_name: String },

    ScheduleFired {
        schedule_name: String,
        job_run_id: Uuid,
        scheduled_at: DateTime<Utc>,
    },

    ScheduleSkipped {
        schedule_name: String,
        scheduled_at: DateTime<Utc>,
        reason: String,
    },

    DeadLettered {
        dead_letter_id: Uuid,
        source_run_id: Uuid,
        category: ErrorCategory,
    },

    Alert(AlertEvent),
}
