//! Dead-letter queue records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorCategory;

/// Lifecycle of a dead letter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterStatus {
    Pending,
    Retrying,
    Exhausted,
    Resolved,
}

impl DeadLetterStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DeadLetterStatus::Pending => "pending",
            DeadLetterStatus::Retrying => "retrying",
            DeadLetterStatus::Exhausted => "exhausted",
            DeadLetterStatus::Resolved => "resolved",
        }
    }
}

/// One manual replay of a dead letter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayAttempt {
    /// The new run created for the replay.
    pub run_id: Uuid,
    pub attempted_at: DateTime<Utc>,
    pub succeeded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A unit of work that exhausted its retry budget on a retryable error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: Uuid,
    pub source_run_id: Uuid,
    /// Set when the exhausted unit was a workflow step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_step: Option<String>,
    /// The original submission (a serialized `SubmitRequest`).
    pub payload: serde_json::Value,
    pub error: String,
    pub error_category: ErrorCategory,
    pub retry_count: u32,
    pub max_retries: u32,
    pub first_failed_at: DateTime<Utc>,
    pub last_failed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    pub status: DeadLetterStatus,
    #[serde(default)]
    pub replay_attempts: Vec<ReplayAttempt>,
}

impl DeadLetter {
    /// Record a replay outcome. Success resolves the letter; failure leaves it
    /// exhausted.
    pub fn record_replay(&mut self, attempt: ReplayAttempt) {
        self.status = if attempt.succeeded {
            DeadLetterStatus::Resolved
        } else {
            self.last_failed_at = attempt.attempted_at;
            DeadLetterStatus::Exhausted
        };
        self.replay_attempts.push(attempt);
    }
}

/// Filters for dead-letter listing. `None` fields match everything.
#[derive(Debug, Clone, Default)]
pub struct DeadLetterFilter {
    pub status: Option<DeadLetterStatus>,
    pub category: Option<ErrorCategory>,
    pub source_run_id: Option<Uuid>,
    /// Inclusive lower bound on `last_failed_at`.
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `last_failed_at`.
    pub until: Option<DateTime<Utc>>,
}

impl DeadLetterFilter {
    pub fn matches(&self, letter: &DeadLetter) -> bool {
        self.status.is_none_or(|s| letter.status == s)
            && self.category.is_none_or(|c| letter.error_category == c)
            && self.source_run_id.is_none_or(|id| letter.source_run_id == id)
            && self.since.is_none_or(|t| letter.last_failed_at >= t)
            && self.until.is_none_or(|t| letter.last_failed_at < t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> DeadLetter {
        let now = Utc::now();
        DeadLetter {
            id: Uuid::now_v7(),
            source_run_id: Uuid::now_v7(),
            source_step: None,
            payload: json!({"kind": "task", "name": "flaky"}),
            error: "connection reset".to_string(),
            error_category: ErrorCategory::Transient,
            retry_count: 3,
            max_retries: 3,
            first_failed_at: now,
            last_failed_at: now,
            next_retry_at: None,
            status: DeadLetterStatus::Exhausted,
            replay_attempts: Vec::new(),
        }
    }

    #[test]
    fn test_failed_replay_stays_exhausted() {
        let mut letter = sample();
        letter.record_replay(ReplayAttempt {
            run_id: Uuid::now_v7(),
            attempted_at: Utc::now(),
            succeeded: false,
            error: Some("still down".to_string()),
        });
        assert_eq!(letter.status, DeadLetterStatus::Exhausted);
        assert_eq!(letter.replay_attempts.len(), 1);
    }

    #[test]
    fn test_successful_replay_resolves() {
        let mut letter = sample();
        letter.record_replay(ReplayAttempt {
            run_id: Uuid::now_v7(),
            attempted_at: Utc::now(),
            succeeded: true,
            error: None,
        });
        assert_eq!(letter.status, DeadLetterStatus::Resolved);
    }

    #[test]
    fn test_filter_by_category() {
        let letter = sample();
        let filter = DeadLetterFilter {
            category: Some(ErrorCategory::Timeout),
            ..Default::default()
        };
        assert!(!filter.matches(&letter));
        assert!(DeadLetterFilter::default().matches(&letter));
    }
}
