//! Retry and dead-letter management.
//!
//! The `RetryManager` is the only component that decides between "try again
//! later" and "give up". Backoff policies sit behind the [`Backoff`] trait;
//! exhausted retryable failures become `DeadLetter` records and raise a
//! critical alert.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use cadence_types::config::BackoffConfig;
use cadence_types::dead_letter::{DeadLetter, DeadLetterStatus};
use cadence_types::error::{PipelineError, RepositoryError};
use cadence_types::event::{AlertEvent, AlertSeverity, EngineEvent};
use cadence_types::run::{Run, RunStatus, RunTransition};
use chrono::{DateTime, Utc};
use rand::Rng;
use uuid::Uuid;

use crate::event::alert::AlertSink;
use crate::event::bus::EventBus;
use crate::store::StateStore;

/// Metadata key marking a run created by dead-letter replay.
pub const REPLAY_OF_KEY: &str = "replay_of";

// ---------------------------------------------------------------------------
// Backoff policies
// ---------------------------------------------------------------------------

/// Delay before attempt `attempt + 1`, given that `attempt` (1-based) failed.
pub trait Backoff: Send + Sync + fmt::Debug {
    fn delay(&self, attempt: u32) -> Duration;
}

/// `base * multiplier^(attempt-1)` capped at `max`.
///
/// With `jitter`, the delay is drawn uniformly from `[d/2, d]` so that
/// concurrent failures spread out instead of retrying in lockstep.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub multiplier: f64,
    pub max: Duration,
    pub jitter: bool,
}

impl Backoff for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let raw_ms = self.base.as_millis() as f64 * self.multiplier.max(1.0).powi(exponent);
        let capped_ms = raw_ms.min(self.max.as_millis() as f64).max(0.0) as u64;
        if !self.jitter || capped_ms < 2 {
            return Duration::from_millis(capped_ms);
        }
        let half = capped_ms / 2;
        let jittered = half + rand::thread_rng().gen_range(0..=capped_ms - half);
        Duration::from_millis(jittered)
    }
}

/// `step * attempt` capped at `max`.
#[derive(Debug, Clone)]
pub struct LinearBackoff {
    pub step: Duration,
    pub max: Duration,
}

impl Backoff for LinearBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        self.step.saturating_mul(attempt.max(1)).min(self.max)
    }
}

/// Same delay every time.
#[derive(Debug, Clone)]
pub struct FixedBackoff {
    pub delay: Duration,
}

impl Backoff for FixedBackoff {
    fn delay(&self, _attempt: u32) -> Duration {
        self.delay
    }
}

/// Build the configured backoff policy.
pub fn backoff_from_config(config: &BackoffConfig) -> Arc<dyn Backoff> {
    match config {
        BackoffConfig::Exponential {
            base_ms,
            multiplier,
            max_ms,
            jitter,
        } => Arc::new(ExponentialBackoff {
            base: Duration::from_millis(*base_ms),
            multiplier: *multiplier,
            max: Duration::from_millis(*max_ms),
            jitter: *jitter,
        }),
        BackoffConfig::Linear { step_ms, max_ms } => Arc::new(LinearBackoff {
            step: Duration::from_millis(*step_ms),
            max: Duration::from_millis(*max_ms),
        }),
        BackoffConfig::Fixed { delay_ms } => Arc::new(FixedBackoff {
            delay: Duration::from_millis(*delay_ms),
        }),
    }
}

// ---------------------------------------------------------------------------
// RetryDecision
// ---------------------------------------------------------------------------

/// Outcome of evaluating a failure against the retry budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after `delay`.
    Retry { delay: Duration, next_attempt: u32 },
    /// Retryable, but the budget is spent.
    DeadLetter,
    /// Not retryable.
    Fail,
}

impl RetryDecision {
    pub fn evaluate(error: &PipelineError, attempt: u32, max_attempts: u32, backoff: &dyn Backoff) -> Self {
        if !error.retryable() {
            RetryDecision::Fail
        } else if attempt >= max_attempts {
            RetryDecision::DeadLetter
        } else {
            RetryDecision::Retry {
                delay: backoff.delay(attempt),
                next_attempt: attempt + 1,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// RetryManager
// ---------------------------------------------------------------------------

/// Retry and dead-letter authority.
///
/// Generic over `S: StateStore` for storage flexibility.
pub struct RetryManager<S: StateStore> {
    store: Arc<S>,
    backoff: Arc<dyn Backoff>,
    alerts: Arc<dyn AlertSink>,
    events: EventBus,
}

impl<S: StateStore> RetryManager<S> {
    pub fn new(store: Arc<S>, backoff: Arc<dyn Backoff>, alerts: Arc<dyn AlertSink>, events: EventBus) -> Self {
        Self {
            store,
            backoff,
            alerts,
            events,
        }
    }

    pub fn decide(&self, error: &PipelineError, attempt: u32, max_attempts: u32) -> RetryDecision {
        RetryDecision::evaluate(error, attempt, max_attempts, self.backoff.as_ref())
    }

    /// Record the failure of a running run and apply the retry policy.
    ///
    /// The run moves `running -> failed`; if it may be retried it then moves
    /// `failed -> pending` with an incremented attempt and `next_retry_at`.
    /// `already_dead_lettered` means a step of the run exhausted its own
    /// retries and wrote the dead letter; the run then fails terminally
    /// without a run-level retry or a second letter.
    pub async fn handle_run_failure(
        &self,
        run: &Run,
        error: &PipelineError,
        already_dead_lettered: bool,
    ) -> Result<Run, RepositoryError> {
        let failed = self
            .store
            .transition_run(
                &run.id,
                &RunTransition::from_current(run, RunStatus::Failed).with_error(error),
            )
            .await?;

        let decision = if already_dead_lettered {
            RetryDecision::DeadLetter
        } else {
            self.decide(error, failed.attempt, failed.max_attempts)
        };
        match decision {
            RetryDecision::Retry { delay, next_attempt } => {
                let next_retry_at = Utc::now()
                    + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                let pending = self
                    .store
                    .transition_run(
                        &run.id,
                        &RunTransition::from_current(&failed, RunStatus::Pending)
                            .with_next_retry_at(next_retry_at),
                    )
                    .await?;

                tracing::warn!(
                    run_id = %run.id,
                    category = %error.category(),
                    attempt = next_attempt,
                    delay_ms = delay.as_millis() as u64,
                    "run failed, retry scheduled"
                );
                self.events.publish(EngineEvent::RunRetryScheduled {
                    run_id: run.id,
                    attempt: next_attempt,
                    next_retry_at,
                });
                Ok(pending)
            }
            RetryDecision::DeadLetter => {
                if !already_dead_lettered && !is_replay(&failed) {
                    self.dead_letter(&failed, None, error).await?;
                }
                self.report_terminal(&failed, error);
                Ok(failed)
            }
            RetryDecision::Fail => {
                self.report_terminal(&failed, error);
                Ok(failed)
            }
        }
    }

    /// Write a dead letter for `run` (or one of its steps) and raise a
    /// critical alert. Returns `None` for replay runs, which never produce
    /// new dead letters.
    pub async fn dead_letter(
        &self,
        run: &Run,
        step: Option<StepFailure<'_>>,
        error: &PipelineError,
    ) -> Result<Option<DeadLetter>, RepositoryError> {
        if is_replay(run) {
            return Ok(None);
        }

        let now = Utc::now();
        let (source_step, retry_count, max_retries, first_failed_at) = match step {
            Some(step) => (
                Some(step.name.to_string()),
                step.attempt,
                step.max_attempts,
                step.first_failed_at,
            ),
            None => (
                None,
                run.attempt,
                run.max_attempts,
                run.first_failed_at().unwrap_or(now),
            ),
        };
        let payload = serde_json::to_value(run.to_submission())
            .map_err(|e| RepositoryError::Query(format!("serialize dead letter payload: {e}")))?;
        let letter = DeadLetter {
            id: Uuid::now_v7(),
            source_run_id: run.id,
            source_step,
            payload,
            error: error.message().to_string(),
            error_category: error.category(),
            retry_count: retry_count.min(max_retries),
            max_retries,
            first_failed_at,
            last_failed_at: now,
            next_retry_at: None,
            status: DeadLetterStatus::Exhausted,
            replay_attempts: Vec::new(),
        };
        self.store.write_dead_letter(&letter).await?;

        tracing::error!(
            run_id = %run.id,
            dead_letter_id = %letter.id,
            category = %error.category(),
            step = letter.source_step.as_deref().unwrap_or(""),
            "retries exhausted, dead letter written"
        );
        self.events.publish(EngineEvent::DeadLettered {
            dead_letter_id: letter.id,
            source_run_id: run.id,
            category: error.category(),
        });
        self.alerts.emit(
            &AlertEvent::from_error(AlertSeverity::Critical, error, Some(run.id))
                .with_metadata("dead_letter_id", letter.id.to_string().into()),
        );
        Ok(Some(letter))
    }

    /// Log, publish, and alert a terminal failure.
    fn report_terminal(&self, run: &Run, error: &PipelineError) {
        tracing::error!(
            run_id = %run.id,
            name = run.name.as_str(),
            category = %error.category(),
            retryable = error.retryable(),
            attempt = run.attempt,
            "run failed: {}", error.message()
        );
        self.events.publish(EngineEvent::RunFailed {
            run_id: run.id,
            name: run.name.clone(),
            category: error.category(),
            retryable: error.retryable(),
            error: error.message().to_string(),
        });
        self.alerts
            .emit(&AlertEvent::from_error(AlertSeverity::Error, error, Some(run.id)));
    }
}

/// The workflow step whose retries ran out.
#[derive(Debug, Clone, Copy)]
pub struct StepFailure<'a> {
    pub name: &'a str,
    pub attempt: u32,
    pub max_attempts: u32,
    pub first_failed_at: DateTime<Utc>,
}

/// Whether `run` was created by a dead-letter replay.
pub fn is_replay(run: &Run) -> bool {
    run.metadata.contains_key(REPLAY_OF_KEY)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
