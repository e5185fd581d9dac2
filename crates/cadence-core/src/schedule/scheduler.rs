//! Tick-driven workflow scheduler.
//!
//! Provides:
//! - Registration, removal, pause and resume of persistent schedules
//! - A tick loop that fires every due schedule through a callback
//! - Misfire handling (drop or coalesce) for fires missed past their grace
//! - Per-schedule `max_instances` gating with skipped job runs on overlap
//! - Restoring schedules from the state store on startup

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use cadence_types::error::PipelineError;
use cadence_types::event::EngineEvent;
use cadence_types::run::RunStatus;
use cadence_types::schedule::{JobRun, JobRunStatus, MisfirePolicy, Schedule};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::trigger::{CompiledTrigger, MAX_MISSED_OCCURRENCES};
use super::SchedulerError;
use crate::event::bus::EventBus;
use crate::store::StateStore;
use crate::workflow::runner::panic_message;

// ---------------------------------------------------------------------------
// Callback
// ---------------------------------------------------------------------------

/// What the scheduler hands to the callback when a schedule fires.
#[derive(Debug, Clone)]
pub struct ScheduleFire {
    pub schedule_name: String,
    pub workflow: String,
    pub params: serde_json::Value,
    pub scheduled_at: DateTime<Utc>,
    pub job_run_id: Uuid,
}

/// The workflow run a fire produced.
#[derive(Debug, Clone)]
pub struct ScheduledOutcome {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

/// Callback type invoked when a schedule fires. An `Err` means no workflow
/// run could be started.
pub type ScheduleCallback =
    Arc<dyn Fn(ScheduleFire) -> BoxFuture<'static, Result<ScheduledOutcome, PipelineError>> + Send + Sync>;

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Tracks a registered schedule.
struct ScheduleEntry {
    schedule: Schedule,
    trigger: CompiledTrigger,
    /// `None` while paused or once a date trigger has fired.
    next_fire: Option<DateTime<Utc>>,
    last_fire: Option<DateTime<Utc>>,
    /// `max_instances` permits.
    slots: Arc<Semaphore>,
}

/// Work produced by one tick for one schedule.
enum TickAction {
    Fire(DateTime<Utc>),
    Skip(DateTime<Utc>, String),
}

/// Fires persistent schedules and records their job runs.
///
/// Generic over `S: StateStore` for storage flexibility. The scheduler owns
/// schedule persistence: every mutation is written through to the store.
pub struct Scheduler<S: StateStore> {
    store: Arc<S>,
    entries: DashMap<String, ScheduleEntry>,
    callback: ScheduleCallback,
    events: EventBus,
}

impl<S: StateStore + 'static> Scheduler<S> {
    pub fn new(store: Arc<S>, events: EventBus, callback: ScheduleCallback) -> Self {
        Self {
            store,
            entries: DashMap::new(),
            callback,
            events,
        }
    }

    /// Check a schedule definition without registering it.
    pub fn validate(schedule: &Schedule) -> Result<CompiledTrigger, SchedulerError> {
        if schedule.name.trim().is_empty() {
            return Err(SchedulerError::InvalidSchedule("schedule name must not be empty".to_string()));
        }
        if schedule.workflow.trim().is_empty() {
            return Err(SchedulerError::InvalidSchedule(format!(
                "schedule '{}' has no workflow",
                schedule.name
            )));
        }
        if schedule.max_instances == 0 {
            return Err(SchedulerError::InvalidSchedule(format!(
                "schedule '{}' has max_instances 0",
                schedule.name
            )));
        }
        CompiledTrigger::compile(&schedule.trigger, &schedule.timezone)
    }

    /// Validate, persist, and activate `schedule`, replacing any schedule
    /// with the same name.
    pub async fn register(&self, schedule: Schedule) -> Result<Schedule, SchedulerError> {
        let trigger = Self::validate(&schedule)?;
        self.store.upsert_schedule(&schedule).await?;
        self.activate(schedule.clone(), trigger, Utc::now());
        Ok(schedule)
    }

    /// Load every persisted schedule. Schedules that no longer validate are
    /// logged and left inactive. Returns the number activated.
    pub async fn restore(&self) -> Result<usize, SchedulerError> {
        let now = Utc::now();
        let mut restored = 0;
        for schedule in self.store.list_schedules().await? {
            match Self::validate(&schedule) {
                Ok(trigger) => {
                    self.activate(schedule, trigger, now);
                    restored += 1;
                }
                Err(e) => {
                    tracing::warn!(schedule = schedule.name.as_str(), "skipping invalid persisted schedule: {e}");
                }
            }
        }
        tracing::info!(count = restored, "schedules restored");
        Ok(restored)
    }

    fn activate(&self, schedule: Schedule, trigger: CompiledTrigger, now: DateTime<Utc>) {
        let next_fire = if schedule.enabled { trigger.first_fire(now) } else { None };
        let name = schedule.name.clone();
        // Instances started under the previous definition keep counting.
        let (slots, last_fire) = match self.entries.get(&name) {
            Some(existing) => {
                resize_slots(&existing.slots, existing.schedule.max_instances, schedule.max_instances);
                (Arc::clone(&existing.slots), existing.last_fire)
            }
            None => (Arc::new(Semaphore::new(schedule.max_instances as usize)), None),
        };
        tracing::info!(
            schedule = name.as_str(),
            workflow = schedule.workflow.as_str(),
            trigger = schedule.trigger.trigger_type(),
            next_fire = ?next_fire,
            "schedule registered"
        );
        self.entries.insert(
            name,
            ScheduleEntry {
                slots,
                schedule,
                trigger,
                next_fire,
                last_fire,
            },
        );
    }

    /// Delete a schedule. Returns `true` if it existed.
    pub async fn remove(&self, name: &str) -> Result<bool, SchedulerError> {
        let existed = self.store.delete_schedule(name).await?;
        let active = self.entries.remove(name).is_some();
        if existed || active {
            tracing::info!(schedule = name, "schedule removed");
        }
        Ok(existed || active)
    }

    /// Pause or resume a schedule. Resuming computes the next fire from now;
    /// fires missed while paused are not replayed.
    pub async fn set_enabled(&self, name: &str, enabled: bool) -> Result<Schedule, SchedulerError> {
        let current = self
            .get(name)
            .ok_or_else(|| SchedulerError::ScheduleNotFound(name.to_string()))?;
        let updated = current.with_enabled(enabled);
        self.store.upsert_schedule(&updated).await?;

        if let Some(mut entry) = self.entries.get_mut(name) {
            let now = Utc::now();
            let next_fire = match &entry.trigger {
                _ if !enabled => None,
                // A date that passed while paused is not fired late.
                CompiledTrigger::Date { at } => (*at > now).then_some(*at),
                trigger => trigger.first_fire(now),
            };
            entry.next_fire = next_fire;
            entry.schedule = updated.clone();
        }
        tracing::info!(schedule = name, enabled, "schedule {}", if enabled { "resumed" } else { "paused" });
        Ok(updated)
    }

    pub fn get(&self, name: &str) -> Option<Schedule> {
        self.entries.get(name).map(|e| e.schedule.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Next fire time of a schedule; `None` while paused or finished.
    pub fn next_fire(&self, name: &str) -> Option<DateTime<Utc>> {
        self.entries.get(name).and_then(|e| e.next_fire)
    }

    /// Most recent fire time handled by the tick loop since startup.
    pub fn last_fire(&self, name: &str) -> Option<DateTime<Utc>> {
        self.entries.get(name).and_then(|e| e.last_fire)
    }

    /// The next `count` fire times of a schedule.
    pub fn next_fire_times(&self, name: &str, count: usize) -> Result<Vec<DateTime<Utc>>, SchedulerError> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| SchedulerError::ScheduleNotFound(name.to_string()))?;
        let mut times = Vec::with_capacity(count);
        let mut cursor = entry.next_fire;
        while let Some(at) = cursor {
            if times.len() >= count {
                break;
            }
            times.push(at);
            cursor = entry.trigger.following(at);
        }
        Ok(times)
    }

    /// Number of registered schedules.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    // -----------------------------------------------------------------------
    // Firing
    // -----------------------------------------------------------------------

    /// Fire every schedule due at `now`.
    ///
    /// Advances each due schedule past `now` before spawning its work, so a
    /// fire time is handled at most once. Returns the spawned job run tasks.
    pub fn tick_at(self: &Arc<Self>, now: DateTime<Utc>) -> Vec<JoinHandle<JobRun>> {
        let mut work: Vec<(String, Arc<Semaphore>, TickAction)> = Vec::new();

        for mut entry in self.entries.iter_mut() {
            if !entry.schedule.enabled {
                continue;
            }
            let Some(first_due) = entry.next_fire.filter(|t| *t <= now) else {
                continue;
            };

            let name = entry.schedule.name.clone();
            let grace = chrono::Duration::seconds(entry.schedule.misfire_grace_seconds as i64);
            let latest = entry.trigger.latest_until(first_due, now).unwrap_or(first_due);
            // Skip records are capped; `latest` always comes from the full series.
            let mut missed = entry.trigger.occurrences_until(first_due, now);
            missed.retain(|at| *at != latest);
            if missed.len() >= MAX_MISSED_OCCURRENCES {
                tracing::warn!(
                    schedule = name.as_str(),
                    recorded = missed.len(),
                    %latest,
                    "more missed fires than recorded"
                );
            }
            entry.next_fire = entry.trigger.next_after(latest, now);
            entry.last_fire = Some(latest);

            let slots = Arc::clone(&entry.slots);
            match entry.schedule.misfire_policy {
                MisfirePolicy::Coalesce => {
                    if !missed.is_empty() {
                        tracing::info!(schedule = name.as_str(), missed = missed.len(), "coalescing missed fires");
                    }
                    work.push((name, slots, TickAction::Fire(latest)));
                }
                MisfirePolicy::Drop => {
                    let on_time = now - latest <= grace;
                    if !on_time {
                        missed.push(latest);
                    }
                    for at in &missed {
                        let reason = if now - *at > grace {
                            format!("misfire: missed by {}s", (now - *at).num_seconds())
                        } else {
                            "superseded by a later fire".to_string()
                        };
                        work.push((name.clone(), Arc::clone(&slots), TickAction::Skip(*at, reason)));
                    }
                    if on_time {
                        work.push((name, slots, TickAction::Fire(latest)));
                    }
                }
            }
        }

        work.into_iter()
            .map(|(name, slots, action)| {
                let this = Arc::clone(self);
                match action {
                    TickAction::Skip(at, reason) => {
                        tokio::spawn(async move { this.record_skip(&name, at, reason).await })
                    }
                    // Acquire here, not in the task, so the next tick sees the slot taken.
                    TickAction::Fire(at) => match slots.try_acquire_owned() {
                        Ok(permit) => tokio::spawn(async move {
                            let _permit = permit;
                            this.fire(&name, at).await
                        }),
                        Err(_) => tokio::spawn(async move {
                            this.record_skip(&name, at, "max_instances reached".to_string())
                                .await
                        }),
                    },
                }
            })
            .collect()
    }

    /// Fire a schedule immediately, outside its trigger. Respects
    /// `max_instances` and does not move the next scheduled fire.
    pub async fn run_now(&self, name: &str) -> Result<JobRun, SchedulerError> {
        let slots = self
            .entries
            .get(name)
            .map(|e| Arc::clone(&e.slots))
            .ok_or_else(|| SchedulerError::ScheduleNotFound(name.to_string()))?;
        let now = Utc::now();
        let Ok(_permit) = slots.try_acquire_owned() else {
            return Ok(self
                .record_skip(name, now, "max_instances reached".to_string())
                .await);
        };
        Ok(self.fire(name, now).await)
    }

    /// Run the tick loop until `cancel` is triggered.
    pub fn spawn(self: &Arc<Self>, tick: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tracing::info!(tick_ms = tick.as_millis() as u64, "scheduler started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let fired = this.tick_at(Utc::now());
                        if !fired.is_empty() {
                            tracing::debug!(count = fired.len(), "scheduler tick dispatched work");
                        }
                    }
                }
            }
            tracing::info!("scheduler stopped");
        })
    }

    async fn fire(&self, name: &str, scheduled_at: DateTime<Utc>) -> JobRun {
        let Some(schedule) = self.get(name) else {
            return self
                .record_skip(name, scheduled_at, "schedule removed".to_string())
                .await;
        };

        let mut job = JobRun::pending(name, scheduled_at);
        self.persist(&job).await;
        job.start(Utc::now());
        self.persist(&job).await;

        tracing::info!(schedule = name, job_run_id = %job.id, %scheduled_at, "schedule fired");
        self.events.publish(EngineEvent::ScheduleFired {
            schedule_name: name.to_string(),
            job_run_id: job.id,
            scheduled_at,
        });

        let fire = ScheduleFire {
            schedule_name: name.to_string(),
            workflow: schedule.workflow.clone(),
            params: schedule.params.clone(),
            scheduled_at,
            job_run_id: job.id,
        };
        let outcome = AssertUnwindSafe((self.callback)(fire)).catch_unwind().await;

        let status = match outcome {
            Ok(Ok(outcome)) => {
                job.workflow_run_id = Some(outcome.run_id);
                job.result = outcome.result;
                job.error = outcome.error;
                if outcome.status == RunStatus::Completed {
                    JobRunStatus::Completed
                } else {
                    JobRunStatus::Failed
                }
            }
            Ok(Err(e)) => {
                job.error = Some(e.to_string());
                JobRunStatus::Failed
            }
            Err(panic) => {
                job.error = Some(format!("schedule callback panicked: {}", panic_message(panic.as_ref())));
                JobRunStatus::Failed
            }
        };
        job.finish(status, Utc::now());
        self.persist(&job).await;

        if status == JobRunStatus::Completed {
            tracing::info!(schedule = name, job_run_id = %job.id, "scheduled job completed");
        } else {
            tracing::warn!(
                schedule = name,
                job_run_id = %job.id,
                error = job.error.as_deref().unwrap_or(""),
                "scheduled job failed"
            );
        }
        job
    }

    async fn record_skip(&self, name: &str, scheduled_at: DateTime<Utc>, reason: String) -> JobRun {
        tracing::warn!(schedule = name, %scheduled_at, reason = reason.as_str(), "schedule fire skipped");
        self.events.publish(EngineEvent::ScheduleSkipped {
            schedule_name: name.to_string(),
            scheduled_at,
            reason: reason.clone(),
        });
        let job = JobRun::skipped(name, scheduled_at, reason);
        self.persist(&job).await;
        job
    }

    async fn persist(&self, job: &JobRun) {
        if let Err(e) = self.store.record_job_run(job).await {
            tracing::warn!(schedule = job.schedule_name.as_str(), job_run_id = %job.id, "failed to persist job run: {e}");
        }
    }
}

/// Move a schedule's instance limit from `from` to `to` permits.
///
/// Permits held by running instances cannot be revoked; they are retired as
/// those instances finish.
fn resize_slots(slots: &Arc<Semaphore>, from: u32, to: u32) {
    if to > from {
        slots.add_permits((to - from) as usize);
        return;
    }
    let excess = (from - to) as usize;
    let held = excess - slots.forget_permits(excess);
    if held > 0 {
        let slots = Arc::clone(slots);
        tokio::spawn(async move {
            if let Ok(permits) = slots.acquire_many_owned(held as u32).await {
                permits.forget();
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
