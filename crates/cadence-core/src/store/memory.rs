//! In-memory `StateStore` for tests and embedded single-process use.
//!
//! All entities live behind one `tokio::sync::RwLock`, so every operation is
//! atomic with respect to every other one. Nothing survives a restart.

use std::collections::{BTreeMap, HashMap};

use cadence_types::dead_letter::{DeadLetter, DeadLetterFilter, DeadLetterStatus};
use cadence_types::error::RepositoryError;
use cadence_types::run::{Page, Run, RunFilter, RunStats, RunStatus, RunTransition};
use cadence_types::schedule::{JobRun, Schedule};
use cadence_types::workflow::{StepRun, WorkflowRun};
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{PurgeReport, StateStore};

#[derive(Default)]
struct MemoryState {
    runs: HashMap<Uuid, Run>,
    /// Workflow-specific fields; the embedded `run` is refreshed from `runs` on read.
    workflows: HashMap<Uuid, WorkflowRun>,
    idempotency: HashMap<String, Uuid>,
    steps: HashMap<Uuid, StepRun>,
    schedules: BTreeMap<String, Schedule>,
    job_runs: HashMap<Uuid, JobRun>,
    dead_letters: HashMap<Uuid, DeadLetter>,
}

impl MemoryState {
    /// Existing run for `run`'s idempotency key, if any.
    fn existing_for_key(&self, run: &Run) -> Option<Run> {
        let key = run.idempotency_key.as_ref()?;
        let id = self.idempotency.get(key)?;
        self.runs.get(id).cloned()
    }

    fn insert_run(&mut self, run: &Run) -> Result<(), RepositoryError> {
        if self.runs.contains_key(&run.id) {
            return Err(RepositoryError::Conflict(format!("run {} already exists", run.id)));
        }
        if let Some(key) = &run.idempotency_key {
            self.idempotency.insert(key.clone(), run.id);
        }
        self.runs.insert(run.id, run.clone());
        Ok(())
    }

    fn workflow_run(&self, id: &Uuid) -> Option<WorkflowRun> {
        let run = self.runs.get(id)?;
        let mut wf = self.workflows.get(id)?.clone();
        wf.run = run.clone();
        Some(wf)
    }
}

/// `StateStore` backed by process memory.
#[derive(Default)]
pub struct InMemoryStateStore {
    state: RwLock<MemoryState>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn page<T>(mut items: Vec<T>, limit: u32, offset: u32) -> Page<T> {
    let total = items.len() as u64;
    let items: Vec<T> = items
        .drain(..)
        .skip(offset as usize)
        .take(limit as usize)
        .collect();
    Page {
        items,
        total,
        limit,
        offset,
    }
}

impl StateStore for InMemoryStateStore {
    async fn create_run(&self, run: &Run) -> Result<Run, RepositoryError> {
        let mut state = self.state.write().await;
        if let Some(existing) = state.existing_for_key(run) {
            return Ok(existing);
        }
        state.insert_run(run)?;
        Ok(run.clone())
    }

    async fn create_workflow_run(&self, run: &WorkflowRun) -> Result<WorkflowRun, RepositoryError> {
        let mut state = self.state.write().await;
        if let Some(existing) = state.existing_for_key(&run.run) {
            return state
                .workflow_run(&existing.id)
                .ok_or_else(|| RepositoryError::Conflict(format!(
                    "idempotency key belongs to non-workflow run {}",
                    existing.id
                )));
        }
        state.insert_run(&run.run)?;
        state.workflows.insert(run.run.id, run.clone());
        Ok(run.clone())
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<Run>, RepositoryError> {
        Ok(self.state.read().await.runs.get(run_id).cloned())
    }

    async fn get_workflow_run(&self, run_id: &Uuid) -> Result<Option<WorkflowRun>, RepositoryError> {
        Ok(self.state.read().await.workflow_run(run_id))
    }

    async fn transition_run(
        &self,
        run_id: &Uuid,
        transition: &RunTransition,
    ) -> Result<Run, RepositoryError> {
        let mut state = self.state.write().await;
        let current = state.runs.get(run_id).ok_or(RepositoryError::NotFound)?;
        let next = current.apply_transition(transition, Utc::now())?;
        state.runs.insert(*run_id, next.clone());
        Ok(next)
    }

    async fn request_cancel(&self, run_id: &Uuid) -> Result<Run, RepositoryError> {
        let mut state = self.state.write().await;
        let run = state.runs.get_mut(run_id).ok_or(RepositoryError::NotFound)?;
        run.cancel_requested = true;
        Ok(run.clone())
    }

    async fn list_runs(
        &self,
        filter: &RunFilter,
        limit: u32,
        offset: u32,
    ) -> Result<Page<Run>, RepositoryError> {
        let state = self.state.read().await;
        let mut runs: Vec<Run> = state
            .runs
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(page(runs, limit, offset))
    }

    async fn claim_due_runs(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<Run>, RepositoryError> {
        let state = self.state.read().await;
        let mut due: Vec<Run> = state
            .runs
            .values()
            .filter(|r| {
                r.status == RunStatus::Pending
                    && !r.cancel_requested
                    && r.next_retry_at.is_none_or(|at| at <= now)
            })
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn run_stats(&self, filter: &RunFilter) -> Result<RunStats, RepositoryError> {
        let state = self.state.read().await;
        Ok(RunStats::from_rows(
            state
                .runs
                .values()
                .filter(|r| filter.matches(r))
                .map(|r| (r.status, r.started_at, r.finished_at)),
        ))
    }

    async fn update_workflow_outputs(
        &self,
        run_id: &Uuid,
        outputs: &HashMap<String, serde_json::Value>,
        metrics: &HashMap<String, serde_json::Value>,
    ) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        let wf = state.workflows.get_mut(run_id).ok_or(RepositoryError::NotFound)?;
        wf.outputs = outputs.clone();
        wf.metrics = metrics.clone();
        Ok(())
    }

    async fn create_step_run(&self, step: &StepRun) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        if !state.runs.contains_key(&step.run_id) {
            return Err(RepositoryError::NotFound);
        }
        state.steps.insert(step.id, step.clone());
        Ok(())
    }

    async fn update_step_run(&self, step: &StepRun) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        match state.steps.get_mut(&step.id) {
            Some(existing) => {
                *existing = step.clone();
                Ok(())
            }
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn list_step_runs(&self, run_id: &Uuid) -> Result<Vec<StepRun>, RepositoryError> {
        let state = self.state.read().await;
        let mut steps: Vec<StepRun> = state
            .steps
            .values()
            .filter(|s| s.run_id == *run_id)
            .cloned()
            .collect();
        steps.sort_by(|a, b| a.step_order.cmp(&b.step_order).then(a.id.cmp(&b.id)));
        Ok(steps)
    }

    async fn upsert_schedule(&self, schedule: &Schedule) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        state.schedules.insert(schedule.name.clone(), schedule.clone());
        Ok(())
    }

    async fn get_schedule(&self, name: &str) -> Result<Option<Schedule>, RepositoryError> {
        Ok(self.state.read().await.schedules.get(name).cloned())
    }

    async fn delete_schedule(&self, name: &str) -> Result<bool, RepositoryError> {
        Ok(self.state.write().await.schedules.remove(name).is_some())
    }

    async fn list_schedules(&self) -> Result<Vec<Schedule>, RepositoryError> {
        Ok(self.state.read().await.schedules.values().cloned().collect())
    }

    async fn record_job_run(&self, job: &JobRun) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        state.job_runs.insert(job.id, job.clone());
        Ok(())
    }

    async fn list_job_runs(&self, schedule_name: &str, limit: u32) -> Result<Vec<JobRun>, RepositoryError> {
        let state = self.state.read().await;
        let mut jobs: Vec<JobRun> = state
            .job_runs
            .values()
            .filter(|j| j.schedule_name == schedule_name)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.scheduled_at.cmp(&a.scheduled_at).then(b.id.cmp(&a.id)));
        jobs.truncate(limit as usize);
        Ok(jobs)
    }

    async fn write_dead_letter(&self, letter: &DeadLetter) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        if state.dead_letters.contains_key(&letter.id) {
            return Err(RepositoryError::Conflict(format!(
                "dead letter {} already exists",
                letter.id
            )));
        }
        state.dead_letters.insert(letter.id, letter.clone());
        Ok(())
    }

    async fn get_dead_letter(&self, id: &Uuid) -> Result<Option<DeadLetter>, RepositoryError> {
        Ok(self.state.read().await.dead_letters.get(id).cloned())
    }

    async fn update_dead_letter(&self, letter: &DeadLetter) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        match state.dead_letters.get_mut(&letter.id) {
            Some(existing) => {
                *existing = letter.clone();
                Ok(())
            }
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn list_dead_letters(
        &self,
        filter: &DeadLetterFilter,
        limit: u32,
        offset: u32,
    ) -> Result<Page<DeadLetter>, RepositoryError> {
        let state = self.state.read().await;
        let mut letters: Vec<DeadLetter> = state
            .dead_letters
            .values()
            .filter(|l| filter.matches(l))
            .cloned()
            .collect();
        letters.sort_by(|a, b| b.last_failed_at.cmp(&a.last_failed_at).then(b.id.cmp(&a.id)));
        Ok(page(letters, limit, offset))
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<PurgeReport, RepositoryError> {
        let mut state = self.state.write().await;
        let mut report = PurgeReport::default();

        let expired: Vec<Uuid> = state
            .runs
            .values()
            .filter(|r| {
                matches!(
                    r.status,
                    RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
                ) && r.finished_at.is_some_and(|t| t < cutoff)
            })
            .map(|r| r.id)
            .collect();
        for id in &expired {
            if let Some(run) = state.runs.remove(id) {
                if let Some(key) = run.idempotency_key {
                    state.idempotency.remove(&key);
                }
            }
            state.workflows.remove(id);
            report.runs += 1;
        }

        let before = state.steps.len();
        state.steps.retain(|_, s| !expired.contains(&s.run_id));
        report.step_runs = (before - state.steps.len()) as u64;

        let before = state.job_runs.len();
        state
            .job_runs
            .retain(|_, j| !(j.status.is_terminal() && j.completed_at.is_some_and(|t| t < cutoff)));
        report.job_runs = (before - state.job_runs.len()) as u64;

        let before = state.dead_letters.len();
        state
            .dead_letters
            .retain(|_, l| !(l.status == DeadLetterStatus::Resolved && l.last_failed_at < cutoff));
        report.dead_letters = (before - state.dead_letters.len()) as u64;

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_types::error::PipelineError;
    use cadence_types::run::{RunKind, SubmitRequest};
    use cadence_types::schedule::{JobRunStatus, Trigger};
    use cadence_types::workflow::{StepDefinition, TriggeredBy, WorkflowDefinition};
    use chrono::Duration;
    use serde_json::json;

    fn task(name: &str) -> Run {
        Run::new(RunKind::Task, name, json!({}))
    }

    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_create_run_is_idempotent_by_key() {
        let store = InMemoryStateStore::new();
        let first = SubmitRequest::new(RunKind::Task, "noop", json!({}))
            .with_idempotency_key("k1")
            .into_run(3);
        let second = SubmitRequest::new(RunKind::Task, "noop", json!({"other": true}))
            .with_idempotency_key("k1")
            .into_run(3);

        let a = store.create_run(&first).await.unwrap();
        let b = store.create_run(&second).await.unwrap();
        assert_eq!(a.id, b.id);

        let page = store.list_runs(&RunFilter::default(), 10, 0).await.unwrap();
        assert_eq!(page.total, 1);
    }

    #[tokio::test]
    async fn test_transition_conflict_on_stale_attempt() {
        let store = InMemoryStateStore::new();
        let run = store.create_run(&task("noop")).await.unwrap();
        let claim = RunTransition::from_current(&run, RunStatus::Running);

        store.transition_run(&run.id, &claim).await.unwrap();
        let err = store.transition_run(&run.id, &claim).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_transition_missing_run_is_not_found() {
        let store = InMemoryStateStore::new();
        let run = task("ghost");
        let err = store
            .transition_run(&run.id, &RunTransition::from_current(&run, RunStatus::Running))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
    }

    #[tokio::test]
    async fn test_claim_due_runs_orders_by_priority_and_skips_backoff() {
        let store = InMemoryStateStore::new();
        let low = task("low");
        let mut high = task("high");
        high.priority = 10;
        let mut later = task("later");
        later.next_retry_at = Some(Utc::now() + Duration::hours(1));

        store.create_run(&low).await.unwrap();
        store.create_run(&high).await.unwrap();
        store.create_run(&later).await.unwrap();

        let due = store.claim_due_runs(Utc::now(), 10).await.unwrap();
        let names: Vec<&str> = due.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["high", "low"]);
    }

    #[tokio::test]
    async fn test_workflow_run_outputs_round_trip() {
        let store = InMemoryStateStore::new();
        let def = WorkflowDefinition::new("nightly", vec![StepDefinition::new("a", "noop", 1)]);
        let wf = WorkflowRun::new(&def, json!({}), TriggeredBy::Api);
        store.create_workflow_run(&wf).await.unwrap();

        let outputs = HashMap::from([("a".to_string(), json!({"rows": 3}))]);
        store
            .update_workflow_outputs(&wf.id(), &outputs, &HashMap::new())
            .await
            .unwrap();

        let loaded = store.get_workflow_run(&wf.id()).await.unwrap().unwrap();
        assert_eq!(loaded.outputs["a"]["rows"], 3);
        assert_eq!(loaded.triggered_by, TriggeredBy::Api);
    }

    #[tokio::test]
    async fn test_run_stats_counts_by_status() {
        let store = InMemoryStateStore::new();
        let run = store.create_run(&task("a")).await.unwrap();
        store.create_run(&task("b")).await.unwrap();
        let running = store
            .transition_run(&run.id, &RunTransition::from_current(&run, RunStatus::Running))
            .await
            .unwrap();
        store
            .transition_run(
                &run.id,
                &RunTransition::from_current(&running, RunStatus::Failed)
                    .with_error(&PipelineError::validation("bad input")),
            )
            .await
            .unwrap();

        let stats = store.run_stats(&RunFilter::default()).await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.count(RunStatus::Failed), 1);
        assert_eq!(stats.count(RunStatus::Pending), 1);
        assert_eq!(stats.success_rate, Some(0.0));
    }

    // -----------------------------------------------------------------------
    // Schedules and job runs
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_schedule_upsert_replaces_by_name() {
        let store = InMemoryStateStore::new();
        let schedule = Schedule::new("s", "wf", Trigger::Interval { seconds: 60 });
        store.upsert_schedule(&schedule).await.unwrap();
        store.upsert_schedule(&schedule.with_enabled(false)).await.unwrap();

        let all = store.list_schedules().await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(!all[0].enabled);
        assert!(store.delete_schedule("s").await.unwrap());
        assert!(!store.delete_schedule("s").await.unwrap());
    }

    #[tokio::test]
    async fn test_job_runs_newest_first() {
        let store = InMemoryStateStore::new();
        let t0 = Utc::now();
        let older = JobRun::skipped("s", t0, "misfire");
        let mut newer = JobRun::pending("s", t0 + Duration::minutes(1));
        newer.start(t0);
        store.record_job_run(&older).await.unwrap();
        store.record_job_run(&newer).await.unwrap();

        let jobs = store.list_job_runs("s", 10).await.unwrap();
        assert_eq!(jobs[0].status, JobRunStatus::Running);
        assert_eq!(jobs[1].status, JobRunStatus::Skipped);
    }

    // -----------------------------------------------------------------------
    // Retention
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_purge_removes_only_finished_history() {
        let store = InMemoryStateStore::new();
        let finished = store.create_run(&task("old")).await.unwrap();
        let pending = store.create_run(&task("waiting")).await.unwrap();
        let cancelled = store
            .transition_run(
                &finished.id,
                &RunTransition::from_current(&finished, RunStatus::Cancelled),
            )
            .await
            .unwrap();
        assert!(cancelled.finished_at.is_some());

        let report = store
            .purge_older_than(Utc::now() + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(report.runs, 1);
        assert!(store.get_run(&finished.id).await.unwrap().is_none());
        assert!(store.get_run(&pending.id).await.unwrap().is_some());
    }
}
