//! The `Engine` facade: trigger and query surface over the runner, scheduler,
//! retry manager, and state store.
//!
//! Runs are submitted as `pending` and picked up by the dispatcher loop (or
//! executed inline by `run_workflow` and `replay_dead_letter`). Every failure
//! goes through the `RetryManager`, which decides between a delayed retry,
//! a dead letter, and a terminal failure.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;

use cadence_types::config::EngineConfig;
use cadence_types::dead_letter::{DeadLetter, DeadLetterFilter, DeadLetterStatus, ReplayAttempt};
use cadence_types::error::{ErrorCategory, ErrorContext, PipelineError, RepositoryError};
use cadence_types::event::EngineEvent;
use cadence_types::run::{Page, Run, RunFilter, RunKind, RunStats, RunStatus, RunTransition, SubmitRequest};
use cadence_types::schedule::{JobRun, Schedule};
use cadence_types::workflow::{StepRun, TriggeredBy, WorkflowDefinition, WorkflowRun};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::FutureExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::event::alert::{AlertRouter, AlertSink};
use crate::event::bus::EventBus;
use crate::executor::{ExecutionRequest, ExecutorRegistry};
use crate::retry::{backoff_from_config, RetryManager, REPLAY_OF_KEY};
use crate::schedule::scheduler::{ScheduleCallback, ScheduleFire, ScheduledOutcome, Scheduler};
use crate::schedule::SchedulerError;
use crate::store::{PurgeReport, StateStore};
use crate::workflow::dag::WorkflowGraph;
use crate::workflow::registry::WorkflowRegistry;
use crate::workflow::runner::{panic_message, DagRunner, RunnerSettings};
use crate::workflow::WorkflowError;

/// Metadata key linking a manual retry to the run it retries.
pub const RETRY_OF_KEY: &str = "retry_of";

/// Runs found `running` at startup are recovered in batches of this size.
const RECOVERY_BATCH: u32 = 1_000;

/// How often the dispatcher purges history older than the retention window.
const RETENTION_SWEEP: Duration = Duration::from_secs(3_600);

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors returned by engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("store error: {0}")]
    Store(#[from] RepositoryError),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error("run {0} not found")]
    RunNotFound(Uuid),

    #[error("schedule '{0}' already exists")]
    ScheduleExists(String),

    #[error("dead letter {0} not found")]
    DeadLetterNotFound(Uuid),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

impl EngineError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            EngineError::Pipeline(e) => e.category(),
            EngineError::Store(RepositoryError::Connection) => ErrorCategory::Dependency,
            EngineError::Store(_) => ErrorCategory::Internal,
            EngineError::Workflow(_) => ErrorCategory::Configuration,
            EngineError::Scheduler(SchedulerError::Store(RepositoryError::Connection)) => {
                ErrorCategory::Dependency
            }
            EngineError::Scheduler(SchedulerError::Store(_)) => ErrorCategory::Internal,
            EngineError::Scheduler(SchedulerError::ScheduleNotFound(_)) => ErrorCategory::Validation,
            EngineError::Scheduler(_) => ErrorCategory::Configuration,
            EngineError::RunNotFound(_)
            | EngineError::ScheduleExists(_)
            | EngineError::DeadLetterNotFound(_)
            | EngineError::InvalidOperation(_) => ErrorCategory::Validation,
        }
    }

    pub fn retryable(&self) -> bool {
        match self {
            EngineError::Pipeline(e) => e.retryable(),
            _ => self.category().default_retryable(),
        }
    }
}

impl From<EngineError> for PipelineError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Pipeline(e) => e,
            other => PipelineError::new(other.category(), other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

/// Options for [`Engine::run_workflow`].
#[derive(Debug, Clone, Default)]
pub struct RunWorkflowOptions {
    /// Validate and plan only; nothing is persisted or executed.
    pub dry_run: bool,
    pub triggered_by: TriggeredBy,
    pub partition_key: Option<String>,
    pub idempotency_key: Option<String>,
    pub max_attempts: Option<u32>,
    pub metadata: std::collections::HashMap<String, serde_json::Value>,
}

impl RunWorkflowOptions {
    pub fn dry_run() -> Self {
        Self {
            dry_run: true,
            ..Default::default()
        }
    }

    pub fn triggered_by(mut self, triggered_by: TriggeredBy) -> Self {
        self.triggered_by = triggered_by;
        self
    }
}

/// What [`Engine::run_workflow`] did.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowLaunch {
    /// `None` for dry runs.
    pub run_id: Option<Uuid>,
    /// Final status of the run, `None` for dry runs.
    pub status: Option<RunStatus>,
    /// Step names in serial execution order.
    pub plan: Vec<String>,
}

/// Background loops started by [`Engine::start`].
pub struct EngineHandle {
    cancel: CancellationToken,
    dispatcher: JoinHandle<()>,
    scheduler: JoinHandle<()>,
}

impl EngineHandle {
    /// Stop both loops and wait for them to exit. In-flight runs finish on
    /// their own tasks.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.dispatcher.await {
            tracing::warn!("dispatcher task ended abnormally: {e}");
        }
        if let Err(e) = self.scheduler.await {
            tracing::warn!("scheduler task ended abnormally: {e}");
        }
        tracing::info!("engine stopped");
    }
}

/// How one execution of a run ended, before retry policy is applied.
enum RunOutcome {
    Completed(serde_json::Value),
    Failed {
        error: PipelineError,
        dead_lettered: bool,
    },
    Cancelled,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Workflow execution and scheduling engine.
///
/// Generic over `S: StateStore` for storage flexibility. Construct with
/// [`Engine::new`], register workflows and executors, then call
/// [`Engine::start`] to run the dispatcher and scheduler loops.
pub struct Engine<S: StateStore + 'static> {
    store: Arc<S>,
    config: EngineConfig,
    workflows: Arc<WorkflowRegistry>,
    executors: Arc<ExecutorRegistry>,
    retry: Arc<RetryManager<S>>,
    runner: DagRunner<S>,
    scheduler: Arc<Scheduler<S>>,
    events: EventBus,
    cancellations: DashMap<Uuid, CancellationToken>,
}

impl<S: StateStore + 'static> Engine<S> {
    /// Build an engine. `alerts` receives every alert in addition to the
    /// event bus and the tracing log.
    pub fn new(store: Arc<S>, config: EngineConfig, executors: ExecutorRegistry, alerts: AlertRouter) -> Arc<Self> {
        let events = EventBus::new(config.event_bus_capacity);
        let alerts: Arc<dyn AlertSink> = Arc::new(
            alerts
                .with_sink(Arc::new(events.clone()))
                .with_sink(Arc::new(crate::event::alert::TracingAlertSink)),
        );
        let executors = Arc::new(executors);
        let retry = Arc::new(RetryManager::new(
            Arc::clone(&store),
            backoff_from_config(&config.backoff),
            alerts,
            events.clone(),
        ));
        let runner = DagRunner::new(
            Arc::clone(&store),
            Arc::clone(&executors),
            Arc::clone(&retry),
            events.clone(),
            RunnerSettings::from_config(&config),
        );

        Arc::new_cyclic(|weak: &Weak<Self>| {
            let scheduler = Arc::new(Scheduler::new(
                Arc::clone(&store),
                events.clone(),
                schedule_callback(weak.clone()),
            ));
            Self {
                store,
                config,
                workflows: Arc::new(WorkflowRegistry::new()),
                executors,
                retry,
                runner,
                scheduler,
                events,
                cancellations: DashMap::new(),
            }
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn executors(&self) -> &ExecutorRegistry {
        &self.executors
    }

    pub fn scheduler(&self) -> &Arc<Scheduler<S>> {
        &self.scheduler
    }

    /// Subscribe to run, step, schedule and alert events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Recover interrupted runs and replays, restore schedules, and spawn
    /// the dispatcher and scheduler loops. Both loops stop when `cancel` is
    /// triggered.
    pub async fn start(self: &Arc<Self>, cancel: CancellationToken) -> Result<EngineHandle, EngineError> {
        let recovered = self.recover_interrupted().await?;
        let reconciled = self.reconcile_replays().await?;
        let restored = self.scheduler.restore().await?;

        let scheduler = self.scheduler.spawn(
            Duration::from_millis(self.config.tick_interval_ms.max(1)),
            cancel.child_token(),
        );

        let this = Arc::clone(self);
        let token = cancel.child_token();
        let dispatcher = tokio::spawn(async move {
            let mut dispatch = tokio::time::interval(Duration::from_millis(this.config.dispatch_interval_ms.max(1)));
            dispatch.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut retention = tokio::time::interval(RETENTION_SWEEP);
            retention.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = dispatch.tick() => {
                        if let Err(e) = this.process_due(Utc::now()).await {
                            tracing::warn!("dispatcher pass failed: {e}");
                        }
                    }
                    _ = retention.tick() => {
                        if let Err(e) = this.purge_expired().await {
                            tracing::warn!("retention purge failed: {e}");
                        }
                    }
                }
            }
            tracing::info!("dispatcher stopped");
        });

        tracing::info!(recovered, reconciled, schedules = restored, "engine started");
        Ok(EngineHandle {
            cancel,
            dispatcher,
            scheduler,
        })
    }

    /// Fail every run left `running` by a previous process. The failure is
    /// `TRANSIENT`, so runs with attempts left are retried.
    pub async fn recover_interrupted(&self) -> Result<usize, EngineError> {
        let filter = RunFilter {
            status: Some(RunStatus::Running),
            ..Default::default()
        };
        let page = self.store.list_runs(&filter, RECOVERY_BATCH, 0).await?;
        let mut recovered = 0;
        for run in page.items {
            if self.cancellations.contains_key(&run.id) {
                continue;
            }
            let error = PipelineError::transient("run interrupted before completion")
                .with_context(ErrorContext::new().pipeline(&run.name).run_id(run.id));
            match self.retry.handle_run_failure(&run, &error, false).await {
                Ok(_) => recovered += 1,
                Err(RepositoryError::Conflict(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        if recovered > 0 {
            tracing::warn!(count = recovered, "recovered interrupted runs");
        }
        Ok(recovered)
    }

    /// Settle dead letters left `retrying` by a previous process.
    ///
    /// The letter's replay run is found through its `replay_of` metadata. A
    /// replay run that never started is cancelled; its final outcome is then
    /// recorded on the letter like any other replay. A letter without a
    /// replay run goes back to `exhausted`. Call after
    /// [`recover_interrupted`](Self::recover_interrupted).
    pub async fn reconcile_replays(&self) -> Result<usize, EngineError> {
        let filter = DeadLetterFilter {
            status: Some(DeadLetterStatus::Retrying),
            ..Default::default()
        };
        let letters = self.store.list_dead_letters(&filter, RECOVERY_BATCH, 0).await?;
        let mut reconciled = 0;
        for mut letter in letters.items {
            let replay = match self.find_replay_run(&letter).await? {
                Some(run) if run.status == RunStatus::Pending => Some(self.cancel_pending(&run).await?),
                other => other,
            };
            match replay.filter(|run| run.status.is_terminal()) {
                Some(run) => {
                    let succeeded = run.status == RunStatus::Completed;
                    let error = (!succeeded)
                        .then(|| run.error.clone().unwrap_or_else(|| format!("replay run ended {}", run.status)));
                    letter.record_replay(ReplayAttempt {
                        run_id: run.id,
                        attempted_at: run.finished_at.unwrap_or_else(Utc::now),
                        succeeded,
                        error,
                    });
                }
                None => letter.status = DeadLetterStatus::Exhausted,
            }
            self.store.update_dead_letter(&letter).await?;
            tracing::warn!(dead_letter_id = %letter.id, status = letter.status.as_str(), "reconciled interrupted replay");
            reconciled += 1;
        }
        Ok(reconciled)
    }

    /// The newest replay run of `letter` not yet recorded on it.
    async fn find_replay_run(&self, letter: &DeadLetter) -> Result<Option<Run>, EngineError> {
        let Ok(request) = serde_json::from_value::<SubmitRequest>(letter.payload.clone()) else {
            return Ok(None);
        };
        let filter = RunFilter {
            kind: Some(request.kind),
            name: Some(request.name),
            ..Default::default()
        };
        let tag = serde_json::json!(letter.id.to_string());
        let runs = self.store.list_runs(&filter, RECOVERY_BATCH, 0).await?;
        Ok(runs
            .items
            .into_iter()
            .filter(|run| run.metadata.get(REPLAY_OF_KEY) == Some(&tag))
            .filter(|run| !letter.replay_attempts.iter().any(|a| a.run_id == run.id))
            .max_by_key(|run| run.created_at))
    }

    /// Claim and spawn every pending run due at `now`.
    pub async fn process_due(
        self: &Arc<Self>,
        now: DateTime<Utc>,
    ) -> Result<Vec<JoinHandle<Result<Run, EngineError>>>, EngineError> {
        let due = self
            .store
            .claim_due_runs(now, self.config.dispatch_batch_size.max(1))
            .await?;
        Ok(due
            .into_iter()
            .map(|run| {
                let this = Arc::clone(self);
                tokio::spawn(async move { this.execute_run(run.id).await })
            })
            .collect())
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Validate and register a workflow definition.
    pub fn register_workflow(&self, definition: WorkflowDefinition) -> Result<Arc<WorkflowGraph>, EngineError> {
        Ok(self.workflows.register(definition)?)
    }

    pub fn workflow(&self, name: &str) -> Option<Arc<WorkflowGraph>> {
        self.workflows.get(name)
    }

    pub fn workflow_names(&self) -> Vec<String> {
        self.workflows.names()
    }

    // -----------------------------------------------------------------------
    // Trigger surface
    // -----------------------------------------------------------------------

    /// Submit work for asynchronous execution. A duplicate idempotency key
    /// returns the id of the existing run.
    pub async fn submit_run(&self, request: SubmitRequest) -> Result<Uuid, EngineError> {
        let run = self
            .create_submitted(request, TriggeredBy::Api, None)
            .await?;
        Ok(run.id)
    }

    /// Persist a submission as a pending run.
    async fn create_submitted(
        &self,
        request: SubmitRequest,
        triggered_by: TriggeredBy,
        partition_key: Option<String>,
    ) -> Result<Run, EngineError> {
        if request.name.trim().is_empty() {
            return Err(PipelineError::validation("run name must not be empty").into());
        }
        if request.max_attempts == Some(0) {
            return Err(PipelineError::validation("max_attempts must be at least 1").into());
        }

        let (candidate, created) = match request.kind {
            RunKind::Workflow => {
                let graph = self.workflows.resolve(&request.name)?;
                let default_attempts = graph
                    .definition()
                    .max_attempts
                    .unwrap_or(self.config.default_max_attempts);
                let mut workflow_run = WorkflowRun::new(graph.definition(), serde_json::Value::Null, triggered_by);
                workflow_run.partition_key = partition_key;
                workflow_run.run = request.into_run(default_attempts);
                let candidate = workflow_run.id();
                (candidate, self.store.create_workflow_run(&workflow_run).await?.run)
            }
            RunKind::Task | RunKind::Pipeline => {
                if !self.executors.contains(&request.name) {
                    return Err(PipelineError::configuration(format!(
                        "no executor registered for '{}'",
                        request.name
                    ))
                    .into());
                }
                let run = request.into_run(self.config.default_max_attempts);
                (run.id, self.store.create_run(&run).await?)
            }
        };
        if created.id != candidate {
            tracing::info!(
                run_id = %created.id,
                key = created.idempotency_key.as_deref().unwrap_or(""),
                "duplicate idempotency key, returning existing run"
            );
            return Ok(created);
        }

        tracing::info!(run_id = %created.id, kind = created.kind.as_str(), name = created.name.as_str(), "run submitted");
        self.events.publish(EngineEvent::RunSubmitted {
            run_id: created.id,
            kind: created.kind,
            name: created.name.clone(),
        });
        Ok(created)
    }

    /// Execute one pending run to completion (or to its next retry).
    ///
    /// The run is claimed with a `pending -> running` compare-and-set; if
    /// another worker claimed it first, the current state is returned as is.
    pub async fn execute_run(&self, run_id: Uuid) -> Result<Run, EngineError> {
        let run = self
            .store
            .get_run(&run_id)
            .await?
            .ok_or(EngineError::RunNotFound(run_id))?;
        if run.status != RunStatus::Pending {
            return Ok(run);
        }
        if run.cancel_requested {
            return self.cancel_pending(&run).await;
        }

        let running = match self
            .store
            .transition_run(&run_id, &RunTransition::from_current(&run, RunStatus::Running))
            .await
        {
            Ok(running) => running,
            Err(RepositoryError::Conflict(_)) => {
                tracing::debug!(run_id = %run_id, "run claimed elsewhere");
                return self
                    .store
                    .get_run(&run_id)
                    .await?
                    .ok_or(EngineError::RunNotFound(run_id));
            }
            Err(e) => return Err(e.into()),
        };

        let cancel = CancellationToken::new();
        self.cancellations.insert(run_id, cancel.clone());
        // A cancel may have landed between the read and the claim.
        if self
            .store
            .get_run(&run_id)
            .await?
            .is_some_and(|r| r.cancel_requested)
        {
            cancel.cancel();
        }

        tracing::info!(run_id = %run_id, name = running.name.as_str(), attempt = running.attempt, "run started");
        self.events.publish(EngineEvent::RunStarted {
            run_id,
            name: running.name.clone(),
            attempt: running.attempt,
        });

        let outcome = match running.kind {
            RunKind::Workflow => self.execute_workflow(&running, cancel.clone()).await,
            RunKind::Task | RunKind::Pipeline => self.execute_task(&running, cancel.clone()).await,
        };
        self.cancellations.remove(&run_id);

        self.finalize(&running, outcome).await
    }

    async fn execute_task(&self, run: &Run, cancel: CancellationToken) -> RunOutcome {
        let executor = match self.executors.resolve(&run.name) {
            Ok(executor) => executor,
            Err(error) => {
                return RunOutcome::Failed {
                    error,
                    dead_lettered: false,
                };
            }
        };

        let mut request = ExecutionRequest::for_task(run.id, run.name.clone(), run.params.clone(), run.attempt);
        request.cancel = cancel.child_token();
        let timeout = Duration::from_secs(self.config.default_step_timeout_secs);
        let call = AssertUnwindSafe(executor.execute_boxed(request)).catch_unwind();

        // The executor sees the token but is never dropped mid-call.
        let result = match tokio::time::timeout(timeout, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(PipelineError::internal_message(format!(
                "executor '{}' panicked: {}",
                run.name,
                panic_message(panic.as_ref())
            ))),
            Err(_) => Err(PipelineError::timeout(format!(
                "executor '{}' exceeded {}s",
                run.name,
                timeout.as_secs()
            ))),
        };
        if cancel.is_cancelled() {
            tracing::debug!(run_id = %run.id, succeeded = result.is_ok(), "task finished after cancellation");
            return RunOutcome::Cancelled;
        }

        match result {
            Ok(output) => RunOutcome::Completed(output.data),
            Err(error) => RunOutcome::Failed {
                error,
                dead_lettered: false,
            },
        }
    }

    async fn execute_workflow(&self, run: &Run, cancel: CancellationToken) -> RunOutcome {
        let failed = |error: PipelineError| RunOutcome::Failed {
            error,
            dead_lettered: false,
        };

        let graph = match self.workflows.resolve(&run.name) {
            Ok(graph) => graph,
            Err(e) => return failed(e.into()),
        };
        let workflow_run = match self.store.get_workflow_run(&run.id).await {
            Ok(Some(mut workflow_run)) => {
                workflow_run.run = run.clone();
                workflow_run
            }
            Ok(None) => {
                return failed(PipelineError::internal_message(format!(
                    "run {} has no workflow record",
                    run.id
                )));
            }
            Err(e) => return failed(e.into()),
        };

        match self.runner.run(&workflow_run, &graph, cancel).await {
            Ok(outcome) => match outcome.status {
                RunStatus::Completed => RunOutcome::Completed(serde_json::json!(outcome.outputs)),
                RunStatus::Cancelled => RunOutcome::Cancelled,
                _ => RunOutcome::Failed {
                    error: outcome
                        .error
                        .unwrap_or_else(|| PipelineError::internal_message("workflow failed without an error")),
                    dead_lettered: outcome.dead_lettered,
                },
            },
            Err(e) => failed(e.into()),
        }
    }

    /// Record the outcome of a running run.
    async fn finalize(&self, running: &Run, outcome: RunOutcome) -> Result<Run, EngineError> {
        match outcome {
            RunOutcome::Completed(result) => {
                let done = self
                    .store
                    .transition_run(
                        &running.id,
                        &RunTransition::from_current(running, RunStatus::Completed).with_result(result),
                    )
                    .await?;
                let duration_ms = done.duration_ms().unwrap_or(0).max(0) as u64;
                tracing::info!(run_id = %done.id, name = done.name.as_str(), duration_ms, "run completed");
                self.events.publish(EngineEvent::RunCompleted {
                    run_id: done.id,
                    name: done.name.clone(),
                    duration_ms,
                });
                Ok(done)
            }
            RunOutcome::Cancelled => {
                let cancelled = self
                    .store
                    .transition_run(&running.id, &RunTransition::from_current(running, RunStatus::Cancelled))
                    .await?;
                tracing::info!(run_id = %cancelled.id, "run cancelled");
                self.events.publish(EngineEvent::RunCancelled { run_id: cancelled.id });
                Ok(cancelled)
            }
            RunOutcome::Failed { error, dead_lettered } => {
                let error = error.with_context(ErrorContext::new().pipeline(&running.name).run_id(running.id));
                Ok(self
                    .retry
                    .handle_run_failure(running, &error, dead_lettered)
                    .await?)
            }
        }
    }

    /// Validate a workflow and, unless `dry_run`, execute it inline.
    pub async fn run_workflow(
        &self,
        name: &str,
        params: serde_json::Value,
        options: RunWorkflowOptions,
    ) -> Result<WorkflowLaunch, EngineError> {
        let graph = self.workflows.resolve(name)?;
        let plan: Vec<String> = graph.execution_plan().iter().map(|s| s.name.clone()).collect();

        if options.dry_run {
            tracing::info!(workflow = name, steps = plan.len(), "dry run validated");
            return Ok(WorkflowLaunch {
                run_id: None,
                status: None,
                plan,
            });
        }

        let mut request = SubmitRequest::new(RunKind::Workflow, name, params);
        request.idempotency_key = options.idempotency_key;
        request.max_attempts = options.max_attempts;
        request.metadata = options.metadata;
        let run = self
            .create_submitted(request, options.triggered_by, options.partition_key)
            .await?;
        let run = self.execute_run(run.id).await?;

        Ok(WorkflowLaunch {
            run_id: Some(run.id),
            status: Some(run.status),
            plan,
        })
    }

    /// Follow `run` through its run-level retries until it is terminal.
    ///
    /// Retries are executed inline once due; a run claimed by the dispatcher
    /// is polled instead.
    async fn run_to_completion(&self, mut run: Run) -> Result<Run, EngineError> {
        let poll = Duration::from_millis(self.config.dispatch_interval_ms.max(1));
        while !run.status.is_terminal() {
            if run.status == RunStatus::Pending {
                if let Some(wait) = run.next_retry_at.and_then(|at| (at - Utc::now()).to_std().ok()) {
                    tokio::time::sleep(wait).await;
                }
                run = self.execute_run(run.id).await?;
            } else {
                tokio::time::sleep(poll).await;
                run = self
                    .store
                    .get_run(&run.id)
                    .await?
                    .ok_or(EngineError::RunNotFound(run.id))?;
            }
        }
        Ok(run)
    }

    /// Request cancellation. Pending runs are cancelled immediately; running
    /// runs stop at the next step boundary.
    pub async fn cancel_run(&self, run_id: Uuid) -> Result<Run, EngineError> {
        let run = self
            .store
            .get_run(&run_id)
            .await?
            .ok_or(EngineError::RunNotFound(run_id))?;
        if run.status.is_terminal() {
            return Err(EngineError::InvalidOperation(format!("run {run_id} is already {}", run.status)));
        }

        let run = self.store.request_cancel(&run_id).await?;
        if let Some(token) = self.cancellations.get(&run_id) {
            token.cancel();
        }
        match run.status {
            RunStatus::Pending => self.cancel_pending(&run).await,
            _ => {
                tracing::info!(run_id = %run_id, "cancellation requested");
                Ok(run)
            }
        }
    }

    async fn cancel_pending(&self, run: &Run) -> Result<Run, EngineError> {
        match self
            .store
            .transition_run(&run.id, &RunTransition::from_current(run, RunStatus::Cancelled))
            .await
        {
            Ok(cancelled) => {
                tracing::info!(run_id = %run.id, "run cancelled");
                self.events.publish(EngineEvent::RunCancelled { run_id: run.id });
                Ok(cancelled)
            }
            // Claimed by the dispatcher in the meantime; the flag stops it.
            Err(RepositoryError::Conflict(_)) => {
                if let Some(token) = self.cancellations.get(&run.id) {
                    token.cancel();
                }
                self.store
                    .get_run(&run.id)
                    .await?
                    .ok_or(EngineError::RunNotFound(run.id))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Manually retry a failed run as a brand-new run linked by `retry_of`.
    pub async fn retry_run(&self, run_id: Uuid) -> Result<Uuid, EngineError> {
        let run = self
            .store
            .get_run(&run_id)
            .await?
            .ok_or(EngineError::RunNotFound(run_id))?;
        if run.status != RunStatus::Failed {
            return Err(EngineError::InvalidOperation(format!(
                "only failed runs can be retried, run {run_id} is {}",
                run.status
            )));
        }

        let partition_key = match run.kind {
            RunKind::Workflow => self
                .store
                .get_workflow_run(&run_id)
                .await?
                .and_then(|w| w.partition_key),
            _ => None,
        };
        let mut request = run.to_submission();
        request
            .metadata
            .insert(RETRY_OF_KEY.to_string(), serde_json::json!(run_id.to_string()));
        let retry = self
            .create_submitted(request, TriggeredBy::Manual, partition_key)
            .await?;
        tracing::info!(run_id = %retry.id, retry_of = %run_id, "manual retry submitted");
        Ok(retry.id)
    }

    // -----------------------------------------------------------------------
    // Schedules
    // -----------------------------------------------------------------------

    /// Register a new schedule. Fails if the name is taken.
    pub async fn create_schedule(&self, schedule: Schedule) -> Result<Schedule, EngineError> {
        if self.scheduler.contains(&schedule.name) || self.store.get_schedule(&schedule.name).await?.is_some() {
            return Err(EngineError::ScheduleExists(schedule.name));
        }
        if !self.workflows.contains(&schedule.workflow) {
            tracing::warn!(
                schedule = schedule.name.as_str(),
                workflow = schedule.workflow.as_str(),
                "schedule targets a workflow that is not registered yet"
            );
        }
        Ok(self.scheduler.register(schedule).await?)
    }

    /// Replace an existing schedule as a whole.
    pub async fn update_schedule(&self, mut schedule: Schedule) -> Result<Schedule, EngineError> {
        let existing = self
            .store
            .get_schedule(&schedule.name)
            .await?
            .ok_or_else(|| SchedulerError::ScheduleNotFound(schedule.name.clone()))?;
        schedule.created_at = existing.created_at;
        schedule.updated_at = Utc::now();
        Ok(self.scheduler.register(schedule).await?)
    }

    pub async fn delete_schedule(&self, name: &str) -> Result<(), EngineError> {
        if !self.scheduler.remove(name).await? {
            return Err(SchedulerError::ScheduleNotFound(name.to_string()).into());
        }
        Ok(())
    }

    pub async fn pause_schedule(&self, name: &str) -> Result<Schedule, EngineError> {
        Ok(self.scheduler.set_enabled(name, false).await?)
    }

    pub async fn resume_schedule(&self, name: &str) -> Result<Schedule, EngineError> {
        Ok(self.scheduler.set_enabled(name, true).await?)
    }

    /// Fire a schedule now and wait for its job run to finish.
    pub async fn run_now(&self, name: &str) -> Result<JobRun, EngineError> {
        Ok(self.scheduler.run_now(name).await?)
    }

    pub fn next_fire_times(&self, name: &str, count: usize) -> Result<Vec<DateTime<Utc>>, EngineError> {
        Ok(self.scheduler.next_fire_times(name, count)?)
    }

    pub async fn get_schedule(&self, name: &str) -> Result<Option<Schedule>, EngineError> {
        Ok(self.store.get_schedule(name).await?)
    }

    pub async fn list_schedules(&self) -> Result<Vec<Schedule>, EngineError> {
        Ok(self.store.list_schedules().await?)
    }

    pub async fn list_job_runs(&self, schedule_name: &str, limit: u32) -> Result<Vec<JobRun>, EngineError> {
        Ok(self.store.list_job_runs(schedule_name, limit).await?)
    }

    // -----------------------------------------------------------------------
    // Dead letters
    // -----------------------------------------------------------------------

    /// Re-submit a dead letter's payload as a new single-attempt run and
    /// execute it. Success resolves the letter; failure appends the attempt
    /// and leaves it exhausted. The original run is never touched.
    pub async fn replay_dead_letter(&self, id: Uuid) -> Result<DeadLetter, EngineError> {
        let mut letter = self
            .store
            .get_dead_letter(&id)
            .await?
            .ok_or(EngineError::DeadLetterNotFound(id))?;
        match letter.status {
            DeadLetterStatus::Resolved => {
                return Err(EngineError::InvalidOperation(format!("dead letter {id} is already resolved")));
            }
            DeadLetterStatus::Retrying => {
                return Err(EngineError::InvalidOperation(format!("dead letter {id} is already being replayed")));
            }
            DeadLetterStatus::Pending | DeadLetterStatus::Exhausted => {}
        }

        let mut request: SubmitRequest = serde_json::from_value(letter.payload.clone())
            .map_err(|e| PipelineError::validation(format!("dead letter {id} has an unreadable payload: {e}")))?;
        request.idempotency_key = None;
        request.max_attempts = Some(1);
        request
            .metadata
            .insert(REPLAY_OF_KEY.to_string(), serde_json::json!(id.to_string()));

        // The replay run exists before the letter says so, so a restart can
        // always find it.
        let replay = self.create_submitted(request, TriggeredBy::Manual, None).await?;
        let previous_status = letter.status;
        letter.status = DeadLetterStatus::Retrying;
        self.store.update_dead_letter(&letter).await?;
        tracing::info!(dead_letter_id = %id, source_run_id = %letter.source_run_id, run_id = %replay.id, "replaying dead letter");

        let run = match self.execute_run(replay.id).await {
            Ok(run) => run,
            Err(e) => {
                letter.status = previous_status;
                self.store.update_dead_letter(&letter).await?;
                return Err(e);
            }
        };

        let succeeded = run.status == RunStatus::Completed;
        letter.record_replay(ReplayAttempt {
            run_id: run.id,
            attempted_at: Utc::now(),
            succeeded,
            error: run.error.clone(),
        });
        self.store.update_dead_letter(&letter).await?;

        if succeeded {
            tracing::info!(dead_letter_id = %id, run_id = %run.id, "dead letter resolved");
        } else {
            tracing::warn!(
                dead_letter_id = %id,
                run_id = %run.id,
                error = run.error.as_deref().unwrap_or(""),
                "dead letter replay failed"
            );
        }
        Ok(letter)
    }

    pub async fn get_dead_letter(&self, id: Uuid) -> Result<Option<DeadLetter>, EngineError> {
        Ok(self.store.get_dead_letter(&id).await?)
    }

    pub async fn list_dead_letters(
        &self,
        filter: &DeadLetterFilter,
        limit: u32,
        offset: u32,
    ) -> Result<Page<DeadLetter>, EngineError> {
        Ok(self.store.list_dead_letters(filter, limit, offset).await?)
    }

    // -----------------------------------------------------------------------
    // Query surface
    // -----------------------------------------------------------------------

    pub async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>, EngineError> {
        Ok(self.store.get_run(&run_id).await?)
    }

    pub async fn get_workflow_run(&self, run_id: Uuid) -> Result<Option<WorkflowRun>, EngineError> {
        Ok(self.store.get_workflow_run(&run_id).await?)
    }

    pub async fn list_runs(&self, filter: &RunFilter, limit: u32, offset: u32) -> Result<Page<Run>, EngineError> {
        Ok(self.store.list_runs(filter, limit, offset).await?)
    }

    pub async fn list_step_runs(&self, run_id: Uuid) -> Result<Vec<StepRun>, EngineError> {
        Ok(self.store.list_step_runs(&run_id).await?)
    }

    pub async fn run_stats(&self, filter: &RunFilter) -> Result<RunStats, EngineError> {
        Ok(self.store.run_stats(filter).await?)
    }

    /// Purge terminal history older than `retention_days`.
    pub async fn purge_expired(&self) -> Result<PurgeReport, EngineError> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(self.config.retention_days));
        self.purge_older_than(cutoff).await
    }

    pub async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<PurgeReport, EngineError> {
        let report = self.store.purge_older_than(cutoff).await?;
        if report != PurgeReport::default() {
            tracing::info!(
                runs = report.runs,
                step_runs = report.step_runs,
                job_runs = report.job_runs,
                dead_letters = report.dead_letters,
                %cutoff,
                "purged expired history"
            );
        }
        Ok(report)
    }
}

/// Scheduler callback that runs the schedule's workflow inline. The job run
/// reports the workflow run's final state, after any run-level retries.
fn schedule_callback<S: StateStore + 'static>(engine: Weak<Engine<S>>) -> ScheduleCallback {
    Arc::new(move |fire: ScheduleFire| {
        let engine = engine.clone();
        async move {
            let engine = engine
                .upgrade()
                .ok_or_else(|| PipelineError::internal_message("engine is shutting down"))?;
            let mut options = RunWorkflowOptions::default().triggered_by(TriggeredBy::Schedule);
            options
                .metadata
                .insert("schedule".to_string(), serde_json::json!(fire.schedule_name));
            options
                .metadata
                .insert("job_run_id".to_string(), serde_json::json!(fire.job_run_id.to_string()));

            let launch = engine
                .run_workflow(&fire.workflow, fire.params, options)
                .await
                .map_err(PipelineError::from)?;
            let run_id = launch
                .run_id
                .ok_or_else(|| PipelineError::internal_message("scheduled run produced no run id"))?;
            let run = engine
                .get_run(run_id)
                .await
                .map_err(PipelineError::from)?
                .ok_or_else(|| PipelineError::internal_message(format!("run {run_id} vanished")))?;
            let run = engine.run_to_completion(run).await.map_err(PipelineError::from)?;

            Ok(ScheduledOutcome {
                run_id,
                status: run.status,
                result: run.result,
                error: run.error,
            })
        }
        .boxed()
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use cadence_types::config::BackoffConfig;
    use cadence_types::event::AlertSeverity;
    use cadence_types::schedule::{JobRunStatus, Trigger};
    use cadence_types::workflow::{StepDefinition, StepStatus};
    use futures_util::future::BoxFuture;
    use serde_json::json;

    use crate::executor::{ExecutionOutput, FnExecutor};
    use crate::store::memory::InMemoryStateStore;

    fn test_config() -> EngineConfig {
        EngineConfig {
            backoff: BackoffConfig::Fixed { delay_ms: 0 },
            ..Default::default()
        }
    }

    fn engine_with(executors: ExecutorRegistry) -> Arc<Engine<InMemoryStateStore>> {
        Engine::new(
            Arc::new(InMemoryStateStore::new()),
            test_config(),
            executors,
            AlertRouter::new(),
        )
    }

    fn executor<F>(f: F) -> FnExecutor<F>
    where
        F: Fn(ExecutionRequest) -> BoxFuture<'static, Result<ExecutionOutput, PipelineError>>
            + Send
            + Sync
            + 'static,
    {
        FnExecutor::new(f)
    }

    async fn drain(engine: &Arc<Engine<InMemoryStateStore>>) -> Vec<Run> {
        let mut runs = Vec::new();
        for handle in engine.process_due(Utc::now()).await.unwrap() {
            runs.push(handle.await.unwrap().unwrap());
        }
        runs
    }

    // -----------------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_noop_task_runs_to_completion() {
        let engine = engine_with(ExecutorRegistry::with_builtins());
        let id = engine
            .submit_run(SubmitRequest::new(RunKind::Task, "noop", json!({"x": 1})))
            .await
            .unwrap();

        let pending = engine.get_run(id).await.unwrap().unwrap();
        assert_eq!(pending.status, RunStatus::Pending);

        let done = drain(&engine).await;
        assert_eq!(done.len(), 1);
        let run = engine.get_run(id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.result, Some(json!({"x": 1})));
        let (started, finished) = (run.started_at.unwrap(), run.finished_at.unwrap());
        assert!(finished >= started);
    }

    #[tokio::test]
    async fn test_idempotency_key_yields_one_run() {
        let engine = engine_with(ExecutorRegistry::with_builtins());
        let request = SubmitRequest::new(RunKind::Task, "noop", json!({})).with_idempotency_key("nightly-2024-06-01");

        let first = engine.submit_run(request.clone()).await.unwrap();
        let second = engine.submit_run(request).await.unwrap();

        assert_eq!(first, second);
        let page = engine.list_runs(&RunFilter::default(), 10, 0).await.unwrap();
        assert_eq!(page.total, 1);
    }

    #[tokio::test]
    async fn test_submit_validation() {
        let engine = engine_with(ExecutorRegistry::with_builtins());

        let err = engine
            .submit_run(SubmitRequest::new(RunKind::Task, "ghost", json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Configuration);
        assert!(!err.retryable());

        let err = engine
            .submit_run(SubmitRequest::new(RunKind::Task, "  ", json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Validation);

        let err = engine
            .submit_run(SubmitRequest::new(RunKind::Workflow, "unregistered", json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Configuration);
    }

    // -----------------------------------------------------------------------
    // Retry and dead letters
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_transient_task_retries_then_dead_letters() {
        let executors = ExecutorRegistry::new();
        executors.register(
            "flaky",
            executor(|_req: ExecutionRequest| async { Err(PipelineError::transient("connection reset")) }.boxed()),
        );
        let engine = engine_with(executors);
        let mut events = engine.subscribe();
        let id = engine
            .submit_run(SubmitRequest::new(RunKind::Task, "flaky", json!({})).with_max_attempts(2))
            .await
            .unwrap();

        let first = drain(&engine).await;
        assert_eq!(first[0].status, RunStatus::Pending);
        assert_eq!(first[0].attempt, 2);

        let second = drain(&engine).await;
        assert_eq!(second[0].status, RunStatus::Failed);
        assert_eq!(second[0].error_category, Some(ErrorCategory::Transient));
        assert_eq!(second[0].retryable, Some(true));

        let letters = engine
            .list_dead_letters(&DeadLetterFilter::default(), 10, 0)
            .await
            .unwrap();
        assert_eq!(letters.total, 1);
        assert_eq!(letters.items[0].source_run_id, id);
        assert_eq!(letters.items[0].retry_count, 2);
        assert_eq!(letters.items[0].status, DeadLetterStatus::Exhausted);

        let mut critical = 0;
        while let Ok(event) = events.try_recv() {
            if let EngineEvent::Alert(alert) = event {
                if alert.severity == AlertSeverity::Critical {
                    critical += 1;
                }
            }
        }
        assert_eq!(critical, 1);
    }

    #[tokio::test]
    async fn test_exhausted_step_dead_letters_once() {
        let executors = ExecutorRegistry::with_builtins();
        executors.register(
            "flaky",
            executor(|_req: ExecutionRequest| async { Err(PipelineError::transient("connection reset")) }.boxed()),
        );
        let engine = engine_with(executors);
        engine
            .register_workflow(WorkflowDefinition::new(
                "ingest",
                vec![
                    StepDefinition::new("pull", "flaky", 1).with_max_attempts(2),
                    StepDefinition::new("load", "noop", 2).depends_on(["pull"]),
                ],
            ))
            .unwrap();
        let id = engine
            .submit_run(SubmitRequest::new(RunKind::Workflow, "ingest", json!({})).with_max_attempts(3))
            .await
            .unwrap();

        for _ in 0..5 {
            drain(&engine).await;
        }

        let run = engine.get_run(id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.attempt, 1);
        assert!(run.next_retry_at.is_none());

        let letters = engine
            .list_dead_letters(&DeadLetterFilter::default(), 10, 0)
            .await
            .unwrap();
        assert_eq!(letters.total, 1);
        assert_eq!(letters.items[0].source_step.as_deref(), Some("pull"));
        assert_eq!(letters.items[0].retry_count, 2);

        let steps = engine.list_step_runs(id).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn test_dead_letter_replay() {
        let healthy = Arc::new(AtomicBool::new(false));
        let flag = healthy.clone();
        let executors = ExecutorRegistry::new();
        executors.register(
            "upstream",
            executor(move |req: ExecutionRequest| {
                let up = flag.load(Ordering::SeqCst);
                async move {
                    if up {
                        Ok(ExecutionOutput::new(req.params))
                    } else {
                        Err(PipelineError::dependency("upstream unavailable"))
                    }
                }
                .boxed()
            }),
        );
        let engine = engine_with(executors);
        let original_id = engine
            .submit_run(SubmitRequest::new(RunKind::Task, "upstream", json!({"batch": 7})).with_max_attempts(1))
            .await
            .unwrap();
        drain(&engine).await;
        let original = engine.get_run(original_id).await.unwrap().unwrap();

        let letters = engine
            .list_dead_letters(&DeadLetterFilter::default(), 10, 0)
            .await
            .unwrap();
        let letter_id = letters.items[0].id;

        // Still down: stays exhausted, no new dead letter.
        let letter = engine.replay_dead_letter(letter_id).await.unwrap();
        assert_eq!(letter.status, DeadLetterStatus::Exhausted);
        assert_eq!(letter.replay_attempts.len(), 1);
        assert!(!letter.replay_attempts[0].succeeded);
        let all = engine
            .list_dead_letters(&DeadLetterFilter::default(), 10, 0)
            .await
            .unwrap();
        assert_eq!(all.total, 1);

        // Recovered: resolved, with the original payload.
        healthy.store(true, Ordering::SeqCst);
        let letter = engine.replay_dead_letter(letter_id).await.unwrap();
        assert_eq!(letter.status, DeadLetterStatus::Resolved);
        let replay = engine
            .get_run(letter.replay_attempts[1].run_id)
            .await
            .unwrap()
            .unwrap();
        assert_ne!(replay.id, original_id);
        assert_eq!(replay.params, json!({"batch": 7}));
        assert_eq!(replay.result, Some(json!({"batch": 7})));
        assert_eq!(replay.metadata[REPLAY_OF_KEY], json!(letter_id.to_string()));

        assert_eq!(engine.get_run(original_id).await.unwrap().unwrap(), original);
        assert!(matches!(
            engine.replay_dead_letter(letter_id).await,
            Err(EngineError::InvalidOperation(_))
        ));
    }

    /// Leave `letter_id` in `retrying` with a replay run in `status`, as a
    /// crash in the middle of a replay would.
    async fn interrupted_replay(
        engine: &Arc<Engine<InMemoryStateStore>>,
        letter_id: Uuid,
        status: RunStatus,
    ) -> Uuid {
        let mut letter = engine.get_dead_letter(letter_id).await.unwrap().unwrap();
        let mut request: SubmitRequest = serde_json::from_value(letter.payload.clone()).unwrap();
        request.max_attempts = Some(1);
        request
            .metadata
            .insert(REPLAY_OF_KEY.to_string(), json!(letter_id.to_string()));
        let replay = engine.submit_run(request).await.unwrap();
        if status == RunStatus::Running {
            let run = engine.get_run(replay).await.unwrap().unwrap();
            engine
                .store()
                .transition_run(&replay, &RunTransition::from_current(&run, RunStatus::Running))
                .await
                .unwrap();
        }
        letter.status = DeadLetterStatus::Retrying;
        engine.store().update_dead_letter(&letter).await.unwrap();
        replay
    }

    #[tokio::test]
    async fn test_interrupted_replay_is_reconciled() {
        let executors = ExecutorRegistry::with_builtins();
        executors.register(
            "upstream",
            executor(|_req: ExecutionRequest| async { Err(PipelineError::dependency("upstream unavailable")) }.boxed()),
        );
        let engine = engine_with(executors);
        engine
            .submit_run(SubmitRequest::new(RunKind::Task, "upstream", json!({})).with_max_attempts(1))
            .await
            .unwrap();
        drain(&engine).await;
        let letter_id = engine
            .list_dead_letters(&DeadLetterFilter::default(), 10, 0)
            .await
            .unwrap()
            .items[0]
            .id;

        // Crashed while the replay was running.
        let replay = interrupted_replay(&engine, letter_id, RunStatus::Running).await;
        assert!(matches!(
            engine.replay_dead_letter(letter_id).await,
            Err(EngineError::InvalidOperation(_))
        ));
        assert_eq!(engine.recover_interrupted().await.unwrap(), 1);
        assert_eq!(engine.reconcile_replays().await.unwrap(), 1);

        let letter = engine.get_dead_letter(letter_id).await.unwrap().unwrap();
        assert_eq!(letter.status, DeadLetterStatus::Exhausted);
        assert_eq!(letter.replay_attempts.len(), 1);
        assert_eq!(letter.replay_attempts[0].run_id, replay);
        assert!(!letter.replay_attempts[0].succeeded);
        assert_eq!(engine.get_run(replay).await.unwrap().unwrap().status, RunStatus::Failed);

        // Crashed before the replay run was picked up.
        let queued = interrupted_replay(&engine, letter_id, RunStatus::Pending).await;
        assert_eq!(engine.reconcile_replays().await.unwrap(), 1);
        let letter = engine.get_dead_letter(letter_id).await.unwrap().unwrap();
        assert_eq!(letter.status, DeadLetterStatus::Exhausted);
        assert_eq!(letter.replay_attempts.len(), 2);
        assert_eq!(letter.replay_attempts[1].run_id, queued);
        assert_eq!(engine.get_run(queued).await.unwrap().unwrap().status, RunStatus::Cancelled);

        // No replay run at all.
        let mut letter = letter;
        letter.status = DeadLetterStatus::Retrying;
        engine.store().update_dead_letter(&letter).await.unwrap();
        assert_eq!(engine.reconcile_replays().await.unwrap(), 1);
        let letter = engine.get_dead_letter(letter_id).await.unwrap().unwrap();
        assert_eq!(letter.status, DeadLetterStatus::Exhausted);
        assert_eq!(letter.replay_attempts.len(), 2);

        // Replayable again, and nothing else dead-lettered along the way.
        let letter = engine.replay_dead_letter(letter_id).await.unwrap();
        assert_eq!(letter.replay_attempts.len(), 3);
        let all = engine
            .list_dead_letters(&DeadLetterFilter::default(), 10, 0)
            .await
            .unwrap();
        assert_eq!(all.total, 1);
    }

    #[tokio::test]
    async fn test_manual_retry_creates_linked_run() {
        let executors = ExecutorRegistry::new();
        executors.register(
            "strict",
            executor(|_req: ExecutionRequest| async { Err(PipelineError::validation("bad input")) }.boxed()),
        );
        let engine = engine_with(executors);
        let id = engine
            .submit_run(SubmitRequest::new(RunKind::Task, "strict", json!({"a": 1})))
            .await
            .unwrap();
        let failed = drain(&engine).await;
        assert_eq!(failed[0].status, RunStatus::Failed);
        assert_eq!(failed[0].attempt, 1, "non-retryable errors are never retried");

        let retry_id = engine.retry_run(id).await.unwrap();
        let retry = engine.get_run(retry_id).await.unwrap().unwrap();
        assert_eq!(retry.status, RunStatus::Pending);
        assert_eq!(retry.metadata[RETRY_OF_KEY], json!(id.to_string()));
        assert_eq!(retry.params, json!({"a": 1}));
    }

    // -----------------------------------------------------------------------
    // Workflows
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_dependent_never_created_after_non_retryable_failure() {
        let executors = ExecutorRegistry::with_builtins();
        executors.register(
            "reject",
            executor(|_req: ExecutionRequest| async { Err(PipelineError::validation("schema mismatch")) }.boxed()),
        );
        let engine = engine_with(executors);
        engine
            .register_workflow(WorkflowDefinition::new(
                "etl",
                vec![
                    StepDefinition::new("a", "reject", 1),
                    StepDefinition::new("b", "noop", 2).depends_on(["a"]),
                ],
            ))
            .unwrap();

        let launch = engine
            .run_workflow("etl", json!({}), RunWorkflowOptions::default())
            .await
            .unwrap();

        assert_eq!(launch.status, Some(RunStatus::Failed));
        let run_id = launch.run_id.unwrap();
        let run = engine.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.error_category, Some(ErrorCategory::Validation));
        assert!(run.finished_at.is_some());

        let steps = engine.list_step_runs(run_id).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].step_name, "a");
        assert_eq!(steps[0].status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn test_dry_run_returns_plan_without_executing() {
        let engine = engine_with(ExecutorRegistry::with_builtins());
        engine
            .register_workflow(WorkflowDefinition::new(
                "etl",
                vec![
                    StepDefinition::new("load", "noop", 2).depends_on(["extract"]),
                    StepDefinition::new("extract", "noop", 1),
                ],
            ))
            .unwrap();

        let launch = engine
            .run_workflow("etl", json!({}), RunWorkflowOptions::dry_run())
            .await
            .unwrap();

        assert_eq!(launch.run_id, None);
        assert_eq!(launch.plan, vec!["extract", "load"]);
        assert_eq!(engine.list_runs(&RunFilter::default(), 10, 0).await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn test_workflow_completes_with_outputs_and_stats() {
        let engine = engine_with(ExecutorRegistry::with_builtins());
        engine
            .register_workflow(WorkflowDefinition::new(
                "etl",
                vec![StepDefinition::new("extract", "noop", 1).with_params(json!({"rows": 3}))],
            ))
            .unwrap();

        let launch = engine
            .run_workflow("etl", json!({"day": 1}), RunWorkflowOptions::default())
            .await
            .unwrap();
        assert_eq!(launch.status, Some(RunStatus::Completed));

        let workflow_run = engine
            .get_workflow_run(launch.run_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(workflow_run.outputs["extract"], json!({"rows": 3}));
        assert_eq!(workflow_run.triggered_by, TriggeredBy::Manual);

        let stats = engine.run_stats(&RunFilter::default()).await.unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.count(RunStatus::Completed), 1);
        assert_eq!(stats.success_rate, Some(1.0));
    }

    #[tokio::test]
    async fn test_cancel_pending_and_running() {
        let started = Arc::new(tokio::sync::Notify::new());
        let signal = started.clone();
        let executors = ExecutorRegistry::with_builtins();
        executors.register(
            "wait",
            executor(move |req: ExecutionRequest| {
                let signal = signal.clone();
                async move {
                    signal.notify_one();
                    req.cancel.cancelled().await;
                    Ok(ExecutionOutput::default())
                }
                .boxed()
            }),
        );
        let engine = engine_with(executors);

        let pending = engine
            .submit_run(SubmitRequest::new(RunKind::Task, "noop", json!({})))
            .await
            .unwrap();
        let cancelled = engine.cancel_run(pending).await.unwrap();
        assert_eq!(cancelled.status, RunStatus::Cancelled);
        assert!(cancelled.finished_at.is_some());
        assert!(matches!(
            engine.cancel_run(pending).await,
            Err(EngineError::InvalidOperation(_))
        ));

        let running = engine
            .submit_run(SubmitRequest::new(RunKind::Task, "wait", json!({})))
            .await
            .unwrap();
        let handles = engine.process_due(Utc::now()).await.unwrap();
        started.notified().await;
        engine.cancel_run(running).await.unwrap();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        let run = engine.get_run(running).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
        assert!(run.cancel_requested);
    }

    #[tokio::test]
    async fn test_cancel_lets_running_task_finish() {
        let started = Arc::new(tokio::sync::Notify::new());
        let finished = Arc::new(AtomicBool::new(false));
        let (signal, done) = (started.clone(), finished.clone());
        let executors = ExecutorRegistry::new();
        executors.register(
            "stubborn",
            executor(move |_req: ExecutionRequest| {
                let (signal, done) = (signal.clone(), done.clone());
                async move {
                    signal.notify_one();
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    done.store(true, Ordering::SeqCst);
                    Ok(ExecutionOutput::default())
                }
                .boxed()
            }),
        );
        let engine = engine_with(executors);
        let id = engine
            .submit_run(SubmitRequest::new(RunKind::Task, "stubborn", json!({})))
            .await
            .unwrap();

        let handles = engine.process_due(Utc::now()).await.unwrap();
        started.notified().await;
        engine.cancel_run(id).await.unwrap();
        assert!(!finished.load(Ordering::SeqCst));
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert!(finished.load(Ordering::SeqCst));
        let run = engine.get_run(id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_recover_interrupted_runs() {
        let engine = engine_with(ExecutorRegistry::with_builtins());
        let id = engine
            .submit_run(SubmitRequest::new(RunKind::Task, "noop", json!({})).with_max_attempts(3))
            .await
            .unwrap();
        let run = engine.get_run(id).await.unwrap().unwrap();
        engine
            .store()
            .transition_run(&id, &RunTransition::from_current(&run, RunStatus::Running))
            .await
            .unwrap();

        assert_eq!(engine.recover_interrupted().await.unwrap(), 1);
        let recovered = engine.get_run(id).await.unwrap().unwrap();
        assert_eq!(recovered.status, RunStatus::Pending);
        assert_eq!(recovered.attempt, 2);
    }

    // -----------------------------------------------------------------------
    // Schedules
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_schedule_run_now_starts_workflow() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let executors = ExecutorRegistry::new();
        executors.register(
            "count",
            executor(move |req: ExecutionRequest| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move { Ok(ExecutionOutput::new(req.run_params)) }.boxed()
            }),
        );
        let engine = engine_with(executors);
        engine
            .register_workflow(WorkflowDefinition::new("report", vec![StepDefinition::new("build", "count", 1)]))
            .unwrap();
        engine
            .create_schedule(
                Schedule::new("weekday-report", "report", Trigger::Cron { expression: "0 6 * * 1-5".into() })
                    .with_timezone("America/New_York")
                    .with_params(json!({"region": "us"})),
            )
            .await
            .unwrap();

        let job = engine.run_now("weekday-report").await.unwrap();

        assert_eq!(job.status, JobRunStatus::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let workflow_run = engine
            .get_workflow_run(job.workflow_run_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(workflow_run.triggered_by, TriggeredBy::Schedule);
        assert_eq!(workflow_run.run.params, json!({"region": "us"}));
        assert_eq!(workflow_run.run.metadata["schedule"], json!("weekday-report"));

        let history = engine.list_job_runs("weekday-report", 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(engine.next_fire_times("weekday-report", 5).unwrap().len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_job_reports_retried_outcome() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let executors = ExecutorRegistry::new();
        executors.register(
            "slow-then-fast",
            executor(move |_req: ExecutionRequest| {
                let call = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if call == 0 {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                    Ok(ExecutionOutput::new(json!({"call": call})))
                }
                .boxed()
            }),
        );
        let engine = engine_with(executors);
        let mut definition = WorkflowDefinition::new("report", vec![StepDefinition::new("build", "slow-then-fast", 1)]);
        definition.timeout_secs = Some(1);
        definition.max_attempts = Some(2);
        engine.register_workflow(definition).unwrap();
        engine
            .create_schedule(Schedule::new("nightly", "report", Trigger::Interval { seconds: 86_400 }))
            .await
            .unwrap();

        let job = engine.run_now("nightly").await.unwrap();

        assert_eq!(job.status, JobRunStatus::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let run = engine.get_run(job.workflow_run_id.unwrap()).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.attempt, 2);
        let history = engine.list_job_runs("nightly", 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, JobRunStatus::Completed);
    }

    #[tokio::test]
    async fn test_schedule_lifecycle_errors() {
        let engine = engine_with(ExecutorRegistry::with_builtins());
        let schedule = Schedule::new("s", "etl", Trigger::Interval { seconds: 60 });
        engine.create_schedule(schedule.clone()).await.unwrap();

        assert!(matches!(
            engine.create_schedule(schedule).await,
            Err(EngineError::ScheduleExists(_))
        ));

        let bad = Schedule::new("bad", "etl", Trigger::Cron { expression: "99 * * * *".into() });
        let err = engine.create_schedule(bad).await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Configuration);

        let bad_tz = Schedule::new("tz", "etl", Trigger::Interval { seconds: 60 }).with_timezone("Not/AZone");
        assert_eq!(
            engine.create_schedule(bad_tz).await.unwrap_err().category(),
            ErrorCategory::Configuration
        );

        let paused = engine.pause_schedule("s").await.unwrap();
        assert!(!paused.enabled);
        assert!(engine.resume_schedule("s").await.unwrap().enabled);

        let updated = engine
            .update_schedule(Schedule::new("s", "etl", Trigger::Interval { seconds: 120 }))
            .await
            .unwrap();
        assert_eq!(updated.trigger, Trigger::Interval { seconds: 120 });

        engine.delete_schedule("s").await.unwrap();
        assert!(engine.get_schedule("s").await.unwrap().is_none());
        assert_eq!(
            engine.delete_schedule("s").await.unwrap_err().category(),
            ErrorCategory::Validation
        );
    }

    #[tokio::test]
    async fn test_start_restores_schedules_and_dispatches() {
        let store = Arc::new(InMemoryStateStore::new());
        store
            .upsert_schedule(&Schedule::new("restored", "etl", Trigger::Interval { seconds: 3_600 }))
            .await
            .unwrap();
        let mut config = test_config();
        config.dispatch_interval_ms = 10;
        let engine = Engine::new(store, config, ExecutorRegistry::with_builtins(), AlertRouter::new());

        let handle = engine.start(CancellationToken::new()).await.unwrap();
        assert!(engine.scheduler().contains("restored"));

        let id = engine
            .submit_run(SubmitRequest::new(RunKind::Task, "noop", json!({})))
            .await
            .unwrap();
        let mut status = RunStatus::Pending;
        for _ in 0..100 {
            status = engine.get_run(id).await.unwrap().unwrap().status;
            if status == RunStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, RunStatus::Completed);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_purge_removes_finished_history() {
        let engine = engine_with(ExecutorRegistry::with_builtins());
        engine
            .submit_run(SubmitRequest::new(RunKind::Task, "noop", json!({})))
            .await
            .unwrap();
        drain(&engine).await;

        let nothing = engine.purge_expired().await.unwrap();
        assert_eq!(nothing.runs, 0);

        let report = engine
            .purge_older_than(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(report.runs, 1);
        assert_eq!(engine.list_runs(&RunFilter::default(), 10, 0).await.unwrap().total, 0);
    }
}
