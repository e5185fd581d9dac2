//! Ready-set DAG runner.
//!
//! Dispatches every step whose dependencies have completed, bounded by the
//! workflow's `max_concurrency`. Each step runs on its own task inside a
//! `JoinSet` with a per-step timeout and retry loop; the runner waits on the
//! set and the workflow deadline at once.
//!
//! Cancellation is cooperative. Executors receive the token, but an
//! in-flight step is always awaited and keeps whatever result it returns;
//! the runner only stops dispatching new steps.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use cadence_types::config::EngineConfig;
use cadence_types::error::{ErrorContext, PipelineError, RepositoryError};
use cadence_types::event::EngineEvent;
use cadence_types::run::{Run, RunStatus};
use cadence_types::workflow::{OnFailure, StepDefinition, StepRun, StepStatus, WorkflowRun};
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::dag::WorkflowGraph;
use crate::event::bus::EventBus;
use crate::executor::{ExecutionOutput, ExecutionRequest, ExecutorRegistry, PipelineExecutorDyn};
use crate::retry::{RetryDecision, RetryManager, StepFailure};
use crate::store::StateStore;

// ---------------------------------------------------------------------------
// Settings and outcome
// ---------------------------------------------------------------------------

/// Defaults applied when a definition leaves a limit unset.
#[derive(Debug, Clone, Copy)]
pub struct RunnerSettings {
    pub step_timeout: Duration,
    pub workflow_timeout: Duration,
    pub step_max_attempts: u32,
}

impl RunnerSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            step_timeout: Duration::from_secs(config.default_step_timeout_secs),
            workflow_timeout: Duration::from_secs(config.default_workflow_timeout_secs),
            step_max_attempts: config.default_max_attempts.max(1),
        }
    }
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

/// Result of executing one workflow run to a terminal state.
#[derive(Debug, Clone)]
pub struct WorkflowOutcome {
    /// `Completed`, `Failed`, or `Cancelled`.
    pub status: RunStatus,
    /// Error of the first step that failed (or the workflow timeout).
    pub error: Option<PipelineError>,
    pub outputs: HashMap<String, serde_json::Value>,
    pub metrics: HashMap<String, serde_json::Value>,
    /// A step already wrote a dead letter for this failure.
    pub dead_lettered: bool,
}

// ---------------------------------------------------------------------------
// DagRunner
// ---------------------------------------------------------------------------

/// Executes workflow runs step by step.
///
/// Generic over `S: StateStore` for storage flexibility.
pub struct DagRunner<S: StateStore> {
    store: Arc<S>,
    executors: Arc<ExecutorRegistry>,
    retry: Arc<RetryManager<S>>,
    events: EventBus,
    settings: RunnerSettings,
}

/// Mutable bookkeeping for one run.
struct RunState {
    statuses: HashMap<String, StepStatus>,
    outputs: HashMap<String, serde_json::Value>,
    records_processed: u64,
    first_error: Option<PipelineError>,
    dead_lettered: bool,
    halted: bool,
}

impl<S: StateStore + 'static> DagRunner<S> {
    pub fn new(
        store: Arc<S>,
        executors: Arc<ExecutorRegistry>,
        retry: Arc<RetryManager<S>>,
        events: EventBus,
        settings: RunnerSettings,
    ) -> Self {
        Self {
            store,
            executors,
            retry,
            events,
            settings,
        }
    }

    /// Drive `workflow_run` through `graph` until every step is terminal.
    ///
    /// The caller owns the run's status transitions; this method only writes
    /// step records and the run's outputs.
    pub async fn run(
        &self,
        workflow_run: &WorkflowRun,
        graph: &WorkflowGraph,
        cancel: CancellationToken,
    ) -> Result<WorkflowOutcome, RepositoryError> {
        let definition = graph.definition();
        let run_id = workflow_run.id();
        let workflow_timeout = definition
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.settings.workflow_timeout);

        tracing::info!(
            run_id = %run_id,
            workflow = definition.name.as_str(),
            attempt = workflow_run.run.attempt,
            steps = graph.len(),
            "workflow run started"
        );

        let mut state = RunState {
            statuses: definition
                .steps
                .iter()
                .map(|s| (s.name.clone(), StepStatus::Pending))
                .collect(),
            outputs: HashMap::new(),
            records_processed: 0,
            first_error: None,
            dead_lettered: false,
            halted: false,
        };

        let semaphore = Arc::new(Semaphore::new(definition.max_concurrency));
        let step_cancel = cancel.child_token();
        let mut tasks: JoinSet<StepResult> = JoinSet::new();
        let deadline = tokio::time::sleep_until(Instant::now() + workflow_timeout);
        tokio::pin!(deadline);
        let mut timed_out = false;

        loop {
            if !state.halted && !cancel.is_cancelled() {
                for step in graph.ready_steps(&state.statuses) {
                    // Ready steps come sorted by step_order; stop at the
                    // first one that cannot get a slot.
                    let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
                        break;
                    };
                    state.statuses.insert(step.name.clone(), StepStatus::Running);
                    let task = self
                        .prepare_step(workflow_run, step, &state.outputs, step_cancel.child_token())
                        .await;
                    tasks.spawn(async move {
                        let _permit = permit;
                        task.execute().await
                    });
                }
            }

            if tasks.is_empty() {
                break;
            }

            tokio::select! {
                joined = tasks.join_next() => {
                    match joined {
                        Some(Ok(result)) => self.apply_result(run_id, graph, &mut state, result).await,
                        Some(Err(e)) => tracing::error!(run_id = %run_id, "step task aborted: {e}"),
                        None => break,
                    }
                }
                _ = &mut deadline, if !timed_out => {
                    timed_out = true;
                    tracing::warn!(
                        run_id = %run_id,
                        timeout_secs = workflow_timeout.as_secs(),
                        "workflow timed out, aborting in-flight steps"
                    );
                    tasks.abort_all();
                    while let Some(joined) = tasks.join_next().await {
                        if let Ok(result) = joined {
                            self.apply_result(run_id, graph, &mut state, result).await;
                        }
                    }
                    let timeout_error = PipelineError::timeout(format!(
                        "workflow '{}' exceeded {}s",
                        definition.name,
                        workflow_timeout.as_secs()
                    ))
                    .with_context(ErrorContext::new().pipeline(&definition.name).run_id(run_id));
                    self.fail_unfinished_steps(run_id, &timeout_error).await;
                    for status in state.statuses.values_mut() {
                        if *status == StepStatus::Running {
                            *status = StepStatus::Failed;
                        }
                    }
                    state.first_error = Some(timeout_error);
                    break;
                }
            }
        }

        // Anything never dispatched is closed out now.
        let cancelled = cancel.is_cancelled() && !timed_out;
        let leftover = if cancelled { StepStatus::Cancelled } else { StepStatus::Skipped };
        for step in graph.steps_by_order() {
            if state.statuses.get(&step.name) == Some(&StepStatus::Pending) {
                state.statuses.insert(step.name.clone(), leftover);
                self.close_unstarted(run_id, step, leftover).await;
            }
        }

        let status = if cancelled {
            RunStatus::Cancelled
        } else if state.first_error.is_some() {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };

        let metrics = step_metrics(&state);
        self.store
            .update_workflow_outputs(&run_id, &state.outputs, &metrics)
            .await?;

        tracing::info!(
            run_id = %run_id,
            workflow = definition.name.as_str(),
            status = %status,
            "workflow run finished"
        );

        Ok(WorkflowOutcome {
            status,
            error: if cancelled { None } else { state.first_error },
            outputs: state.outputs,
            metrics,
            dead_lettered: state.dead_lettered,
        })
    }

    /// Create the step record and everything the step task needs.
    async fn prepare_step(
        &self,
        workflow_run: &WorkflowRun,
        step: &StepDefinition,
        outputs: &HashMap<String, serde_json::Value>,
        cancel: CancellationToken,
    ) -> StepTask<S> {
        let max_attempts = step
            .max_attempts
            .unwrap_or(self.settings.step_max_attempts)
            .max(1);
        let record = StepRun::pending(workflow_run.id(), step, max_attempts);
        if let Err(e) = self.store.create_step_run(&record).await {
            tracing::warn!(run_id = %workflow_run.id(), step = step.name.as_str(), "failed to persist step run: {e}");
        }

        let upstream = step
            .depends_on
            .iter()
            .filter_map(|dep| outputs.get(dep).map(|v| (dep.clone(), v.clone())))
            .collect();

        StepTask {
            store: Arc::clone(&self.store),
            retry: Arc::clone(&self.retry),
            events: self.events.clone(),
            executor: self.executors.resolve(&step.step_type),
            run: workflow_run.run.clone(),
            workflow: workflow_run.workflow_name.clone(),
            partition_key: workflow_run.partition_key.clone(),
            upstream,
            step: step.clone(),
            record,
            first_failed_at: None,
            timeout: step
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(self.settings.step_timeout),
            cancel,
        }
    }

    async fn apply_result(&self, run_id: Uuid, graph: &WorkflowGraph, state: &mut RunState, result: StepResult) {
        match result.end {
            StepEnd::Completed(output) => {
                state.statuses.insert(result.step_name.clone(), StepStatus::Completed);
                state.records_processed += output.records_processed;
                state.outputs.insert(result.step_name, output.data);
            }
            StepEnd::Failed(error) => {
                state.statuses.insert(result.step_name.clone(), StepStatus::Failed);
                state.dead_lettered |= result.dead_lettered;
                if state.first_error.is_none() {
                    state.first_error = Some(error.with_context(
                        ErrorContext::new()
                            .pipeline(graph.name())
                            .step(&result.step_name)
                            .run_id(run_id),
                    ));
                }
                match graph.definition().on_failure {
                    OnFailure::Halt => state.halted = true,
                    OnFailure::Continue => {
                        for dependent in graph.transitive_dependents(&result.step_name) {
                            if state.statuses.get(&dependent.name) == Some(&StepStatus::Pending) {
                                state.statuses.insert(dependent.name.clone(), StepStatus::Skipped);
                                self.close_unstarted(run_id, dependent, StepStatus::Skipped).await;
                            }
                        }
                    }
                }
            }
            StepEnd::Cancelled => {
                state.statuses.insert(result.step_name, StepStatus::Cancelled);
            }
        }
    }

    /// Close out a step that never started. No StepRun is written for it;
    /// the outcome lives in the run's metrics and on the event bus.
    async fn close_unstarted(&self, run_id: Uuid, step: &StepDefinition, status: StepStatus) {
        tracing::debug!(run_id = %run_id, step = step.name.as_str(), status = %status, "step not started");
        if status == StepStatus::Skipped {
            self.events.publish(EngineEvent::StepSkipped {
                run_id,
                step_name: step.name.clone(),
            });
        }
    }

    /// Mark every step record still pending or running as failed with `error`.
    async fn fail_unfinished_steps(&self, run_id: Uuid, error: &PipelineError) {
        let records = match self.store.list_step_runs(&run_id).await {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(run_id = %run_id, "failed to load step runs after timeout: {e}");
                return;
            }
        };
        for mut record in records.into_iter().filter(|r| !r.status.is_terminal()) {
            record.error = Some(error.message().to_string());
            record.error_category = Some(error.category());
            record.finish(StepStatus::Failed, Utc::now());
            if let Err(e) = self.store.update_step_run(&record).await {
                tracing::warn!(run_id = %run_id, step = record.step_name.as_str(), "failed to persist step run: {e}");
            }
        }
    }
}

fn step_metrics(state: &RunState) -> HashMap<String, serde_json::Value> {
    let count = |status: StepStatus| state.statuses.values().filter(|s| **s == status).count();
    let named = |status: StepStatus| {
        let mut names: Vec<&str> = state
            .statuses
            .iter()
            .filter(|(_, s)| **s == status)
            .map(|(n, _)| n.as_str())
            .collect();
        names.sort_unstable();
        serde_json::json!(names)
    };
    HashMap::from([
        ("records_processed".to_string(), state.records_processed.into()),
        ("steps_completed".to_string(), count(StepStatus::Completed).into()),
        ("steps_failed".to_string(), count(StepStatus::Failed).into()),
        ("skipped_steps".to_string(), named(StepStatus::Skipped)),
        ("cancelled_steps".to_string(), named(StepStatus::Cancelled)),
    ])
}

// ---------------------------------------------------------------------------
// Step task
// ---------------------------------------------------------------------------

enum StepEnd {
    Completed(ExecutionOutput),
    Failed(PipelineError),
    Cancelled,
}

struct StepResult {
    step_name: String,
    end: StepEnd,
    dead_lettered: bool,
}

/// One step's execution, owned by its spawned task.
struct StepTask<S: StateStore> {
    store: Arc<S>,
    retry: Arc<RetryManager<S>>,
    events: EventBus,
    executor: Result<Arc<dyn PipelineExecutorDyn>, PipelineError>,
    run: Run,
    workflow: String,
    partition_key: Option<String>,
    upstream: HashMap<String, serde_json::Value>,
    step: StepDefinition,
    record: StepRun,
    first_failed_at: Option<DateTime<Utc>>,
    timeout: Duration,
    cancel: CancellationToken,
}

impl<S: StateStore + 'static> StepTask<S> {
    async fn execute(mut self) -> StepResult {
        loop {
            self.record.status = StepStatus::Running;
            self.record.error = None;
            self.record.error_category = None;
            if self.record.started_at.is_none() {
                self.record.started_at = Some(Utc::now());
            }
            self.persist().await;

            tracing::debug!(
                run_id = %self.run.id,
                step = self.step.name.as_str(),
                attempt = self.record.attempt,
                "step started"
            );
            self.events.publish(EngineEvent::StepStarted {
                run_id: self.run.id,
                step_name: self.step.name.clone(),
                step_order: self.step.step_order,
                attempt: self.record.attempt,
            });

            let error = match self.attempt().await {
                Ok(output) => return self.complete(output).await,
                Err(error) => error,
            };
            if self.cancel.is_cancelled() {
                self.record.error = Some(error.message().to_string());
                self.record.error_category = Some(error.category());
                return self.cancelled().await;
            }

            match self
                .retry
                .decide(&error, self.record.attempt, self.record.max_attempts)
            {
                RetryDecision::Retry { delay, next_attempt } => {
                    self.record_failure(&error, true).await;
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancel.cancelled() => return self.cancelled().await,
                    }
                    self.record.attempt = next_attempt;
                }
                RetryDecision::DeadLetter => {
                    let dead_lettered = match self
                        .retry
                        .dead_letter(
                            &self.run,
                            Some(StepFailure {
                                name: &self.step.name,
                                attempt: self.record.attempt,
                                max_attempts: self.record.max_attempts,
                                first_failed_at: self.first_failed_at.unwrap_or_else(Utc::now),
                            }),
                            &error,
                        )
                        .await
                    {
                        Ok(letter) => letter.is_some(),
                        Err(e) => {
                            tracing::error!(run_id = %self.run.id, step = self.step.name.as_str(), "failed to write dead letter: {e}");
                            false
                        }
                    };
                    return self.fail(error, dead_lettered).await;
                }
                RetryDecision::Fail => return self.fail(error, false).await,
            }
        }
    }

    /// One executor call, awaited to completion even when cancellation is
    /// requested meanwhile.
    async fn attempt(&self) -> Result<ExecutionOutput, PipelineError> {
        let executor = match &self.executor {
            Ok(executor) => Arc::clone(executor),
            Err(e) => return Err(e.clone()),
        };
        let request = ExecutionRequest {
            run_id: self.run.id,
            target: self.step.step_type.clone(),
            workflow: Some(self.workflow.clone()),
            step: Some(self.step.name.clone()),
            params: self.step.params.clone(),
            run_params: self.run.params.clone(),
            upstream: self.upstream.clone(),
            partition_key: self.partition_key.clone(),
            attempt: self.record.attempt,
            cancel: self.cancel.child_token(),
        };

        let call = AssertUnwindSafe(executor.execute_boxed(request)).catch_unwind();
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(PipelineError::internal_message(format!(
                "step '{}' panicked: {}",
                self.step.name,
                panic_message(panic.as_ref())
            ))),
            Err(_) => Err(PipelineError::timeout(format!(
                "step '{}' exceeded {}s",
                self.step.name,
                self.timeout.as_secs()
            ))),
        }
    }

    async fn complete(mut self, output: ExecutionOutput) -> StepResult {
        self.record.output_data = Some(output.data.clone());
        self.record.records_processed = output.records_processed;
        self.record.finish(StepStatus::Completed, Utc::now());
        self.persist().await;

        tracing::info!(
            run_id = %self.run.id,
            step = self.step.name.as_str(),
            duration_ms = self.record.duration_ms.unwrap_or(0),
            records = output.records_processed,
            "step completed"
        );
        self.events.publish(EngineEvent::StepCompleted {
            run_id: self.run.id,
            step_name: self.step.name.clone(),
            duration_ms: self.record.duration_ms.unwrap_or(0),
            records_processed: output.records_processed,
        });

        StepResult {
            step_name: self.step.name,
            end: StepEnd::Completed(output),
            dead_lettered: false,
        }
    }

    async fn fail(mut self, error: PipelineError, dead_lettered: bool) -> StepResult {
        self.record_failure(&error, false).await;
        self.record.finish(StepStatus::Failed, Utc::now());
        self.persist().await;
        StepResult {
            step_name: self.step.name,
            end: StepEnd::Failed(error),
            dead_lettered,
        }
    }

    async fn cancelled(mut self) -> StepResult {
        self.record.finish(StepStatus::Cancelled, Utc::now());
        self.persist().await;
        tracing::info!(run_id = %self.run.id, step = self.step.name.as_str(), "step cancelled");
        StepResult {
            step_name: self.step.name,
            end: StepEnd::Cancelled,
            dead_lettered: false,
        }
    }

    async fn record_failure(&mut self, error: &PipelineError, will_retry: bool) {
        self.first_failed_at.get_or_insert_with(Utc::now);
        self.record.error = Some(error.message().to_string());
        self.record.error_category = Some(error.category());
        if will_retry {
            self.persist().await;
        }

        tracing::warn!(
            run_id = %self.run.id,
            step = self.step.name.as_str(),
            attempt = self.record.attempt,
            category = %error.category(),
            will_retry,
            "step failed: {}", error.message()
        );
        self.events.publish(EngineEvent::StepFailed {
            run_id: self.run.id,
            step_name: self.step.name.clone(),
            category: error.category(),
            error: error.message().to_string(),
            will_retry,
        });
    }

    async fn persist(&self) {
        if let Err(e) = self.store.update_step_run(&self.record).await {
            tracing::warn!(run_id = %self.run.id, step = self.step.name.as_str(), "failed to persist step run: {e}");
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use cadence_types::dead_letter::DeadLetterFilter;
    use cadence_types::error::ErrorCategory;
    use cadence_types::workflow::{TriggeredBy, WorkflowDefinition};
    use futures_util::future::BoxFuture;
    use serde_json::json;

    use crate::executor::FnExecutor;
    use crate::retry::FixedBackoff;
    use crate::store::memory::InMemoryStateStore;

    type Script = Arc<dyn Fn(ExecutionRequest) -> BoxFuture<'static, Result<ExecutionOutput, PipelineError>> + Send + Sync>;

    struct Harness {
        store: Arc<InMemoryStateStore>,
        executors: Arc<ExecutorRegistry>,
        runner: DagRunner<InMemoryStateStore>,
    }

    fn harness(settings: RunnerSettings) -> Harness {
        let store = Arc::new(InMemoryStateStore::new());
        let executors = Arc::new(ExecutorRegistry::with_builtins());
        let events = EventBus::new(256);
        let retry = Arc::new(RetryManager::new(
            store.clone(),
            Arc::new(FixedBackoff {
                delay: Duration::ZERO,
            }),
            Arc::new(events.clone()),
            events.clone(),
        ));
        let runner = DagRunner::new(store.clone(), executors.clone(), retry, events, settings);
        Harness {
            store,
            executors,
            runner,
        }
    }

    fn fast_settings() -> RunnerSettings {
        RunnerSettings {
            step_timeout: Duration::from_secs(5),
            workflow_timeout: Duration::from_secs(10),
            step_max_attempts: 1,
        }
    }

    fn script<F>(f: F) -> Script
    where
        F: Fn(ExecutionRequest) -> BoxFuture<'static, Result<ExecutionOutput, PipelineError>>
            + Send
            + Sync
            + 'static,
    {
        Arc::new(f)
    }

    fn register(h: &Harness, name: &str, script: Script) {
        h.executors
            .register(name, FnExecutor::new(move |req: ExecutionRequest| script(req)));
    }

    async fn start(h: &Harness, def: WorkflowDefinition) -> (WorkflowRun, WorkflowGraph) {
        let graph = WorkflowGraph::build(def).unwrap();
        let wf = WorkflowRun::new(graph.definition(), json!({"day": "2024-06-01"}), TriggeredBy::Manual);
        let wf = h.store.create_workflow_run(&wf).await.unwrap();
        (wf, graph)
    }

    async fn step_statuses(h: &Harness, run_id: Uuid) -> HashMap<String, StepStatus> {
        h.store
            .list_step_runs(&run_id)
            .await
            .unwrap()
            .into_iter()
            .map(|s| (s.step_name, s.status))
            .collect()
    }

    fn failing(error: PipelineError) -> Script {
        script(move |_req: ExecutionRequest| {
            let error = error.clone();
            async move { Err(error) }.boxed()
        })
    }

    // -----------------------------------------------------------------------
    // Happy path
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_linear_workflow_completes_with_outputs() {
        let h = harness(fast_settings());
        register(
            &h,
            "double",
            script(|req: ExecutionRequest| {
                async move {
                    let upstream = req.upstream.get("a").and_then(|v| v["n"].as_i64()).unwrap_or(0);
                    Ok(ExecutionOutput::new(json!({"n": upstream * 2})).with_records(5))
                }
                .boxed()
            }),
        );
        let (wf, graph) = start(
            &h,
            WorkflowDefinition::new(
                "linear",
                vec![
                    StepDefinition::new("a", "noop", 1).with_params(json!({"n": 21})),
                    StepDefinition::new("b", "double", 2).depends_on(["a"]),
                ],
            ),
        )
        .await;

        let outcome = h.runner.run(&wf, &graph, CancellationToken::new()).await.unwrap();

        assert_eq!(outcome.status, RunStatus::Completed);
        assert!(outcome.error.is_none());
        assert_eq!(outcome.outputs["b"], json!({"n": 42}));
        assert_eq!(outcome.metrics["records_processed"], json!(5));

        let steps = h.store.list_step_runs(&wf.id()).await.unwrap();
        assert_eq!(steps.len(), 2);
        assert!(steps.iter().all(|s| s.status == StepStatus::Completed));
        assert!(steps.iter().all(|s| s.started_at <= s.finished_at));

        let stored = h.store.get_workflow_run(&wf.id()).await.unwrap().unwrap();
        assert_eq!(stored.outputs["a"], json!({"n": 21}));
    }

    #[tokio::test]
    async fn test_serial_dispatch_follows_step_order() {
        let h = harness(fast_settings());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        register(
            &h,
            "record",
            script(move |req: ExecutionRequest| {
                let log = log.clone();
                async move {
                    log.lock().unwrap().push(req.step.clone().unwrap_or_default());
                    Ok(ExecutionOutput::default())
                }
                .boxed()
            }),
        );
        let mut def = WorkflowDefinition::new(
            "serial",
            vec![
                StepDefinition::new("c", "record", 3),
                StepDefinition::new("a", "record", 1),
                StepDefinition::new("b", "record", 2),
            ],
        );
        def.max_concurrency = 1;
        let (wf, graph) = start(&h, def).await;

        let outcome = h.runner.run(&wf, &graph, CancellationToken::new()).await.unwrap();

        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(*seen.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let h = harness(fast_settings());
        let active = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));
        let (a, p) = (active.clone(), peak.clone());
        register(
            &h,
            "slow",
            script(move |_req: ExecutionRequest| {
                let (a, p) = (a.clone(), p.clone());
                async move {
                    let now = a.fetch_add(1, Ordering::SeqCst) + 1;
                    p.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    a.fetch_sub(1, Ordering::SeqCst);
                    Ok(ExecutionOutput::default())
                }
                .boxed()
            }),
        );
        let mut def = WorkflowDefinition::new(
            "fan",
            (1..=6).map(|i| StepDefinition::new(format!("s{i}"), "slow", i)).collect(),
        );
        def.max_concurrency = 2;
        let (wf, graph) = start(&h, def).await;

        let outcome = h.runner.run(&wf, &graph, CancellationToken::new()).await.unwrap();

        assert_eq!(outcome.status, RunStatus::Completed);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    // -----------------------------------------------------------------------
    // Failure handling
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_halt_skips_dependents() {
        let h = harness(fast_settings());
        register(&h, "broken", failing(PipelineError::validation("bad row")));
        let (wf, graph) = start(
            &h,
            WorkflowDefinition::new(
                "halting",
                vec![
                    StepDefinition::new("a", "broken", 1),
                    StepDefinition::new("b", "noop", 2).depends_on(["a"]),
                ],
            ),
        )
        .await;

        let outcome = h.runner.run(&wf, &graph, CancellationToken::new()).await.unwrap();

        assert_eq!(outcome.status, RunStatus::Failed);
        let error = outcome.error.unwrap();
        assert_eq!(error.category(), ErrorCategory::Validation);
        assert_eq!(error.context().step.as_deref(), Some("a"));

        let statuses = step_statuses(&h, wf.id()).await;
        assert_eq!(statuses["a"], StepStatus::Failed);
        assert!(!statuses.contains_key("b"), "dependent of a failed step is never created");
        assert_eq!(outcome.metrics["skipped_steps"], json!(["b"]));
    }

    #[tokio::test]
    async fn test_continue_runs_independent_branches() {
        let h = harness(fast_settings());
        register(&h, "broken", failing(PipelineError::validation("bad row")));
        let mut def = WorkflowDefinition::new(
            "branches",
            vec![
                StepDefinition::new("a", "broken", 1),
                StepDefinition::new("b", "noop", 2).depends_on(["a"]),
                StepDefinition::new("c", "noop", 3),
                StepDefinition::new("d", "noop", 4).depends_on(["c"]),
            ],
        );
        def.on_failure = OnFailure::Continue;
        let (wf, graph) = start(&h, def).await;

        let outcome = h.runner.run(&wf, &graph, CancellationToken::new()).await.unwrap();

        assert_eq!(outcome.status, RunStatus::Failed);
        let statuses = step_statuses(&h, wf.id()).await;
        assert_eq!(statuses["a"], StepStatus::Failed);
        assert!(!statuses.contains_key("b"));
        assert_eq!(outcome.metrics["skipped_steps"], json!(["b"]));
        assert_eq!(statuses["c"], StepStatus::Completed);
        assert_eq!(statuses["d"], StepStatus::Completed);
    }

    #[tokio::test]
    async fn test_transient_step_retries_then_dead_letters_once() {
        let h = harness(fast_settings());
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        register(
            &h,
            "flaky",
            script(move |_req: ExecutionRequest| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(PipelineError::transient("connection reset")) }.boxed()
            }),
        );
        let (wf, graph) = start(
            &h,
            WorkflowDefinition::new(
                "flaky",
                vec![StepDefinition::new("extract", "flaky", 1).with_max_attempts(3)],
            ),
        )
        .await;

        let outcome = h.runner.run(&wf, &graph, CancellationToken::new()).await.unwrap();

        assert_eq!(outcome.status, RunStatus::Failed);
        assert!(outcome.dead_lettered);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let steps = h.store.list_step_runs(&wf.id()).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].attempt, 3);
        assert_eq!(steps[0].error_category, Some(ErrorCategory::Transient));

        let letters = h
            .store
            .list_dead_letters(&DeadLetterFilter::default(), 10, 0)
            .await
            .unwrap();
        assert_eq!(letters.total, 1);
        assert_eq!(letters.items[0].retry_count, 3);
        assert_eq!(letters.items[0].source_step.as_deref(), Some("extract"));
    }

    #[tokio::test]
    async fn test_step_recovers_on_retry() {
        let h = harness(fast_settings());
        register(
            &h,
            "second_time_lucky",
            script(|req: ExecutionRequest| {
                async move {
                    if req.attempt < 2 {
                        Err(PipelineError::rate_limited("slow down"))
                    } else {
                        Ok(ExecutionOutput::new(json!("ok")))
                    }
                }
                .boxed()
            }),
        );
        let (wf, graph) = start(
            &h,
            WorkflowDefinition::new(
                "lucky",
                vec![StepDefinition::new("a", "second_time_lucky", 1).with_max_attempts(2)],
            ),
        )
        .await;

        let outcome = h.runner.run(&wf, &graph, CancellationToken::new()).await.unwrap();

        assert_eq!(outcome.status, RunStatus::Completed);
        let steps = h.store.list_step_runs(&wf.id()).await.unwrap();
        assert_eq!(steps[0].attempt, 2);
        assert!(steps[0].error.is_none());
    }

    #[tokio::test]
    async fn test_panicking_step_is_internal_error() {
        let h = harness(fast_settings());
        register(
            &h,
            "boom",
            script(|_req: ExecutionRequest| {
                async move {
                    if true {
                        panic!("exploded");
                    }
                    Ok(ExecutionOutput::default())
                }
                .boxed()
            }),
        );
        let (wf, graph) = start(
            &h,
            WorkflowDefinition::new("boom", vec![StepDefinition::new("a", "boom", 1)]),
        )
        .await;

        let outcome = h.runner.run(&wf, &graph, CancellationToken::new()).await.unwrap();

        let error = outcome.error.unwrap();
        assert_eq!(error.category(), ErrorCategory::Internal);
        assert!(error.message().contains("exploded"));
    }

    #[tokio::test]
    async fn test_unknown_executor_is_configuration_error() {
        let h = harness(fast_settings());
        let (wf, graph) = start(
            &h,
            WorkflowDefinition::new("ghost", vec![StepDefinition::new("a", "ghost", 1)]),
        )
        .await;

        let outcome = h.runner.run(&wf, &graph, CancellationToken::new()).await.unwrap();

        assert_eq!(outcome.error.unwrap().category(), ErrorCategory::Configuration);
        assert!(!outcome.dead_lettered);
    }

    // -----------------------------------------------------------------------
    // Timeouts and cancellation
    // -----------------------------------------------------------------------

    fn sleeper() -> Script {
        script(|req: ExecutionRequest| {
            async move {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(60)) => Ok(ExecutionOutput::default()),
                    _ = req.cancel.cancelled() => Err(PipelineError::transient("interrupted")),
                }
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn test_step_timeout() {
        let h = harness(fast_settings());
        register(&h, "sleepy", sleeper());
        let (wf, graph) = start(
            &h,
            WorkflowDefinition::new(
                "sleepy",
                vec![StepDefinition::new("a", "sleepy", 1).with_timeout_secs(0)],
            ),
        )
        .await;

        let outcome = h.runner.run(&wf, &graph, CancellationToken::new()).await.unwrap();

        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(outcome.error.unwrap().category(), ErrorCategory::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_workflow_timeout_fails_in_flight_steps() {
        let h = harness(RunnerSettings {
            step_timeout: Duration::from_secs(600),
            workflow_timeout: Duration::from_secs(1),
            step_max_attempts: 1,
        });
        register(&h, "sleepy", sleeper());
        let (wf, graph) = start(
            &h,
            WorkflowDefinition::new(
                "slow",
                vec![
                    StepDefinition::new("a", "sleepy", 1),
                    StepDefinition::new("b", "noop", 2).depends_on(["a"]),
                ],
            ),
        )
        .await;

        let outcome = h.runner.run(&wf, &graph, CancellationToken::new()).await.unwrap();

        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(outcome.error.unwrap().category(), ErrorCategory::Timeout);
        let statuses = step_statuses(&h, wf.id()).await;
        assert_eq!(statuses["a"], StepStatus::Failed);
        assert!(!statuses.contains_key("b"));
        assert_eq!(outcome.metrics["skipped_steps"], json!(["b"]));
    }

    #[tokio::test]
    async fn test_cancel_stops_the_run() {
        let h = harness(fast_settings());
        register(&h, "sleepy", sleeper());
        let (wf, graph) = start(
            &h,
            WorkflowDefinition::new(
                "cancellable",
                vec![
                    StepDefinition::new("a", "sleepy", 1),
                    StepDefinition::new("b", "noop", 2).depends_on(["a"]),
                ],
            ),
        )
        .await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let outcome = h.runner.run(&wf, &graph, cancel).await.unwrap();

        assert_eq!(outcome.status, RunStatus::Cancelled);
        let statuses = step_statuses(&h, wf.id()).await;
        assert_eq!(statuses["a"], StepStatus::Cancelled);
        assert!(!statuses.contains_key("b"));
        assert_eq!(outcome.metrics["cancelled_steps"], json!(["a", "b"]));
    }

    #[tokio::test]
    async fn test_cancel_waits_for_in_flight_step() {
        let h = harness(fast_settings());
        let finished = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&finished);
        register(
            &h,
            "stubborn",
            script(move |_req: ExecutionRequest| {
                let counter = Arc::clone(&counter);
                async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(ExecutionOutput::new(json!({"done": true})))
                }
                .boxed()
            }),
        );
        let (wf, graph) = start(
            &h,
            WorkflowDefinition::new(
                "stubborn",
                vec![
                    StepDefinition::new("a", "stubborn", 1),
                    StepDefinition::new("b", "noop", 2).depends_on(["a"]),
                ],
            ),
        )
        .await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let outcome = h.runner.run(&wf, &graph, cancel).await.unwrap();

        assert_eq!(outcome.status, RunStatus::Cancelled);
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        let statuses = step_statuses(&h, wf.id()).await;
        assert_eq!(statuses["a"], StepStatus::Completed);
        assert!(!statuses.contains_key("b"));
        assert_eq!(outcome.outputs["a"], json!({"done": true}));
        assert_eq!(outcome.metrics["cancelled_steps"], json!(["b"]));
    }
}
