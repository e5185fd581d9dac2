//! Executor seam: the opaque async call that performs a task or a step.
//!
//! Uses the blanket-impl pattern for dynamic dispatch:
//! 1. `PipelineExecutor` uses native async fn in traits (RPITIT)
//! 2. An object-safe `PipelineExecutorDyn` with boxed futures
//! 3. Blanket-impl `PipelineExecutorDyn` for all `T: PipelineExecutor`
//! 4. `ExecutorRegistry` holds `Arc<dyn PipelineExecutorDyn>` by name

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use cadence_types::error::PipelineError;
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Request / output
// ---------------------------------------------------------------------------

/// Everything an executor gets to see about the unit it runs.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub run_id: Uuid,
    /// Executor name the request was routed by.
    pub target: String,
    /// Workflow name, when executing a step.
    pub workflow: Option<String>,
    /// Step name, when executing a step.
    pub step: Option<String>,
    /// Step params for steps, run params for tasks.
    pub params: serde_json::Value,
    /// Params of the enclosing workflow run (equal to `params` for tasks).
    pub run_params: serde_json::Value,
    /// Outputs of completed upstream steps keyed by step name.
    pub upstream: HashMap<String, serde_json::Value>,
    pub partition_key: Option<String>,
    pub attempt: u32,
    /// Tripped when the run is cancelled or times out. Executors should
    /// check it at convenient points and return early.
    pub cancel: CancellationToken,
}

impl ExecutionRequest {
    /// Request for a standalone task or pipeline run.
    pub fn for_task(run_id: Uuid, target: impl Into<String>, params: serde_json::Value, attempt: u32) -> Self {
        Self {
            run_id,
            target: target.into(),
            workflow: None,
            step: None,
            run_params: params.clone(),
            params,
            upstream: HashMap::new(),
            partition_key: None,
            attempt,
            cancel: CancellationToken::new(),
        }
    }
}

/// What an executor hands back on success.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutput {
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub records_processed: u64,
    #[serde(default)]
    pub metrics: HashMap<String, serde_json::Value>,
}

impl ExecutionOutput {
    pub fn new(data: serde_json::Value) -> Self {
        Self {
            data,
            ..Default::default()
        }
    }

    pub fn with_records(mut self, records_processed: u64) -> Self {
        self.records_processed = records_processed;
        self
    }
}

// ---------------------------------------------------------------------------
// PipelineExecutor
// ---------------------------------------------------------------------------

/// Runs one task or workflow step.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
/// Failures must be returned as categorized `PipelineError`s; anything else
/// is wrapped as `INTERNAL` by the caller.
pub trait PipelineExecutor: Send + Sync + 'static {
    fn execute(
        &self,
        request: ExecutionRequest,
    ) -> impl Future<Output = Result<ExecutionOutput, PipelineError>> + Send;
}

/// Object-safe version of [`PipelineExecutor`] with boxed futures.
///
/// This trait exists solely to enable dynamic dispatch (`dyn PipelineExecutorDyn`).
/// A blanket implementation is provided for all types implementing `PipelineExecutor`.
pub trait PipelineExecutorDyn: Send + Sync {
    fn execute_boxed(
        &self,
        request: ExecutionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ExecutionOutput, PipelineError>> + Send + '_>>;
}

impl<T: PipelineExecutor> PipelineExecutorDyn for T {
    fn execute_boxed(
        &self,
        request: ExecutionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ExecutionOutput, PipelineError>> + Send + '_>> {
        Box::pin(self.execute(request))
    }
}

// ---------------------------------------------------------------------------
// Built-in executors
// ---------------------------------------------------------------------------

/// Completes immediately, echoing its params.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopExecutor;

impl PipelineExecutor for NoopExecutor {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionOutput, PipelineError> {
        Ok(ExecutionOutput::new(request.params))
    }
}

/// Adapts an async closure into an executor.
pub struct FnExecutor<F> {
    f: F,
}

impl<F> FnExecutor<F>
where
    F: Fn(ExecutionRequest) -> BoxFuture<'static, Result<ExecutionOutput, PipelineError>>
        + Send
        + Sync
        + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> PipelineExecutor for FnExecutor<F>
where
    F: Fn(ExecutionRequest) -> BoxFuture<'static, Result<ExecutionOutput, PipelineError>>
        + Send
        + Sync
        + 'static,
{
    fn execute(
        &self,
        request: ExecutionRequest,
    ) -> impl Future<Output = Result<ExecutionOutput, PipelineError>> + Send {
        (self.f)(request)
    }
}

// ---------------------------------------------------------------------------
// ExecutorRegistry
// ---------------------------------------------------------------------------

/// Name-to-executor map built at startup and injected into the engine.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: DashMap<String, Arc<dyn PipelineExecutorDyn>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with `noop`.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register("noop", NoopExecutor);
        registry
    }

    /// Register (or replace) the executor for `name`.
    pub fn register<E: PipelineExecutor>(&self, name: impl Into<String>, executor: E) {
        self.executors.insert(name.into(), Arc::new(executor));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn PipelineExecutorDyn>> {
        self.executors.get(name).map(|e| Arc::clone(e.value()))
    }

    /// Like [`get`](Self::get), but a missing executor is a `CONFIGURATION` error.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn PipelineExecutorDyn>, PipelineError> {
        self.get(name)
            .ok_or_else(|| PipelineError::configuration(format!("no executor registered for '{name}'")))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.executors.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.executors.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("executors", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_types::error::ErrorCategory;
    use futures_util::FutureExt;
    use serde_json::json;

    #[tokio::test]
    async fn noop_echoes_params() {
        let registry = ExecutorRegistry::with_builtins();
        let exec = registry.resolve("noop").unwrap();
        let out = exec
            .execute_boxed(ExecutionRequest::for_task(Uuid::now_v7(), "noop", json!({"x": 1}), 1))
            .await
            .unwrap();
        assert_eq!(out.data, json!({"x": 1}));
    }

    #[tokio::test]
    async fn fn_executor_runs_closure() {
        let registry = ExecutorRegistry::new();
        registry.register(
            "count",
            FnExecutor::new(|req: ExecutionRequest| {
                async move { Ok(ExecutionOutput::new(json!(req.attempt)).with_records(42)) }.boxed()
            }),
        );

        let out = registry
            .resolve("count")
            .unwrap()
            .execute_boxed(ExecutionRequest::for_task(Uuid::now_v7(), "count", json!({}), 2))
            .await
            .unwrap();
        assert_eq!(out.records_processed, 42);
        assert_eq!(out.data, json!(2));
    }

    #[test]
    fn missing_executor_is_configuration_error() {
        let registry = ExecutorRegistry::new();
        let err = registry.resolve("ghost").err().unwrap();
        assert_eq!(err.category(), ErrorCategory::Configuration);
        assert!(!err.retryable());
    }

    #[test]
    fn names_are_sorted() {
        let registry = ExecutorRegistry::with_builtins();
        registry.register("alpha", NoopExecutor);
        assert_eq!(registry.names(), vec!["alpha".to_string(), "noop".to_string()]);
    }
}
