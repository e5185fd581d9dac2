//! Error taxonomy shared by every engine component.
//!
//! Every failure that leaves a component is a [`PipelineError`] carrying an
//! [`ErrorCategory`] and a retryability flag. Retry and dead-letter decisions
//! are driven entirely by these two fields.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// ErrorCategory
// ---------------------------------------------------------------------------

/// Classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    Internal,
    Configuration,
    Validation,
    Source,
    Transform,
    Load,
    Transient,
    Dependency,
    Timeout,
    RateLimit,
    Permission,
    Resource,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 12] = [
        ErrorCategory::Internal,
        ErrorCategory::Configuration,
        ErrorCategory::Validation,
        ErrorCategory::Source,
        ErrorCategory::Transform,
        ErrorCategory::Load,
        ErrorCategory::Transient,
        ErrorCategory::Dependency,
        ErrorCategory::Timeout,
        ErrorCategory::RateLimit,
        ErrorCategory::Permission,
        ErrorCategory::Resource,
    ];

    /// Whether errors of this category are retried unless overridden.
    pub fn default_retryable(self) -> bool {
        matches!(
            self,
            ErrorCategory::Transient
                | ErrorCategory::Dependency
                | ErrorCategory::Timeout
                | ErrorCategory::RateLimit
                | ErrorCategory::Resource
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Internal => "INTERNAL",
            ErrorCategory::Configuration => "CONFIGURATION",
            ErrorCategory::Validation => "VALIDATION",
            ErrorCategory::Source => "SOURCE",
            ErrorCategory::Transform => "TRANSFORM",
            ErrorCategory::Load => "LOAD",
            ErrorCategory::Transient => "TRANSIENT",
            ErrorCategory::Dependency => "DEPENDENCY",
            ErrorCategory::Timeout => "TIMEOUT",
            ErrorCategory::RateLimit => "RATE_LIMIT",
            ErrorCategory::Permission => "PERMISSION",
            ErrorCategory::Resource => "RESOURCE",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string does not name a known category.
#[derive(Debug, Error)]
#[error("unknown error category: '{0}'")]
pub struct ParseCategoryError(pub String);

impl FromStr for ErrorCategory {
    type Err = ParseCategoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        ErrorCategory::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == upper)
            .ok_or_else(|| ParseCategoryError(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// ErrorContext
// ---------------------------------------------------------------------------

/// Where a failure happened.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pipeline(mut self, pipeline: impl Into<String>) -> Self {
        self.pipeline = Some(pipeline.into());
        self
    }

    pub fn step(mut self, step: impl Into<String>) -> Self {
        self.step = Some(step.into());
        self
    }

    pub fn run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Overlay `other` on top of `self`. Fields set in `other` win.
    fn merged(&self, other: ErrorContext) -> ErrorContext {
        let mut metadata = self.metadata.clone();
        metadata.extend(other.metadata);
        ErrorContext {
            pipeline: other.pipeline.or_else(|| self.pipeline.clone()),
            step: other.step.or_else(|| self.step.clone()),
            run_id: other.run_id.or(self.run_id),
            metadata,
        }
    }
}

// ---------------------------------------------------------------------------
// PipelineError
// ---------------------------------------------------------------------------

/// A categorized, immutable failure.
///
/// Builder-style methods (`with_context`, `with_cause`, `with_retryable`)
/// consume the value and return a new one; an error is never mutated in place
/// after it has been handed to another component.
#[derive(Clone)]
pub struct PipelineError {
    category: ErrorCategory,
    message: String,
    retryable: bool,
    cause: Option<Arc<dyn std::error::Error + Send + Sync>>,
    context: ErrorContext,
}

impl PipelineError {
    /// Create an error whose retryability follows the category default.
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            retryable: category.default_retryable(),
            cause: None,
            context: ErrorContext::default(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Configuration, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Validation, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Transient, message)
    }

    pub fn dependency(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Dependency, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Timeout, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::RateLimit, message)
    }

    pub fn source_failure(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Source, message)
    }

    /// Wrap an uncategorized failure as `INTERNAL`, never retryable.
    pub fn internal<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            category: ErrorCategory::Internal,
            message: err.to_string(),
            retryable: false,
            cause: Some(Arc::new(err)),
            context: ErrorContext::default(),
        }
    }

    /// `INTERNAL` error from a plain message.
    pub fn internal_message(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Internal, message)
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn with_cause<E>(mut self, cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.cause = Some(Arc::new(cause));
        self
    }

    /// Return a copy with `ctx` overlaid on the existing context.
    pub fn with_context(&self, ctx: ErrorContext) -> Self {
        Self {
            category: self.category,
            message: self.message.clone(),
            retryable: self.retryable,
            cause: self.cause.clone(),
            context: self.context.merged(ctx),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        self.category
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn retryable(&self) -> bool {
        self.retryable
    }

    pub fn context(&self) -> &ErrorContext {
        &self.context
    }

    /// Serializable snapshot for persistence and alerting.
    pub fn to_record(&self) -> ErrorRecord {
        ErrorRecord {
            category: self.category,
            message: self.message.clone(),
            retryable: self.retryable,
            context: self.context.clone(),
        }
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.category, self.message)
    }
}

impl fmt::Debug for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineError")
            .field("category", &self.category)
            .field("message", &self.message)
            .field("retryable", &self.retryable)
            .field("context", &self.context)
            .field("cause", &self.cause.as_ref().map(|c| c.to_string()))
            .finish()
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_ref()
            .map(|c| c.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl From<anyhow::Error> for PipelineError {
    fn from(err: anyhow::Error) -> Self {
        let boxed: Box<dyn std::error::Error + Send + Sync> = err.into();
        Self {
            category: ErrorCategory::Internal,
            message: boxed.to_string(),
            retryable: false,
            cause: Some(Arc::from(boxed)),
            context: ErrorContext::default(),
        }
    }
}

/// Persisted form of a [`PipelineError`] (the cause chain is flattened away).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub category: ErrorCategory,
    pub message: String,
    pub retryable: bool,
    #[serde(default)]
    pub context: ErrorContext,
}

impl From<ErrorRecord> for PipelineError {
    fn from(record: ErrorRecord) -> Self {
        Self {
            category: record.category,
            message: record.message,
            retryable: record.retryable,
            cause: None,
            context: record.context,
        }
    }
}

// ---------------------------------------------------------------------------
// RepositoryError
// ---------------------------------------------------------------------------

/// Errors from state store operations (used by trait definitions in cadence-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid status transition from '{from}' to '{to}'")]
    InvalidTransition { from: String, to: String },
}

impl From<RepositoryError> for PipelineError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::Connection => PipelineError::dependency(err.to_string()),
            other => PipelineError::internal(other),
        }
    }
}
