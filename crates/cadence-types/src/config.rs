//! Engine configuration types.
//!
//! `EngineConfig` represents the `cadence.toml` file that controls timer
//! resolution, timeouts, retry backoff, and retention. Every field has a
//! default so an empty file is a valid configuration.

use serde::{Deserialize, Serialize};

/// Top-level configuration for the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// SQLite URL. `None` means the infra default (`$CADENCE_DATA_DIR/cadence.db`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,

    /// Scheduler timer resolution.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// How often the dispatcher looks for due pending runs.
    #[serde(default = "default_dispatch_interval_ms")]
    pub dispatch_interval_ms: u64,

    /// Maximum runs claimed per dispatcher pass.
    #[serde(default = "default_dispatch_batch_size")]
    pub dispatch_batch_size: u32,

    /// Attempt budget for submissions that do not set one.
    #[serde(default = "default_max_attempts")]
    pub default_max_attempts: u32,

    #[serde(default = "default_step_timeout_secs")]
    pub default_step_timeout_secs: u64,

    #[serde(default = "default_workflow_timeout_secs")]
    pub default_workflow_timeout_secs: u64,

    /// Terminal history older than this is eligible for purge.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,

    #[serde(default)]
    pub backoff: BackoffConfig,
}

fn default_tick_interval_ms() -> u64 {
    1_000
}

fn default_dispatch_interval_ms() -> u64 {
    500
}

fn default_dispatch_batch_size() -> u32 {
    16
}

fn default_max_attempts() -> u32 {
    3
}

fn default_step_timeout_secs() -> u64 {
    300
}

fn default_workflow_timeout_secs() -> u64 {
    1_800
}

fn default_retention_days() -> u32 {
    30
}

fn default_event_bus_capacity() -> usize {
    1_024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            tick_interval_ms: default_tick_interval_ms(),
            dispatch_interval_ms: default_dispatch_interval_ms(),
            dispatch_batch_size: default_dispatch_batch_size(),
            default_max_attempts: default_max_attempts(),
            default_step_timeout_secs: default_step_timeout_secs(),
            default_workflow_timeout_secs: default_workflow_timeout_secs(),
            retention_days: default_retention_days(),
            event_bus_capacity: default_event_bus_capacity(),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Delay policy between attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum BackoffConfig {
    /// `base_ms * multiplier^(attempt-1)`, capped at `max_ms`, optionally jittered.
    Exponential {
        base_ms: u64,
        multiplier: f64,
        max_ms: u64,
        jitter: bool,
    },
    /// `step_ms * attempt`, capped at `max_ms`.
    Linear { step_ms: u64, max_ms: u64 },
    Fixed { delay_ms: u64 },
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig::Exponential {
            base_ms: 1_000,
            multiplier: 2.0,
            max_ms: 300_000,
            jitter: true,
        }
    }
}
