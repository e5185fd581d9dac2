//! Shared domain types for Cadence.
//!
//! This crate contains the core domain types used across the engine:
//! Run, WorkflowRun, StepRun, Schedule, JobRun, DeadLetter, the error
//! taxonomy, engine events, and configuration.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod dead_letter;
pub mod error;
pub mod event;
pub mod run;
pub mod schedule;
pub mod workflow;
