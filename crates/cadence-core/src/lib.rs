//! Business logic and state store trait definitions for Cadence.
//!
//! This crate defines the `StateStore` port that the infrastructure layer
//! implements, plus everything that runs on top of it: the workflow DAG
//! runner, the scheduler, the retry and dead-letter manager, and the
//! `Engine` facade. It depends only on `cadence-types` -- never on
//! `cadence-infra` or any database crate.

pub mod engine;
pub mod event;
pub mod executor;
pub mod retry;
pub mod schedule;
pub mod store;
pub mod workflow;
