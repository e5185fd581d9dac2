//! Infrastructure layer for Cadence.
//!
//! Contains the SQLite implementation of the `StateStore` trait defined in
//! `cadence-core`, the `cadence.toml` configuration loader, and the wiring
//! that builds an engine over both.

pub mod bootstrap;
pub mod config;
pub mod sqlite;
