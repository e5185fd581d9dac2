//! Engine wiring pinned to the SQLite store.
//!
//! Loads `cadence.toml` from the data directory, opens the configured
//! database (or `{data_dir}/cadence.db`), and builds an [`Engine`] over it.
//! Host processes call [`init_tracing`] first to install the subscriber from
//! `cadence-observe`.

use std::path::Path;
use std::sync::Arc;

use cadence_core::engine::Engine;
use cadence_core::event::alert::AlertRouter;
use cadence_core::executor::ExecutorRegistry;

use crate::config::load_engine_config;
use crate::sqlite::pool::DatabasePool;
use crate::sqlite::store::SqliteStateStore;

/// Shuts down OpenTelemetry export when dropped.
#[must_use = "dropping the guard shuts tracing down"]
pub struct TracingGuard(());

impl Drop for TracingGuard {
    fn drop(&mut self) {
        cadence_observe::shutdown_tracing();
    }
}

/// Install the process-wide tracing subscriber: structured logs filtered by
/// `RUST_LOG` (JSON with `CADENCE_LOG_FORMAT=json`), plus OpenTelemetry stdout
/// export when `enable_otel` is set. Keep the guard alive until exit.
///
/// # Errors
///
/// Fails if a global subscriber is already installed.
pub fn init_tracing(enable_otel: bool) -> Result<TracingGuard, Box<dyn std::error::Error>> {
    cadence_observe::init_tracing(enable_otel)?;
    Ok(TracingGuard(()))
}

/// The engine pinned to the concrete SQLite store.
pub type SqliteEngine = Engine<SqliteStateStore>;

/// Build an engine rooted at `data_dir`.
///
/// The returned engine is not started; call [`Engine::start`] to run the
/// scheduler and dispatcher loops.
pub async fn open_engine(
    data_dir: &Path,
    executors: ExecutorRegistry,
    alerts: AlertRouter,
) -> Result<Arc<SqliteEngine>, sqlx::Error> {
    tokio::fs::create_dir_all(data_dir).await?;
    let config = load_engine_config(data_dir).await;

    let database_url = match &config.database_url {
        Some(url) => url.clone(),
        None => format!("sqlite://{}?mode=rwc", data_dir.join("cadence.db").display()),
    };
    let pool = DatabasePool::new(&database_url).await?;

    tracing::info!(data_dir = %data_dir.display(), "cadence engine opened");
    Ok(Engine::new(
        Arc::new(SqliteStateStore::new(pool)),
        config,
        executors,
        alerts,
    ))
}
