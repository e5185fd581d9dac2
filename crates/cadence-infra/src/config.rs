//! Engine configuration loader.
//!
//! Reads `cadence.toml` from the data directory (`~/.cadence/` in production)
//! and deserializes it into [`EngineConfig`]. Falls back to defaults when the
//! file is missing or malformed.

use std::path::Path;

use cadence_types::config::EngineConfig;

/// Smallest timer resolution the scheduler and dispatcher accept.
const MIN_INTERVAL_MS: u64 = 10;

/// Load engine configuration from `{data_dir}/cadence.toml`.
///
/// - If the file does not exist, returns [`EngineConfig::default()`].
/// - If the file exists but fails to parse, logs a warning and returns the default.
/// - Otherwise returns the parsed config with intervals clamped to a sane floor.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join("cadence.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No cadence.toml found at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => normalize(config),
        Err(err) => {
            tracing::warn!("Failed to parse {}: {err}, using defaults", config_path.display());
            EngineConfig::default()
        }
    }
}

fn normalize(mut config: EngineConfig) -> EngineConfig {
    config.tick_interval_ms = config.tick_interval_ms.max(MIN_INTERVAL_MS);
    config.dispatch_interval_ms = config.dispatch_interval_ms.max(MIN_INTERVAL_MS);
    config.dispatch_batch_size = config.dispatch_batch_size.max(1);
    config.default_max_attempts = config.default_max_attempts.max(1);
    config.event_bus_capacity = config.event_bus_capacity.max(1);
    config
}
