//! Alert delivery seam.
//!
//! The engine emits `AlertEvent`s through an [`AlertSink`]. Concrete channels
//! (chat, email, paging) live outside the engine and implement the trait; the
//! event bus and a tracing sink ship here.

use std::sync::Arc;

use cadence_types::event::{AlertEvent, AlertSeverity, EngineEvent};

use super::bus::EventBus;

/// Receives alerts. Implementations must not block.
pub trait AlertSink: Send + Sync {
    fn emit(&self, alert: &AlertEvent);
}

/// Republishes alerts on the event bus as `EngineEvent::Alert`.
impl AlertSink for EventBus {
    fn emit(&self, alert: &AlertEvent) {
        self.publish(EngineEvent::Alert(alert.clone()));
    }
}

/// Writes alerts to the tracing log at a level matching their severity.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn emit(&self, alert: &AlertEvent) {
        let run_id = alert.run_id.map(|id| id.to_string()).unwrap_or_default();
        match alert.severity {
            AlertSeverity::Info => tracing::info!(
                category = %alert.category,
                retryable = alert.retryable,
                run_id = run_id.as_str(),
                "{}", alert.message
            ),
            AlertSeverity::Warning => tracing::warn!(
                category = %alert.category,
                retryable = alert.retryable,
                run_id = run_id.as_str(),
                "{}", alert.message
            ),
            AlertSeverity::Error | AlertSeverity::Critical => tracing::error!(
                severity = ?alert.severity,
                category = %alert.category,
                retryable = alert.retryable,
                run_id = run_id.as_str(),
                "{}", alert.message
            ),
        }
    }
}

/// Fans one alert out to every registered sink.
#[derive(Clone, Default)]
pub struct AlertRouter {
    sinks: Vec<Arc<dyn AlertSink>>,
}

impl AlertRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl AlertSink for AlertRouter {
    fn emit(&self, alert: &AlertEvent) {
        for sink in &self.sinks {
            sink.emit(alert);
        }
    }
}

impl std::fmt::Debug for AlertRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertRouter")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}
