use std::sync::{Arc, Mutex};

use tracing::{error, info, warn};

/// Severity attached to an operator-facing event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Information,
    Warning,
    Error,
}

/// A single emitted event (kept by [`RecordingEventSink`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub id: u32,
    pub severity: Severity,
    pub message: String,
}

/// Fire-and-forget observability channel. Implementations must not block
/// or fail the caller.
pub trait EventSink: Send + Sync {
    fn emit(&self, id: u32, severity: Severity, message: &str);
}

/// Forwards events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, id: u32, severity: Severity, message: &str) {
        match severity {
            Severity::Information => info!(event_id = id, "{message}"),
            Severity::Warning => warn!(event_id = id, "{message}"),
            Severity::Error => error!(event_id = id, "{message}"),
        }
    }
}

/// Collects events in memory for tests.
#[derive(Debug, Default, Clone)]
pub struct RecordingEventSink {
    inner: Arc<Mutex<Vec<Event>>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.inner
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn ids(&self) -> Vec<u32> {
        self.events().iter().map(|e| e.id).collect()
    }
}

impl EventSink for RecordingEventSink {
    fn emit(&self, id: u32, severity: Severity, message: &str) {
        // A poisoned lock drops the event rather than failing the caller.
        if let Ok(mut events) = self.inner.lock() {
            events.push(Event {
                id,
                severity,
                message: message.to_string(),
            });
        }
    }
}
