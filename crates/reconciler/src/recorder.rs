//! Operator-visible audit events.

use std::sync::Mutex;

use tracing::{info, warn};

/// Severity of a recorded event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

/// A recorded audit event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub event_type: EventType,
    pub reason: String,
    pub message: String,
}

/// Sink for audit events. Recording never fails and never blocks on I/O.
pub trait EventRecorder: Send + Sync {
    /// Record an informational event.
    fn event(&self, reason: &str, message: &str);

    /// Record a warning event.
    fn warning(&self, reason: &str, message: &str);
}

/// Recorder that writes events to the tracing subscriber.
#[derive(Debug, Clone, Default)]
pub struct TracingEventRecorder {
    component: String,
}

impl TracingEventRecorder {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
        }
    }
}

impl EventRecorder for TracingEventRecorder {
    fn event(&self, reason: &str, message: &str) {
        info!(component = %self.component, reason, "{message}");
    }

    fn warning(&self, reason: &str, message: &str) {
        warn!(component = %self.component, reason, "{message}");
    }
}

/// Recorder that keeps events in memory for inspection.
#[derive(Debug, Default)]
pub struct InMemoryEventRecorder {
    events: Mutex<Vec<RecordedEvent>>,
}

impl InMemoryEventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// All events recorded so far, oldest first.
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .map_or_else(|poisoned| poisoned.into_inner().clone(), |events| events.clone())
    }

    /// Events recorded with the given reason.
    pub fn with_reason(&self, reason: &str) -> Vec<RecordedEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.reason == reason)
            .collect()
    }

    fn record(&self, event_type: EventType, reason: &str, message: &str) {
        let event = RecordedEvent {
            event_type,
            reason: reason.to_string(),
            message: message.to_string(),
        };
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

impl EventRecorder for InMemoryEventRecorder {
    fn event(&self, reason: &str, message: &str) {
        self.record(EventType::Normal, reason, message);
    }

    fn warning(&self, reason: &str, message: &str) {
        self.record(EventType::Warning, reason, message);
    }
}
