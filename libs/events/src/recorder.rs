//! Event recorders.

use std::sync::Mutex;

use tracing::{info, warn};

use crate::{EventRecord, EventType, ObjectRef};

/// Sink for event records.
///
/// Implementations must not block for long and must never fail the caller.
pub trait EventRecorder: Send + Sync {
    /// Record a prepared event.
    fn record(&self, event: EventRecord);

    /// Convenience wrapper building the record in place.
    fn event(
        &self,
        involved: ObjectRef,
        event_type: EventType,
        reason: &str,
        message: String,
    ) {
        self.record(EventRecord::new(involved, event_type, reason, message));
    }
}

/// Recorder that forwards events to the tracing subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogRecorder;

impl EventRecorder for LogRecorder {
    fn record(&self, event: EventRecord) {
        match event.event_type {
            EventType::Normal => info!(
                object = %event.involved,
                reason = %event.reason,
                message = %event.message,
                "Event"
            ),
            EventType::Warning => warn!(
                object = %event.involved,
                reason = %event.reason,
                message = %event.message,
                "Event"
            ),
        }
    }
}

/// Recorder that keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    events: Mutex<Vec<EventRecord>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all recorded events, oldest first.
    pub fn events(&self) -> Vec<EventRecord> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Reasons of all recorded events, oldest first.
    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.reason).collect()
    }
}

impl EventRecorder for MemoryRecorder {
    fn record(&self, event: EventRecord) {
        // A poisoned lock only loses observability, never correctness.
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
