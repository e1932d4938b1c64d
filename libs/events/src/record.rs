//! Event record - what happened to which object.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum EventType {
    /// Expected lifecycle progress.
    #[default]
    Normal,
    /// Something went wrong or needs attention.
    Warning,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventType::Normal => write!(f, "Normal"),
            EventType::Warning => write!(f, "Warning"),
        }
    }
}

/// Reference to the object an event is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRef {
    /// Object kind (e.g. "TFJob").
    pub kind: String,

    /// Namespace of the object.
    pub namespace: String,

    /// Name of the object.
    pub name: String,

    /// Unique id of the object, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

impl ObjectRef {
    pub fn new(kind: impl Into<String>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
            uid: None,
        }
    }

    #[must_use]
    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = Some(uid.into());
        self
    }
}

impl std::fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// A single recorded event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    /// When the event occurred.
    pub occurred_at: DateTime<Utc>,

    /// The object the event is about.
    pub involved: ObjectRef,

    /// Severity.
    pub event_type: EventType,

    /// Short machine-readable reason (e.g. "SuccessfulCreate").
    pub reason: String,

    /// Human-readable description.
    pub message: String,
}

impl EventRecord {
    /// Create a record stamped with the current time.
    pub fn new(
        involved: ObjectRef,
        event_type: EventType,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            occurred_at: Utc::now(),
            involved,
            event_type,
            reason: reason.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_ref_display() {
        let r = ObjectRef::new("TFJob", "default", "mnist");
        assert_eq!(r.to_string(), "TFJob/default/mnist");
    }

    #[test]
    fn test_record_serialization_skips_missing_uid() {
        let record = EventRecord::new(
            ObjectRef::new("TFJob", "default", "mnist"),
            EventType::Warning,
            "FailedCreate",
            "boom",
        );
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["event_type"], "Warning");
        assert!(json["involved"].get("uid").is_none());
    }
}
