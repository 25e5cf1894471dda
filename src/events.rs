//! Canonical event catalogue shared by every component that publishes to the
//! event bus.
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Closed set of event types a publisher may emit. Adding a new kind of
/// notification means adding a variant here, not stringly-typing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    StateChanged,
    StateRestored,
    InterfaceStateChanged,
    MetricRecorded,
    ResourceAlertCreated,
    ErrorOccurred,
    ResourceErrorOccurred,
    TimeoutOccurred,
    ValidationCompleted,
    CircuitBreakerStateChanged,
    HealthChanged,
    SystemHealthChanged,
    StageStarted,
    StageCompleted,
    StageFailed,
    PipelineCompleted,
    EventBusPressure,
    ContextCreated,
    PhaseStateChanged,
    CheckpointCreated,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = serde_json::to_value(self).unwrap_or_default();
        write!(f, "{}", s.as_str().unwrap_or("UNKNOWN"))
    }
}

/// An event published onto the bus. `payload` is a free-form JSON document;
/// each `EventType` defines its own shape, documented alongside the
/// component that emits it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub event_type: EventType,
    pub source: String,
    pub payload: serde_json::Value,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Event {
    pub fn new(event_type: EventType, source: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            source: source.into(),
            payload,
            timestamp: chrono::Utc::now(),
            correlation_id: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}
