//! Component health aggregation and system-health rollup (C8).
use crate::event_bus::EventBus;
use crate::events::{Event, EventType};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthState {
    Unknown,
    Healthy,
    Degraded,
    Unhealthy,
    Critical,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct HealthStatus {
    pub status: HealthState,
    pub source: String,
    pub description: String,
    pub metadata: HashMap<String, String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Tracks the last reported health for every component and rolls up a
/// single system-wide status: the strictly worst of all reported statuses.
pub struct HealthTracker {
    statuses: DashMap<String, HealthStatus>,
    event_bus: Arc<EventBus>,
}

impl HealthTracker {
    pub fn new(event_bus: Arc<EventBus>) -> Self {
        Self {
            statuses: DashMap::new(),
            event_bus,
        }
    }

    pub async fn report(
        &self,
        source: &str,
        status: HealthState,
        description: &str,
        metadata: Option<HashMap<String, String>>,
    ) {
        let previous = self.statuses.get(source).map(|s| s.status);
        let entry = HealthStatus {
            status,
            source: source.to_string(),
            description: description.to_string(),
            metadata: metadata.unwrap_or_default(),
            timestamp: chrono::Utc::now(),
        };
        self.statuses.insert(source.to_string(), entry.clone());

        if previous != Some(status) {
            let _ = self
                .event_bus
                .emit(Event::new(
                    EventType::HealthChanged,
                    source,
                    serde_json::to_value(&entry).unwrap_or_default(),
                ))
                .await;
            self.emit_system_rollup().await;
        }
    }

    pub fn get(&self, source: &str) -> Option<HealthStatus> {
        self.statuses.get(source).map(|e| e.clone())
    }

    /// Strictly-worst status across every reporting component. A system
    /// with no reports yet is UNKNOWN.
    pub fn system_health(&self) -> HealthState {
        self.statuses
            .iter()
            .map(|e| e.status)
            .max()
            .unwrap_or(HealthState::Unknown)
    }

    async fn emit_system_rollup(&self) {
        let rollup = self.system_health();
        let _ = self
            .event_bus
            .emit(Event::new(
                EventType::SystemHealthChanged,
                "health_tracker",
                serde_json::json!({ "status": rollup }),
            ))
            .await;
    }
}
