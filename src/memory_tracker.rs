//! Per-component resource size accounting (C6).
//!
//! Tracks `(component_id, resource_id) -> size_mb`, with per-component
//! thresholds that turn crossings into alerts. Tracking the same resource id
//! twice replaces its size rather than summing it: a component re-reporting
//! its own working set should not inflate the total.
use crate::errors::{MemoryTrackerError, MemoryTrackerResult};
use crate::event_bus::EventBus;
use crate::events::{Event, EventType};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
pub struct ComponentThresholds {
    pub per_resource_max_mb: f64,
    pub warning_percent: f64,
    pub critical_percent: f64,
}

impl Default for ComponentThresholds {
    fn default() -> Self {
        Self {
            per_resource_max_mb: 100.0,
            warning_percent: 0.10,
            critical_percent: 0.50,
        }
    }
}

struct ComponentEntry {
    thresholds: ComponentThresholds,
    resources: DashMap<String, f64>,
    warned: DashMap<String, AtomicBool>,
    critical: DashMap<String, AtomicBool>,
}

pub struct MemoryTracker {
    components: DashMap<String, Arc<ComponentEntry>>,
    event_bus: Arc<EventBus>,
}

impl MemoryTracker {
    pub fn new(event_bus: Arc<EventBus>) -> Self {
        Self {
            components: DashMap::new(),
            event_bus,
        }
    }

    pub fn register_component(&self, component_id: &str, thresholds: ComponentThresholds) {
        self.components.insert(
            component_id.to_string(),
            Arc::new(ComponentEntry {
                thresholds,
                resources: DashMap::new(),
                warned: DashMap::new(),
                critical: DashMap::new(),
            }),
        );
    }

    /// Records `resource_id`'s size under `component_id`, replacing any
    /// previous size recorded for the same id. Returns an error (hard
    /// refusal) if the new size exceeds `per_resource_max_mb`; the refused
    /// size is still recorded so `get_component_total` reflects reality.
    pub async fn track_resource(
        &self,
        resource_id: &str,
        size_mb: f64,
        component_id: &str,
    ) -> MemoryTrackerResult<()> {
        let entry = self
            .components
            .get(component_id)
            .map(|e| e.clone())
            .ok_or_else(|| MemoryTrackerError::ComponentNotRegistered(component_id.to_string()))?;

        entry.resources.insert(resource_id.to_string(), size_mb);

        let max_mb = entry.thresholds.per_resource_max_mb;
        let warning_mb = entry.thresholds.warning_percent * max_mb;
        let critical_mb = entry.thresholds.critical_percent * max_mb;

        if size_mb >= critical_mb {
            if !Self::was_flagged(&entry.critical, resource_id) {
                self.emit_alert(component_id, resource_id, size_mb, "CRITICAL").await;
            }
        } else {
            Self::clear_flag(&entry.critical, resource_id);
        }

        if size_mb >= warning_mb {
            if !Self::was_flagged(&entry.warned, resource_id) {
                self.emit_alert(component_id, resource_id, size_mb, "WARNING").await;
            }
        } else {
            Self::clear_flag(&entry.warned, resource_id);
        }

        if size_mb > max_mb {
            return Err(MemoryTrackerError::LimitExceeded {
                component_id: component_id.to_string(),
                resource_id: resource_id.to_string(),
                size_mb,
                max_mb,
            });
        }

        Ok(())
    }

    pub fn untrack_resource(&self, resource_id: &str, component_id: &str) {
        if let Some(entry) = self.components.get(component_id) {
            entry.resources.remove(resource_id);
            entry.warned.remove(resource_id);
            entry.critical.remove(resource_id);
        }
    }

    pub fn get_component_total(&self, component_id: &str) -> f64 {
        self.components
            .get(component_id)
            .map(|e| e.resources.iter().map(|r| *r.value()).sum())
            .unwrap_or(0.0)
    }

    fn was_flagged(flags: &DashMap<String, AtomicBool>, resource_id: &str) -> bool {
        flags
            .entry(resource_id.to_string())
            .or_insert_with(|| AtomicBool::new(false))
            .swap(true, Ordering::AcqRel)
    }

    fn clear_flag(flags: &DashMap<String, AtomicBool>, resource_id: &str) {
        if let Some(flag) = flags.get(resource_id) {
            flag.store(false, Ordering::Release);
        }
    }

    async fn emit_alert(&self, component_id: &str, resource_id: &str, size_mb: f64, severity: &str) {
        let _ = self
            .event_bus
            .emit(Event::new(
                EventType::ResourceAlertCreated,
                "memory_tracker",
                serde_json::json!({
                    "component_id": component_id,
                    "resource_id": resource_id,
                    "size_mb": size_mb,
                    "severity": severity,
                }),
            ))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> MemoryTracker {
        let bus = Arc::new(EventBus::new());
        bus.start();
        MemoryTracker::new(bus)
    }

    #[tokio::test]
    async fn second_track_replaces_rather_than_sums() {
        let t = tracker();
        t.register_component("c1", ComponentThresholds::default());
        t.track_resource("r1", 5.0, "c1").await.unwrap();
        t.track_resource("r1", 8.0, "c1").await.unwrap();
        assert_eq!(t.get_component_total("c1"), 8.0);
    }

    #[tokio::test]
    async fn exceeding_max_is_a_hard_refusal() {
        let t = tracker();
        t.register_component(
            "c1",
            ComponentThresholds {
                per_resource_max_mb: 10.0,
                warning_percent: 0.5,
                critical_percent: 0.8,
            },
        );
        let result = t.track_resource("r1", 11.0, "c1").await;
        assert!(matches!(result, Err(MemoryTrackerError::LimitExceeded { .. })));
    }

    #[tokio::test]
    async fn untrack_removes_resource_from_total() {
        let t = tracker();
        t.register_component("c1", ComponentThresholds::default());
        t.track_resource("r1", 5.0, "c1").await.unwrap();
        t.untrack_resource("r1", "c1");
        assert_eq!(t.get_component_total("c1"), 0.0);
    }

    #[tokio::test]
    async fn unregistered_component_fails() {
        let t = tracker();
        let result = t.track_resource("r1", 1.0, "missing").await;
        assert!(matches!(result, Err(MemoryTrackerError::ComponentNotRegistered(_))));
    }
}
