//! Thin time-series layer over [`StateStore`](crate::state_store::StateStore).
//!
//! Every metric is appended under a conventional `metric:<name>` key rather
//! than stored in a separate structure; `StateStore`'s per-key history is
//! what makes this an append-only series "for free".
use crate::event_bus::EventBus;
use crate::events::{Event, EventType};
use crate::state_store::{ResourceType, StateStore};
use std::collections::HashMap;
use std::sync::Arc;

fn metric_key(name: &str) -> String {
    format!("metric:{}", name)
}

/// A single recorded sample, as returned by `get_metrics`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MetricSample {
    pub name: String,
    pub value: f64,
    pub metadata: HashMap<String, String>,
    pub recorded_at: chrono::DateTime<chrono::Utc>,
}

pub struct MetricsStore {
    state_store: Arc<StateStore>,
    event_bus: Arc<EventBus>,
}

impl MetricsStore {
    pub fn new(state_store: Arc<StateStore>, event_bus: Arc<EventBus>) -> Self {
        Self {
            state_store,
            event_bus,
        }
    }

    pub async fn record_metric(&self, name: &str, value: f64, metadata: Option<HashMap<String, String>>) {
        let key = metric_key(name);
        let metadata = metadata.unwrap_or_default();
        let payload = serde_json::json!({ "value": value, "metadata": metadata });
        let _ = self
            .state_store
            .set_state(&key, payload, ResourceType::Metric, Some(metadata))
            .await;
        let _ = self
            .event_bus
            .emit(Event::new(
                EventType::MetricRecorded,
                "metrics_store",
                serde_json::json!({ "name": name, "value": value }),
            ))
            .await;
    }

    pub async fn get_metrics(&self, name: &str, limit: Option<usize>) -> Vec<MetricSample> {
        let key = metric_key(name);
        self.state_store
            .get_state_history(&key, limit)
            .await
            .into_iter()
            .filter_map(|entry| {
                let value = entry.value.get("value")?.as_f64()?;
                Some(MetricSample {
                    name: name.to_string(),
                    value,
                    metadata: entry.metadata,
                    recorded_at: entry.updated_at,
                })
            })
            .collect()
    }
}
