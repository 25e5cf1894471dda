//! Keyed artifact cache, layered over [`StateStore`](crate::state_store::StateStore).
//!
//! Size accounting mirrors the thresholds the source's agent cache used:
//! warnings at 10MB, critical alerts at 50MB, and a hard refusal at 100MB.
//! Per Open Question 2, oversize writes always fail with `ResourceExhausted`
//! rather than silently passing through.
use crate::errors::{ErrorKind, StateStoreError, StateStoreResult};
use crate::event_bus::EventBus;
use crate::events::{Event, EventType};
use crate::metrics_store::MetricsStore;
use crate::state_store::{ResourceType, StateStore};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub const WARNING_THRESHOLD_MB: f64 = 10.0;
pub const CRITICAL_THRESHOLD_MB: f64 = 50.0;
pub const MAX_ALLOWED_MB: f64 = 100.0;

const MAX_TRANSIENT_RETRIES: u32 = 3;
const BASE_BACKOFF: Duration = Duration::from_millis(100);

fn cache_key(key: &str) -> String {
    format!("cache:{}", key)
}

fn estimate_size_mb(value: &serde_json::Value) -> f64 {
    let bytes = serde_json::to_vec(value).map(|v| v.len()).unwrap_or(0);
    bytes as f64 / (1024.0 * 1024.0)
}

pub struct CacheStore {
    state_store: Arc<StateStore>,
    event_bus: Arc<EventBus>,
    metrics: Arc<MetricsStore>,
}

impl CacheStore {
    pub fn new(state_store: Arc<StateStore>, event_bus: Arc<EventBus>, metrics: Arc<MetricsStore>) -> Self {
        Self {
            state_store,
            event_bus,
            metrics,
        }
    }

    pub async fn set_cache(
        &self,
        key: &str,
        value: serde_json::Value,
        metadata: Option<HashMap<String, String>>,
    ) -> StateStoreResult<u64> {
        let size_mb = estimate_size_mb(&value);
        if size_mb > MAX_ALLOWED_MB {
            self.emit_alert(key, size_mb, "CRITICAL", "exceeds max_allowed_mb").await;
            return Err(StateStoreError::ResourceExhausted(format!(
                "cache entry '{}' is {:.2}MB, exceeds max_allowed_mb={:.2}MB",
                key, size_mb, MAX_ALLOWED_MB
            )));
        }
        if size_mb >= CRITICAL_THRESHOLD_MB {
            self.emit_alert(key, size_mb, "CRITICAL", "crossed critical_threshold_mb").await;
        } else if size_mb >= WARNING_THRESHOLD_MB {
            self.emit_alert(key, size_mb, "WARNING", "crossed warning_threshold_mb").await;
        }

        let full_key = cache_key(key);
        let mut attempt = 0;
        loop {
            match self
                .state_store
                .set_state(&full_key, value.clone(), ResourceType::Cache, metadata.clone())
                .await
            {
                Ok(version) => return Ok(version),
                Err(e) if attempt < MAX_TRANSIENT_RETRIES => {
                    attempt += 1;
                    let backoff = BASE_BACKOFF * 2u32.pow(attempt - 1);
                    warn!(attempt, ?backoff, error = %e, "transient cache write failure, retrying");
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn get_cache(&self, key: &str) -> Option<serde_json::Value> {
        let start = std::time::Instant::now();
        // Invalidation stores a Null tombstone rather than removing the key
        // (StateStore has no delete); a stored Null reads back as absent.
        let result = self.state_store.get_state(&cache_key(key)).await.filter(|v| !v.is_null());
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        self.metrics
            .record_metric(
                if result.is_some() { "cache_hit" } else { "cache_miss" },
                1.0,
                None,
            )
            .await;
        self.metrics.record_metric("cache_get_duration_ms", elapsed_ms, None).await;
        result
    }

    /// Invalidate a key. `get_cache` returns `None` immediately afterward.
    pub async fn invalidate(&self, key: &str) -> StateStoreResult<()> {
        self.state_store
            .set_state(&cache_key(key), serde_json::Value::Null, ResourceType::Cache, None)
            .await?;
        Ok(())
    }

    /// Sweep for entries past their effective lifetime. `force` clears every
    /// cache entry immediately regardless of age policy.
    pub async fn cleanup(&self, force: bool) -> usize {
        let entries = self.state_store.get_states_by_prefix("cache:").await;
        let mut cleared = 0;
        for (key, entry) in entries {
            if force || entry.value.is_null() {
                if self
                    .state_store
                    .set_state(&key, serde_json::Value::Null, ResourceType::Cache, None)
                    .await
                    .is_ok()
                {
                    cleared += 1;
                }
            }
        }
        cleared
    }

    async fn emit_alert(&self, key: &str, size_mb: f64, severity: &str, reason: &str) {
        let _ = self
            .event_bus
            .emit(Event::new(
                EventType::ResourceAlertCreated,
                "cache_store",
                serde_json::json!({
                    "key": key,
                    "size_mb": size_mb,
                    "severity": severity,
                    "reason": reason,
                    "error_type": ErrorKind::ResourceExhausted.to_string(),
                }),
            ))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stores() -> (Arc<StateStore>, Arc<EventBus>, Arc<MetricsStore>) {
        let bus = Arc::new(EventBus::new());
        bus.start();
        let ss = Arc::new(StateStore::new(bus.clone()));
        let metrics = Arc::new(MetricsStore::new(ss.clone(), bus.clone()));
        (ss, bus, metrics)
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let (ss, bus, metrics) = stores();
        let cache = CacheStore::new(ss, bus, metrics);
        cache.set_cache("k", serde_json::json!({"a": 1}), None).await.unwrap();
        assert_eq!(cache.get_cache("k").await, Some(serde_json::json!({"a": 1})));
    }

    #[tokio::test]
    async fn invalidate_then_get_returns_none() {
        let (ss, bus, metrics) = stores();
        let cache = CacheStore::new(ss, bus, metrics);
        cache.set_cache("k", serde_json::json!(1), None).await.unwrap();
        cache.invalidate("k").await.unwrap();
        assert_eq!(cache.get_cache("k").await, None);
    }

    #[tokio::test]
    async fn oversize_value_is_refused_without_partial_mutation() {
        let (ss, bus, metrics) = stores();
        let cache = CacheStore::new(ss, bus, metrics);
        // ~0.1MB of JSON content per char block; build something over 100MB cheaply via repeat.
        let huge = "x".repeat((MAX_ALLOWED_MB as usize + 1) * 1024 * 1024);
        let result = cache.set_cache("big", serde_json::json!(huge), None).await;
        assert!(result.is_err());
        assert_eq!(cache.get_cache("big").await, None);
    }
}
