//! Versioned, in-memory key/value store shared by every stateful component.
//!
//! `StateStore` is the single source of truth for runtime state. Writes are
//! serialized per key (never globally), reads never wait behind a writer on
//! a different key, and every mutation is appended to that key's history so
//! callers can inspect how a value evolved. An optional [`DurableBackingStore`]
//! lets a deployment persist snapshots outside the process; nothing about the
//! in-memory semantics depends on one being configured.
use crate::errors::{StateStoreError, StateStoreResult};
use crate::event_bus::EventBus;
use crate::events::{Event, EventType};
use crate::ports::DurableBackingStore;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

/// Tags every key with the subsystem that owns its keyspace. Thin layers
/// (MetricsStore, CacheStore, ContextStore) always write with their
/// corresponding tag so a raw `get_states_by_prefix` scan can be filtered by
/// kind as well as key prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    State,
    Monitor,
    Context,
    Cache,
    Metric,
}

/// One immutable record of a key's value at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateEntry {
    pub key: String,
    pub value: serde_json::Value,
    pub version: u64,
    pub resource_type: ResourceType,
    pub metadata: HashMap<String, String>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

const DEFAULT_HISTORY_LIMIT: usize = 200;

struct KeyRecord {
    current: StateEntry,
    history: VecDeque<StateEntry>,
}

struct Snapshot {
    entries: HashMap<String, StateEntry>,
    taken_at: chrono::DateTime<chrono::Utc>,
}

/// The store. Construct one per process and share it (it is cheap to clone
/// an `Arc<StateStore>`; the store itself holds only `Arc`-backed internals).
pub struct StateStore {
    records: DashMap<String, Arc<RwLock<KeyRecord>>>,
    snapshots: DashMap<Uuid, Snapshot>,
    history_limit: usize,
    event_bus: Arc<EventBus>,
    backing_store: Option<Arc<dyn DurableBackingStore>>,
}

impl StateStore {
    pub fn new(event_bus: Arc<EventBus>) -> Self {
        Self {
            records: DashMap::new(),
            snapshots: DashMap::new(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            event_bus,
            backing_store: None,
        }
    }

    pub fn with_backing_store(mut self, backing_store: Arc<dyn DurableBackingStore>) -> Self {
        self.backing_store = Some(backing_store);
        self
    }

    /// Set a key's value, returning the new version. Mutation is serialized
    /// per key via the key's own lock; other keys are unaffected.
    pub async fn set_state(
        &self,
        key: &str,
        value: serde_json::Value,
        resource_type: ResourceType,
        metadata: Option<HashMap<String, String>>,
    ) -> StateStoreResult<u64> {
        let slot = self
            .records
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(RwLock::new(KeyRecord {
                    current: StateEntry {
                        key: key.to_string(),
                        value: serde_json::Value::Null,
                        version: 0,
                        resource_type,
                        metadata: HashMap::new(),
                        updated_at: chrono::Utc::now(),
                    },
                    history: VecDeque::new(),
                }))
            })
            .clone();

        let mut guard = slot.write().await;
        let old_value = guard.current.value.clone();
        let new_version = guard.current.version + 1;
        let entry = StateEntry {
            key: key.to_string(),
            value: value.clone(),
            version: new_version,
            resource_type,
            metadata: metadata.unwrap_or_default(),
            updated_at: chrono::Utc::now(),
        };
        if guard.history.len() >= self.history_limit {
            guard.history.pop_front();
        }
        guard.history.push_back(guard.current.clone());
        guard.current = entry;
        drop(guard);

        let payload = serde_json::json!({
            "key": key,
            "old_value": old_value,
            "new_value": value,
            "version": new_version,
        });
        if let Err(e) = self
            .event_bus
            .emit(Event::new(EventType::StateChanged, "state_store", payload))
            .await
        {
            warn!(error = %e, "failed to emit STATE_CHANGED");
        }

        Ok(new_version)
    }

    pub async fn get_state(&self, key: &str) -> Option<serde_json::Value> {
        let slot = self.records.get(key)?.clone();
        let guard = slot.read().await;
        Some(guard.current.value.clone())
    }

    pub async fn get_state_entry(&self, key: &str) -> Option<StateEntry> {
        let slot = self.records.get(key)?.clone();
        let guard = slot.read().await;
        Some(guard.current.clone())
    }

    pub async fn get_state_history(&self, key: &str, limit: Option<usize>) -> Vec<StateEntry> {
        let Some(slot) = self.records.get(key).map(|s| s.clone()) else {
            return Vec::new();
        };
        let guard = slot.read().await;
        let mut entries: Vec<StateEntry> = guard.history.iter().cloned().collect();
        entries.push(guard.current.clone());
        if let Some(limit) = limit {
            let len = entries.len();
            if len > limit {
                entries = entries.split_off(len - limit);
            }
        }
        entries
    }

    pub async fn get_states_by_prefix(&self, prefix: &str) -> HashMap<String, StateEntry> {
        let mut result = HashMap::new();
        for item in self.records.iter() {
            if item.key().starts_with(prefix) {
                let guard = item.value().read().await;
                result.insert(item.key().clone(), guard.current.clone());
            }
        }
        result
    }

    /// Take a consistent point-in-time view across all keys. Consistency
    /// here means: each key's entry reflects some write that had completed
    /// by the time that key was visited, not a single global transaction.
    pub async fn snapshot(&self) -> Uuid {
        let mut entries = HashMap::new();
        for item in self.records.iter() {
            let guard = item.value().read().await;
            entries.insert(item.key().clone(), guard.current.clone());
        }
        let handle = Uuid::new_v4();
        let taken_at = chrono::Utc::now();

        if let Some(backing) = &self.backing_store {
            if let Err(e) = backing.persist_snapshot(handle, &entries).await {
                warn!(error = %e, "durable backing store failed to persist snapshot");
            }
        }

        self.snapshots.insert(handle, Snapshot { entries, taken_at });
        debug!(%handle, "snapshot taken");
        handle
    }

    pub async fn restore(&self, handle: Uuid) -> StateStoreResult<()> {
        let snapshot = match self.snapshots.get(&handle) {
            Some(s) => Snapshot {
                entries: s.entries.clone(),
                taken_at: s.taken_at,
            },
            None => match &self.backing_store {
                Some(backing) => {
                    let entries = backing
                        .load_snapshot(handle)
                        .await
                        .map_err(|e| StateStoreError::BackingStoreError(e.to_string()))?
                        .ok_or_else(|| StateStoreError::SnapshotNotFound(handle.to_string()))?;
                    Snapshot {
                        entries,
                        taken_at: chrono::Utc::now(),
                    }
                }
                None => return Err(StateStoreError::SnapshotNotFound(handle.to_string())),
            },
        };

        for (key, entry) in snapshot.entries.iter() {
            let slot = self
                .records
                .entry(key.clone())
                .or_insert_with(|| {
                    Arc::new(RwLock::new(KeyRecord {
                        current: entry.clone(),
                        history: VecDeque::new(),
                    }))
                })
                .clone();
            let mut guard = slot.write().await;
            guard.history.push_back(guard.current.clone());
            if guard.history.len() > self.history_limit {
                guard.history.pop_front();
            }
            guard.current = entry.clone();
        }

        let _ = self
            .event_bus
            .emit(Event::new(
                EventType::StateRestored,
                "state_store",
                serde_json::json!({ "handle": handle.to_string(), "taken_at": snapshot.taken_at }),
            ))
            .await;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> StateStore {
        let bus = Arc::new(EventBus::new());
        bus.start();
        StateStore::new(bus)
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let s = store();
        let v = s
            .set_state("k1", serde_json::json!(42), ResourceType::State, None)
            .await
            .unwrap();
        assert_eq!(v, 1);
        assert_eq!(s.get_state("k1").await, Some(serde_json::json!(42)));
    }

    #[tokio::test]
    async fn version_increments_monotonically() {
        let s = store();
        for i in 1..=3u64 {
            let v = s
                .set_state("k", serde_json::json!(i), ResourceType::State, None)
                .await
                .unwrap();
            assert_eq!(v, i);
        }
    }

    #[tokio::test]
    async fn history_includes_all_prior_versions_up_to_limit() {
        let s = store();
        for i in 0..5 {
            s.set_state("k", serde_json::json!(i), ResourceType::State, None)
                .await
                .unwrap();
        }
        let history = s.get_state_history("k", None).await;
        assert_eq!(history.len(), 5);
        assert_eq!(history.last().unwrap().version, 5);
    }

    #[tokio::test]
    async fn snapshot_restore_round_trips() {
        let s = store();
        s.set_state("a", serde_json::json!(1), ResourceType::State, None)
            .await
            .unwrap();
        let handle = s.snapshot().await;
        s.set_state("a", serde_json::json!(2), ResourceType::State, None)
            .await
            .unwrap();
        assert_eq!(s.get_state("a").await, Some(serde_json::json!(2)));
        s.restore(handle).await.unwrap();
        assert_eq!(s.get_state("a").await, Some(serde_json::json!(1)));
    }

    #[tokio::test]
    async fn prefix_scan_filters_by_key_prefix() {
        let s = store();
        s.set_state("metric:a", serde_json::json!(1), ResourceType::Metric, None)
            .await
            .unwrap();
        s.set_state("cache:b", serde_json::json!(2), ResourceType::Cache, None)
            .await
            .unwrap();
        let matched = s.get_states_by_prefix("metric:").await;
        assert_eq!(matched.len(), 1);
        assert!(matched.contains_key("metric:a"));
    }
}
