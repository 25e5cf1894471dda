//! Named reliability gates with a dependency graph (C7).
//!
//! The dependency graph is modelled as index-based adjacency rather than
//! breakers holding `Arc` references to each other: each breaker gets a
//! stable index, and edges are pairs of indices stored in one place. That
//! keeps the cascade free of reference cycles and lets cycle detection run
//! as a plain graph search at edge-insertion time.
use crate::errors::{CircuitBreakerError, CircuitBreakerResult};
use crate::event_bus::EventBus;
use crate::events::{Event, EventType};
use crate::state_store::{ResourceType, StateStore};
use dashmap::DashMap;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

fn persisted_key(name: &str) -> String {
    format!("circuit_breaker:{}", name)
}

/// What actually survives a save/load round-trip. `opened_at`/`failure_times`
/// are `tokio::time::Instant`s with no wall-clock meaning across a restart,
/// so only the state and failure count are persisted; a breaker loaded back
/// into OPEN starts its recovery timeout fresh from the load.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct PersistedBreakerState {
    state: CircuitState,
    failure_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub failure_window: Duration,
    pub half_open_max_tries: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            failure_window: Duration::from_secs(60),
            half_open_max_tries: 1,
        }
    }
}

/// What `execute` returns: either the operation's own result, or a refusal
/// attributable to the breaker itself.
#[derive(Debug)]
pub enum ExecuteError<E> {
    Open,
    OperationFailed(E),
}

struct Inner {
    state: CircuitState,
    failure_times: VecDeque<tokio::time::Instant>,
    opened_at: Option<tokio::time::Instant>,
    half_open_trials_in_flight: u32,
}

pub struct CircuitBreaker {
    pub name: String,
    config: CircuitBreakerConfig,
    inner: RwLock<Inner>,
    half_open_successes: AtomicU32,
    event_bus: Arc<EventBus>,
}

impl CircuitBreaker {
    fn new(name: String, config: CircuitBreakerConfig, event_bus: Arc<EventBus>) -> Self {
        Self {
            name,
            config,
            inner: RwLock::new(Inner {
                state: CircuitState::Closed,
                failure_times: VecDeque::new(),
                opened_at: None,
                half_open_trials_in_flight: 0,
            }),
            half_open_successes: AtomicU32::new(0),
            event_bus,
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.read().await.state
    }

    pub async fn failure_count(&self) -> usize {
        let mut inner = self.inner.write().await;
        self.prune_window(&mut inner);
        inner.failure_times.len()
    }

    fn prune_window(&self, inner: &mut Inner) {
        let cutoff = tokio::time::Instant::now()
            .checked_sub(self.config.failure_window)
            .unwrap_or_else(tokio::time::Instant::now);
        while let Some(front) = inner.failure_times.front() {
            if *front < cutoff {
                inner.failure_times.pop_front();
            } else {
                break;
            }
        }
    }

    /// Run `operation` through the breaker. CLOSED executes directly, OPEN
    /// fails fast, HALF_OPEN admits up to `half_open_max_tries` concurrent
    /// trials.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, ExecuteError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.try_admit().await.map_err(|_| ExecuteError::Open)?;

        let result = operation().await;

        match result {
            Ok(value) => {
                self.report_success().await;
                Ok(value)
            }
            Err(e) => {
                self.report_failure().await;
                Err(ExecuteError::OperationFailed(e))
            }
        }
    }

    /// Admission check without running anything. Callers that need to
    /// detach the underlying work from the breaker's bookkeeping (so a
    /// caller-side timeout never leaves a half-open trial permanently
    /// in-flight) call this, run their operation however they like, then
    /// report the outcome with [`Self::report_success`] / [`Self::report_failure`].
    pub async fn try_admit(&self) -> Result<(), CircuitBreakerError> {
        let mut inner = self.inner.write().await;
        match inner.state {
            CircuitState::Open => {
                if let Some(opened_at) = inner.opened_at {
                    if opened_at.elapsed() >= self.config.recovery_timeout {
                        inner.state = CircuitState::HalfOpen;
                        inner.half_open_trials_in_flight = 1;
                        self.half_open_successes.store(0, Ordering::SeqCst);
                        drop(inner);
                        self.emit_state_change(CircuitState::HalfOpen).await;
                        Ok(())
                    } else {
                        Err(CircuitBreakerError::Open(self.name.clone()))
                    }
                } else {
                    Err(CircuitBreakerError::Open(self.name.clone()))
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_trials_in_flight >= self.config.half_open_max_tries {
                    Err(CircuitBreakerError::Open(self.name.clone()))
                } else {
                    inner.half_open_trials_in_flight += 1;
                    Ok(())
                }
            }
            CircuitState::Closed => Ok(()),
        }
    }

    pub async fn report_success(&self) {
        self.on_success().await
    }

    pub async fn report_failure(&self) {
        self.on_failure().await
    }

    async fn on_success(&self) {
        let mut inner = self.inner.write().await;
        if inner.state == CircuitState::HalfOpen {
            inner.half_open_trials_in_flight = inner.half_open_trials_in_flight.saturating_sub(1);
            if inner.half_open_trials_in_flight == 0 {
                inner.state = CircuitState::Closed;
                inner.failure_times.clear();
                inner.opened_at = None;
                drop(inner);
                self.emit_state_change(CircuitState::Closed).await;
                return;
            }
        }
    }

    async fn on_failure(&self) {
        let mut inner = self.inner.write().await;
        self.prune_window(&mut inner);

        if inner.state == CircuitState::HalfOpen {
            inner.half_open_trials_in_flight = inner.half_open_trials_in_flight.saturating_sub(1);
            inner.state = CircuitState::Open;
            inner.opened_at = Some(tokio::time::Instant::now());
            drop(inner);
            self.emit_state_change(CircuitState::Open).await;
            return;
        }

        inner.failure_times.push_back(tokio::time::Instant::now());
        if inner.failure_times.len() as u32 >= self.config.failure_threshold && inner.state == CircuitState::Closed {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(tokio::time::Instant::now());
            drop(inner);
            self.emit_state_change(CircuitState::Open).await;
        }
    }

    pub async fn trip(&self, reason: &str) {
        let mut inner = self.inner.write().await;
        inner.state = CircuitState::Open;
        inner.opened_at = Some(tokio::time::Instant::now());
        drop(inner);
        warn!(breaker = %self.name, reason, "circuit breaker manually tripped");
        self.emit_state_change(CircuitState::Open).await;
    }

    pub async fn reset(&self) {
        let mut inner = self.inner.write().await;
        inner.state = CircuitState::Closed;
        inner.failure_times.clear();
        inner.opened_at = None;
        inner.half_open_trials_in_flight = 0;
        drop(inner);
        info!(breaker = %self.name, "circuit breaker reset");
        self.emit_state_change(CircuitState::Closed).await;
    }

    async fn persisted_snapshot(&self) -> PersistedBreakerState {
        let mut inner = self.inner.write().await;
        self.prune_window(&mut inner);
        PersistedBreakerState {
            state: inner.state,
            failure_count: inner.failure_times.len(),
        }
    }

    async fn restore_persisted(&self, persisted: PersistedBreakerState) {
        let mut inner = self.inner.write().await;
        inner.state = persisted.state;
        inner.failure_times.clear();
        let now = tokio::time::Instant::now();
        for _ in 0..persisted.failure_count {
            inner.failure_times.push_back(now);
        }
        inner.opened_at = if persisted.state == CircuitState::Open { Some(now) } else { None };
        inner.half_open_trials_in_flight = 0;
    }

    async fn emit_state_change(&self, new_state: CircuitState) {
        let _ = self
            .event_bus
            .emit(Event::new(
                EventType::CircuitBreakerStateChanged,
                "circuit_breaker",
                serde_json::json!({ "name": self.name, "state": new_state }),
            ))
            .await;
    }
}

struct DependencyGraph {
    index_of: HashMap<String, usize>,
    names: Vec<String>,
    children: Vec<Vec<usize>>,
}

impl DependencyGraph {
    fn new() -> Self {
        Self {
            index_of: HashMap::new(),
            names: Vec::new(),
            children: Vec::new(),
        }
    }

    fn ensure_index(&mut self, name: &str) -> usize {
        if let Some(&idx) = self.index_of.get(name) {
            return idx;
        }
        let idx = self.names.len();
        self.names.push(name.to_string());
        self.children.push(Vec::new());
        self.index_of.insert(name.to_string(), idx);
        idx
    }

    /// Is `target` reachable from `start` via existing child edges?
    fn reachable(&self, start: usize, target: usize) -> bool {
        let mut stack = vec![start];
        let mut seen = vec![false; self.names.len()];
        while let Some(node) = stack.pop() {
            if node == target {
                return true;
            }
            if seen[node] {
                continue;
            }
            seen[node] = true;
            for &next in &self.children[node] {
                stack.push(next);
            }
        }
        false
    }

    fn add_edge(&mut self, parent: &str, child: &str) -> CircuitBreakerResult<()> {
        let parent_idx = self.ensure_index(parent);
        let child_idx = self.ensure_index(child);
        if self.reachable(child_idx, parent_idx) {
            return Err(CircuitBreakerError::InvalidDependency {
                child: child.to_string(),
                parent: parent.to_string(),
            });
        }
        self.children[parent_idx].push(child_idx);
        Ok(())
    }

    /// All names transitively reachable from `name`, breadth-first.
    fn transitive_children(&self, name: &str) -> Vec<String> {
        let Some(&start) = self.index_of.get(name) else {
            return Vec::new();
        };
        let mut queue = VecDeque::from([start]);
        let mut seen = vec![false; self.names.len()];
        seen[start] = true;
        let mut result = Vec::new();
        while let Some(node) = queue.pop_front() {
            for &next in &self.children[node] {
                if !seen[next] {
                    seen[next] = true;
                    result.push(self.names[next].clone());
                    queue.push_back(next);
                }
            }
        }
        result
    }
}

/// Process-wide registry. Breaker mutations are serialized per breaker (each
/// `CircuitBreaker` has its own lock); the registry's own lock only guards
/// membership (creating new breakers, registering dependencies).
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    graph: Mutex<DependencyGraph>,
    event_bus: Arc<EventBus>,
    state_store: Arc<StateStore>,
}

impl CircuitBreakerRegistry {
    pub fn new(event_bus: Arc<EventBus>, state_store: Arc<StateStore>) -> Self {
        Self {
            breakers: DashMap::new(),
            graph: Mutex::new(DependencyGraph::new()),
            event_bus,
            state_store,
        }
    }

    /// Concurrent calls for the same name return the same instance:
    /// `DashMap::entry` holds the shard lock across the check-then-insert.
    pub fn get_or_create(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name.to_string(), config, self.event_bus.clone())))
            .clone()
    }

    pub fn get(&self, name: &str) -> CircuitBreakerResult<Arc<CircuitBreaker>> {
        self.breakers
            .get(name)
            .map(|e| e.clone())
            .ok_or_else(|| CircuitBreakerError::NotFound(name.to_string()))
    }

    /// `child` depends on `parent`: tripping `parent` cascades to `child`.
    pub async fn register_dependency(&self, child: &str, parent: &str) -> CircuitBreakerResult<()> {
        self.get_or_create(child, CircuitBreakerConfig::default());
        self.get_or_create(parent, CircuitBreakerConfig::default());
        let mut graph = self.graph.lock().await;
        graph.add_edge(parent, child)
    }

    /// Trip `name` and cascade to every transitive child. Cascaded trips are
    /// independent afterward: resetting `name` does not reset its children.
    pub async fn trip(&self, name: &str, reason: &str) -> CircuitBreakerResult<()> {
        let breaker = self.get(name)?;
        breaker.trip(reason).await;

        let descendants = {
            let graph = self.graph.lock().await;
            graph.transitive_children(name)
        };
        for child_name in descendants {
            if let Some(child) = self.breakers.get(&child_name) {
                child.trip("cascaded from dependency trip").await;
            }
        }
        Ok(())
    }

    pub async fn reset(&self, name: &str) -> CircuitBreakerResult<()> {
        self.get(name)?.reset().await;
        Ok(())
    }

    pub fn names(&self) -> Vec<String> {
        self.breakers.iter().map(|e| e.key().clone()).collect()
    }

    /// Persist `name`'s state and failure count to the state store under
    /// `circuit_breaker:<name>`.
    pub async fn save_state(&self, name: &str) -> CircuitBreakerResult<()> {
        let breaker = self.get(name)?;
        let snapshot = breaker.persisted_snapshot().await;
        let payload = serde_json::to_value(&snapshot)
            .map_err(|e| CircuitBreakerError::Persistence(e.to_string()))?;
        self.state_store
            .set_state(&persisted_key(name), payload, ResourceType::Monitor, None)
            .await
            .map_err(|e| CircuitBreakerError::Persistence(e.to_string()))?;
        debug!(breaker = name, "circuit breaker state persisted");
        Ok(())
    }

    /// Restore every breaker's state from the state store. Only names
    /// already registered in this registry are touched; a persisted entry
    /// for a breaker that no longer exists is left alone.
    pub async fn load_state(&self) -> CircuitBreakerResult<()> {
        let entries = self.state_store.get_states_by_prefix("circuit_breaker:").await;
        for (key, entry) in entries {
            let Some(name) = key.strip_prefix("circuit_breaker:") else {
                continue;
            };
            let Some(breaker) = self.breakers.get(name).map(|e| e.clone()) else {
                continue;
            };
            match serde_json::from_value::<PersistedBreakerState>(entry.value.clone()) {
                Ok(snapshot) => {
                    breaker.restore_persisted(snapshot).await;
                    debug!(breaker = name, "circuit breaker state restored");
                }
                Err(e) => warn!(breaker = name, error = %e, "failed to parse persisted circuit breaker state"),
            }
        }
        Ok(())
    }
}
