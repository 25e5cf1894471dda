//! Agent-operation contexts: validation history, refinement history, and a
//! TTL-based reaper for ephemeral contexts. Layered over
//! [`StateStore`](crate::state_store::StateStore) the same way
//! [`CacheStore`](crate::cache_store::CacheStore) is.
use crate::event_bus::EventBus;
use crate::events::{Event, EventType};
use crate::state_store::{ResourceType, StateStore};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// Default lifetime for EPHEMERAL contexts when none is configured. The
/// source does not state an exact value; this is the documented default
/// per Open Question 3.
pub const DEFAULT_EPHEMERAL_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContextType {
    Persistent,
    Ephemeral,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ValidationRecord {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub success: bool,
    pub error_analysis: Option<String>,
    pub duration_ms: f64,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RefinementRecord {
    pub iteration: u32,
    pub agent_id: String,
    pub original_output: serde_json::Value,
    pub refined_output: serde_json::Value,
    pub refinement_guidance: serde_json::Value,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AgentContext {
    pub agent_id: String,
    pub operation_id: String,
    pub context_type: ContextType,
    pub schema: serde_json::Value,
    pub validation_attempts: u32,
    pub validation_history: Vec<ValidationRecord>,
    pub refinement_history: Vec<RefinementRecord>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl AgentContext {
    fn new(agent_id: String, operation_id: String, schema: serde_json::Value, context_type: ContextType) -> Self {
        Self {
            agent_id,
            operation_id,
            context_type,
            schema,
            validation_attempts: 0,
            validation_history: Vec::new(),
            refinement_history: Vec::new(),
            created_at: chrono::Utc::now(),
        }
    }

    pub fn record_validation(&mut self, success: bool, error_analysis: Option<String>, duration_ms: f64) {
        self.validation_attempts += 1;
        self.validation_history.push(ValidationRecord {
            timestamp: chrono::Utc::now(),
            success,
            error_analysis,
            duration_ms,
        });
    }

    /// `iteration` is dense and monotonic per agent_id: the next refinement
    /// for this agent is always `refinement_history.len() + 1`.
    pub fn record_refinement(
        &mut self,
        original_output: serde_json::Value,
        refined_output: serde_json::Value,
        refinement_guidance: serde_json::Value,
    ) {
        let iteration = self.refinement_history.len() as u32 + 1;
        self.refinement_history.push(RefinementRecord {
            iteration,
            agent_id: self.agent_id.clone(),
            original_output,
            refined_output,
            refinement_guidance,
            timestamp: chrono::Utc::now(),
        });
    }
}

fn context_key(agent_id: &str, operation_id: &str) -> String {
    format!("context:{}:{}", agent_id, operation_id)
}

pub struct ContextStore {
    state_store: Arc<StateStore>,
    event_bus: Arc<EventBus>,
    ttl: Duration,
    expirations: Arc<DashMap<String, tokio::time::Instant>>,
    reaper: Option<JoinHandle<()>>,
}

impl ContextStore {
    pub fn new(state_store: Arc<StateStore>, event_bus: Arc<EventBus>) -> Self {
        Self::with_ttl(state_store, event_bus, DEFAULT_EPHEMERAL_TTL)
    }

    pub fn with_ttl(state_store: Arc<StateStore>, event_bus: Arc<EventBus>, ttl: Duration) -> Self {
        Self {
            state_store,
            event_bus,
            ttl,
            expirations: Arc::new(DashMap::new()),
            reaper: None,
        }
    }

    /// Start the background reaper that discards EPHEMERAL contexts whose
    /// TTL has elapsed. Idempotent: calling it twice replaces the old task.
    pub fn start_reaper(&mut self, sweep_interval: Duration) {
        if let Some(handle) = self.reaper.take() {
            handle.abort();
        }
        let expirations = self.expirations.clone();
        let state_store = self.state_store.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            loop {
                ticker.tick().await;
                let now = tokio::time::Instant::now();
                let expired: Vec<String> = expirations
                    .iter()
                    .filter(|e| *e.value() <= now)
                    .map(|e| e.key().clone())
                    .collect();
                for key in expired {
                    expirations.remove(&key);
                    let _ = state_store
                        .set_state(&key, serde_json::Value::Null, ResourceType::Context, None)
                        .await;
                    debug!(%key, "reaped expired ephemeral context");
                }
            }
        });
        self.reaper = Some(handle);
    }

    pub async fn create_context(
        &self,
        agent_id: &str,
        operation_id: &str,
        schema: serde_json::Value,
        context_type: ContextType,
    ) -> AgentContext {
        let key = context_key(agent_id, operation_id);
        let ctx = AgentContext::new(
            agent_id.to_string(),
            operation_id.to_string(),
            schema,
            context_type,
        );
        self.store_context(&key, &ctx).await;

        if context_type == ContextType::Ephemeral {
            self.expirations.insert(key.clone(), tokio::time::Instant::now() + self.ttl);
        }

        let _ = self
            .event_bus
            .emit(Event::new(
                EventType::ContextCreated,
                "context_store",
                serde_json::json!({ "agent_id": agent_id, "operation_id": operation_id, "key": key }),
            ))
            .await;

        ctx
    }

    pub async fn get_context(&self, key: &str) -> Option<AgentContext> {
        let value = self.state_store.get_state(key).await?;
        if value.is_null() {
            return None;
        }
        serde_json::from_value(value).ok()
    }

    pub async fn store_context(&self, key: &str, ctx: &AgentContext) {
        if let Ok(value) = serde_json::to_value(ctx) {
            let _ = self
                .state_store
                .set_state(key, value, ResourceType::Context, None)
                .await;
        }
        if ctx.context_type == ContextType::Ephemeral {
            self.expirations.insert(key.to_string(), tokio::time::Instant::now() + self.ttl);
        }
    }

    pub fn discard(&self, key: &str) {
        self.expirations.remove(key);
    }

    /// Append a validation record to the context keyed by `(agent_id,
    /// operation_id)`, if one exists. Returns `None` if no such context has
    /// been created yet rather than fabricating one.
    pub async fn record_validation(
        &self,
        agent_id: &str,
        operation_id: &str,
        success: bool,
        error_analysis: Option<String>,
        duration_ms: f64,
    ) -> Option<AgentContext> {
        let key = context_key(agent_id, operation_id);
        let mut ctx = self.get_context(&key).await?;
        ctx.record_validation(success, error_analysis, duration_ms);
        self.store_context(&key, &ctx).await;
        Some(ctx)
    }

    /// Append a refinement record to the context keyed by `(agent_id,
    /// operation_id)`, if one exists.
    pub async fn record_refinement(
        &self,
        agent_id: &str,
        operation_id: &str,
        original_output: serde_json::Value,
        refined_output: serde_json::Value,
        refinement_guidance: serde_json::Value,
    ) -> Option<AgentContext> {
        let key = context_key(agent_id, operation_id);
        let mut ctx = self.get_context(&key).await?;
        ctx.record_refinement(original_output, refined_output, refinement_guidance);
        self.store_context(&key, &ctx).await;
        Some(ctx)
    }
}

impl Drop for ContextStore {
    fn drop(&mut self) {
        if let Some(handle) = self.reaper.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stores() -> (Arc<StateStore>, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new());
        bus.start();
        (Arc::new(StateStore::new(bus.clone())), bus)
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let (ss, bus) = stores();
        let cs = ContextStore::new(ss, bus);
        let ctx = cs
            .create_context("agent-1", "op-1", serde_json::json!({"type": "object"}), ContextType::Persistent)
            .await;
        let key = context_key("agent-1", "op-1");
        let fetched = cs.get_context(&key).await.unwrap();
        assert_eq!(fetched.agent_id, ctx.agent_id);
        assert_eq!(fetched.validation_attempts, 0);
    }

    #[tokio::test]
    async fn refinement_iterations_are_dense_and_monotonic() {
        let (ss, bus) = stores();
        let cs = ContextStore::new(ss, bus);
        let mut ctx = cs
            .create_context("a", "op", serde_json::json!({}), ContextType::Persistent)
            .await;
        ctx.record_refinement(serde_json::json!("o1"), serde_json::json!("r1"), serde_json::json!({}));
        ctx.record_refinement(serde_json::json!("o2"), serde_json::json!("r2"), serde_json::json!({}));
        assert_eq!(ctx.refinement_history[0].iteration, 1);
        assert_eq!(ctx.refinement_history[1].iteration, 2);
    }

    #[tokio::test]
    async fn ephemeral_context_is_reaped_after_ttl() {
        let (ss, bus) = stores();
        let mut cs = ContextStore::with_ttl(ss, bus, Duration::from_millis(20));
        cs.start_reaper(Duration::from_millis(10));
        let key = context_key("a", "op");
        cs.create_context("a", "op", serde_json::json!({}), ContextType::Ephemeral).await;
        assert!(cs.get_context(&key).await.is_some());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(cs.get_context(&key).await.is_none());
    }
}
