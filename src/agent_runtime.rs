//! Per-agent contract: process → reflect → refine, with state tracking and
//! reliability (C10). This is the component every pipeline stage is built
//! from.
use crate::agent_state::{AgentState, ResourceState};
use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry};
use crate::context_store::ContextStore;
use crate::event_bus::EventBus;
use crate::events::{Event, EventType};
use crate::health::{HealthState, HealthTracker};
use crate::metrics_store::MetricsStore;
use crate::ports::{GenerationMessage, GenerationRequest, TextGenerationCapability};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

/// How long `set_agent_state` waits for the state lock before falling back
/// to the lock-free path. The internal state mutation is never lost either
/// way; this bound only governs whether the transition gets the fully
/// serialized (event-ordered) treatment or the best-effort one.
const STATE_LOCK_BOUND: Duration = Duration::from_millis(50);
/// How long `process_with_validation` keeps waiting for a cooperative finish
/// after its own timeout has already elapsed, before detaching.
const DETACH_GRACE_PERIOD: Duration = Duration::from_secs(1);

fn state_code(s: AgentState) -> u8 {
    match s {
        AgentState::Ready => 0,
        AgentState::Processing => 1,
        AgentState::Validating => 2,
        AgentState::FailedValidation => 3,
        AgentState::Complete => 4,
        AgentState::Error => 5,
        AgentState::Coordinating => 6,
        AgentState::Clarifying => 7,
    }
}

fn state_from_code(c: u8) -> AgentState {
    match c {
        0 => AgentState::Ready,
        1 => AgentState::Processing,
        2 => AgentState::Validating,
        3 => AgentState::FailedValidation,
        4 => AgentState::Complete,
        5 => AgentState::Error,
        6 => AgentState::Coordinating,
        _ => AgentState::Clarifying,
    }
}

/// Outcome of `process_with_validation`, `reflect`, and `refine`. On failure,
/// `error`/`error_type` carry the canonical envelope fields; `request_id` is
/// always present so a caller can correlate logs.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AgentResult {
    pub status: String,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub error_type: Option<String>,
    pub request_id: String,
}

impl AgentResult {
    fn success(output: serde_json::Value, request_id: String) -> Self {
        Self {
            status: "success".to_string(),
            output: Some(output),
            error: None,
            error_type: None,
            request_id,
        }
    }

    fn failure(error: impl Into<String>, error_type: &str, request_id: String) -> Self {
        Self {
            status: "error".to_string(),
            output: None,
            error: Some(error.into()),
            error_type: Some(error_type.to_string()),
            request_id,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct GuidelineUpdateResult {
    pub success: bool,
    pub details: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct VerificationResult {
    pub verified: bool,
    pub details: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ReadinessResult {
    pub ready: bool,
    pub details: String,
}

pub struct AgentRuntime {
    agent_id: String,
    breaker_name: String,
    reflect_breaker_name: String,
    refine_breaker_name: String,
    current_state: AtomicU8,
    state_mutex: Mutex<()>,
    initialized: AtomicBool,
    event_bus: Arc<EventBus>,
    context_store: Arc<ContextStore>,
    metrics: Arc<MetricsStore>,
    circuit_breakers: Arc<CircuitBreakerRegistry>,
    health: Arc<HealthTracker>,
    generation: Arc<dyn TextGenerationCapability>,
}

impl AgentRuntime {
    pub fn new(
        agent_id: impl Into<String>,
        event_bus: Arc<EventBus>,
        context_store: Arc<ContextStore>,
        metrics: Arc<MetricsStore>,
        circuit_breakers: Arc<CircuitBreakerRegistry>,
        health: Arc<HealthTracker>,
        generation: Arc<dyn TextGenerationCapability>,
    ) -> Self {
        let agent_id = agent_id.into();
        let breaker_name = format!("agent:{}", agent_id);
        let reflect_breaker_name = format!("agent:{}:reflect", agent_id);
        let refine_breaker_name = format!("agent:{}:refine", agent_id);
        Self {
            agent_id,
            breaker_name,
            reflect_breaker_name,
            refine_breaker_name,
            current_state: AtomicU8::new(state_code(AgentState::Ready)),
            state_mutex: Mutex::new(()),
            initialized: AtomicBool::new(false),
            event_bus,
            context_store,
            metrics,
            circuit_breakers,
            health,
            generation,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn agent_state(&self) -> AgentState {
        state_from_code(self.current_state.load(Ordering::Acquire))
    }

    pub fn resource_state(&self) -> ResourceState {
        self.agent_state().resource_state()
    }

    /// Transition to `new_state`. The internal state mutation always lands,
    /// even if the state lock cannot be acquired within [`STATE_LOCK_BOUND`]:
    /// in that case a WARNING alert is emitted instead of the normal
    /// serialized path.
    pub async fn set_agent_state(&self, new_state: AgentState, metadata: Option<HashMap<String, String>>) {
        match tokio::time::timeout(STATE_LOCK_BOUND, self.state_mutex.lock()).await {
            Ok(_guard) => {
                let old = self.agent_state();
                self.current_state.store(state_code(new_state), Ordering::Release);
                self.emit_state_transition(old, new_state, metadata).await;
            }
            Err(_) => {
                let old = self.agent_state();
                self.current_state.store(state_code(new_state), Ordering::Release);
                warn!(
                    agent_id = %self.agent_id,
                    ?new_state,
                    "state lock contended past bound; internal state updated without the serialized path"
                );
                let _ = self
                    .event_bus
                    .emit(Event::new(
                        EventType::ResourceAlertCreated,
                        "agent_runtime",
                        serde_json::json!({
                            "agent_id": self.agent_id,
                            "severity": "WARNING",
                            "reason": "state_lock_timeout",
                            "new_state": new_state,
                        }),
                    ))
                    .await;
                self.emit_state_transition(old, new_state, metadata).await;
            }
        }
    }

    async fn emit_state_transition(
        &self,
        old_state: AgentState,
        new_state: AgentState,
        metadata: Option<HashMap<String, String>>,
    ) {
        let _ = self
            .event_bus
            .emit(Event::new(
                EventType::InterfaceStateChanged,
                "agent_runtime",
                serde_json::json!({
                    "agent_id": self.agent_id,
                    "old_state": old_state,
                    "new_state": new_state,
                    "metadata": metadata.unwrap_or_default(),
                }),
            ))
            .await;

        let (health_state, description) = match new_state.resource_state() {
            ResourceState::Initializing => (HealthState::Unknown, "initializing"),
            ResourceState::Active => (HealthState::Healthy, "active"),
            ResourceState::Paused => (HealthState::Degraded, "paused"),
            ResourceState::Failed => (HealthState::Unhealthy, "failed"),
            ResourceState::Terminated => (HealthState::Healthy, "terminated"),
        };
        self.health
            .report(&format!("agent:{}", self.agent_id), health_state, description, None)
            .await;
    }

    async fn ensure_initialized(&self) {
        if !self.initialized.swap(true, Ordering::AcqRel) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    /// Steps 1-7 of the process algorithm: initialize, transition through
    /// PROCESSING, call the generation capability under the agent's named
    /// breaker and an overall timeout, and land in COMPLETE or ERROR.
    pub async fn process_with_validation(
        &self,
        conversation: Vec<GenerationMessage>,
        prompt_info: String,
        schema: Option<serde_json::Value>,
        phase: Option<String>,
        operation_id: Option<String>,
        metadata: Option<HashMap<String, String>>,
        timeout: Duration,
    ) -> AgentResult {
        let request_id = Uuid::new_v4().to_string();
        self.ensure_initialized().await;

        let mut metric_tags = HashMap::new();
        if let Some(phase) = &phase {
            metric_tags.insert("phase".to_string(), phase.clone());
        }
        self.metrics
            .record_metric("processing_start", 1.0, Some(metric_tags.clone()))
            .await;
        self.set_agent_state(AgentState::Processing, metadata.clone()).await;

        let operation_id = operation_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let _ctx = self
            .context_store
            .create_context(
                &self.agent_id,
                &operation_id,
                schema.unwrap_or(serde_json::Value::Null),
                crate::context_store::ContextType::Ephemeral,
            )
            .await;

        let mut request_metadata = metadata.unwrap_or_default();
        if let Some(phase) = &phase {
            request_metadata.insert("phase".to_string(), phase.clone());
        }
        let request = GenerationRequest {
            messages: conversation,
            max_tokens: None,
            temperature: None,
            metadata: request_metadata,
        };

        let breaker = self
            .circuit_breakers
            .get_or_create(&self.breaker_name, CircuitBreakerConfig::default());

        if breaker.try_admit().await.is_err() {
            self.set_agent_state(AgentState::Error, None).await;
            return AgentResult::failure(
                format!("circuit '{}' is open", self.breaker_name),
                "circuit_open",
                request_id,
            );
        }

        let generation = self.generation.clone();
        let started_at = std::time::Instant::now();
        let mut handle = tokio::spawn(async move { generation.generate(request).await });

        let joined = match tokio::time::timeout(timeout, &mut handle).await {
            Ok(result) => Some(result),
            Err(_) => match tokio::time::timeout(DETACH_GRACE_PERIOD, &mut handle).await {
                Ok(result) => Some(result),
                Err(_) => None,
            },
        };

        let Some(joined) = joined else {
            // Detach: the spawned task keeps running to completion on its own;
            // its eventual result is discarded because `handle` is dropped here.
            breaker.report_failure().await;
            self.metrics
                .record_metric("processing_timeout", 1.0, Some(metric_tags.clone()))
                .await;
            let _ = self
                .event_bus
                .emit(Event::new(
                    EventType::TimeoutOccurred,
                    "agent_runtime",
                    serde_json::json!({
                        "agent_id": self.agent_id,
                        "operation": prompt_info,
                        "phase": phase,
                        "request_id": request_id,
                    }),
                ))
                .await;
            self.set_agent_state(AgentState::Error, None).await;
            return AgentResult::failure("operation timed out", "timeout", request_id);
        };

        let elapsed_ms = started_at.elapsed().as_secs_f64() * 1000.0;

        match joined {
            Ok(Ok(response)) if response.error.is_some() => {
                breaker.report_failure().await;
                self.metrics
                    .record_metric("processing_error", 1.0, Some(metric_tags.clone()))
                    .await;
                self.set_agent_state(AgentState::Error, None).await;
                AgentResult::failure(
                    response.error.unwrap().to_string(),
                    "transient_failure",
                    request_id,
                )
            }
            Ok(Ok(response)) => {
                breaker.report_success().await;
                self.metrics
                    .record_metric("processing_duration_ms", elapsed_ms, Some(metric_tags.clone()))
                    .await;
                self.metrics
                    .record_metric("processing_success", 1.0, Some(metric_tags.clone()))
                    .await;
                self.set_agent_state(AgentState::Complete, None).await;
                AgentResult::success(
                    serde_json::json!({ "content": response.content, "finish_reason": response.finish_reason }),
                    request_id,
                )
            }
            Ok(Err(e)) => {
                breaker.report_failure().await;
                self.metrics
                    .record_metric("processing_error", 1.0, Some(metric_tags.clone()))
                    .await;
                self.set_agent_state(AgentState::Error, None).await;
                AgentResult::failure(e.to_string(), "transient_failure", request_id)
            }
            Err(join_err) => {
                breaker.report_failure().await;
                self.set_agent_state(AgentState::Error, None).await;
                AgentResult::failure(join_err.to_string(), "fatal_internal", request_id)
            }
        }
    }

    /// Post-hoc validation of `output`. Wrapped in the named reflection
    /// breaker; an open breaker never raises to the caller, it returns the
    /// canonical rejection result. Appends a `ValidationRecord` to the
    /// operation's `AgentContext` on both the pass and fail path (an open
    /// breaker never reaches the generation capability, so it appends
    /// nothing — there is no validation attempt to record).
    pub async fn reflect(&self, output: serde_json::Value, operation_id: &str) -> AgentResult {
        let request_id = Uuid::new_v4().to_string();
        let started_at = std::time::Instant::now();
        self.set_agent_state(AgentState::Validating, None).await;
        let breaker = self
            .circuit_breakers
            .get_or_create(&self.reflect_breaker_name, CircuitBreakerConfig::default());

        if breaker.try_admit().await.is_err() {
            return AgentResult::failure("reflection rejected: circuit open", "circuit_open", request_id);
        }

        let request = GenerationRequest {
            messages: vec![GenerationMessage {
                role: "system".to_string(),
                content: format!("Reflect on this output for correctness: {}", output),
            }],
            max_tokens: None,
            temperature: None,
            metadata: HashMap::new(),
        };

        let duration_ms = || started_at.elapsed().as_secs_f64() * 1000.0;

        match self.generation.generate(request).await {
            Ok(response) if response.error.is_none() => {
                breaker.report_success().await;
                self.context_store
                    .record_validation(&self.agent_id, operation_id, true, None, duration_ms())
                    .await;
                let _ = self
                    .event_bus
                    .emit(Event::new(
                        EventType::ValidationCompleted,
                        "agent_runtime",
                        serde_json::json!({ "agent_id": self.agent_id, "success": true }),
                    ))
                    .await;
                AgentResult::success(serde_json::json!({ "content": response.content }), request_id)
            }
            Ok(response) => {
                breaker.report_failure().await;
                let error_analysis = response.error.clone().unwrap().to_string();
                self.context_store
                    .record_validation(&self.agent_id, operation_id, false, Some(error_analysis.clone()), duration_ms())
                    .await;
                AgentResult::failure(error_analysis, "validation_failure", request_id)
            }
            Err(e) => {
                breaker.report_failure().await;
                let error_analysis = e.to_string();
                self.context_store
                    .record_validation(&self.agent_id, operation_id, false, Some(error_analysis.clone()), duration_ms())
                    .await;
                AgentResult::failure(error_analysis, "transient_failure", request_id)
            }
        }
    }

    /// Re-execute with added guidance. Same breaker-guarded pattern as
    /// `reflect`; an open breaker returns "refinement rejected". Appends a
    /// `RefinementRecord` to the operation's `AgentContext` on success.
    pub async fn refine(&self, output: serde_json::Value, guidance: serde_json::Value, operation_id: &str) -> AgentResult {
        let request_id = Uuid::new_v4().to_string();
        let breaker = self
            .circuit_breakers
            .get_or_create(&self.refine_breaker_name, CircuitBreakerConfig::default());

        if breaker.try_admit().await.is_err() {
            return AgentResult::failure("refinement rejected: circuit open", "circuit_open", request_id);
        }

        let request = GenerationRequest {
            messages: vec![GenerationMessage {
                role: "system".to_string(),
                content: format!("Refine output {} using guidance {}", output, guidance),
            }],
            max_tokens: None,
            temperature: None,
            metadata: HashMap::new(),
        };

        match self.generation.generate(request).await {
            Ok(response) if response.error.is_none() => {
                breaker.report_success().await;
                let refined_output = serde_json::json!({ "content": response.content });
                self.context_store
                    .record_refinement(&self.agent_id, operation_id, output, refined_output.clone(), guidance)
                    .await;
                self.set_agent_state(AgentState::Complete, None).await;
                AgentResult::success(refined_output, request_id)
            }
            Ok(response) => {
                breaker.report_failure().await;
                AgentResult::failure(response.error.unwrap().to_string(), "validation_failure", request_id)
            }
            Err(e) => {
                breaker.report_failure().await;
                AgentResult::failure(e.to_string(), "transient_failure", request_id)
            }
        }
    }

    /// Contract stub: records the update against this agent's state. The
    /// logic that decides whether/how to propagate a guideline change lives
    /// in an external coordinator, not here.
    pub async fn apply_guideline_update(
        &self,
        origin_agent_id: &str,
        propagation_context: serde_json::Value,
        update_data: serde_json::Value,
    ) -> GuidelineUpdateResult {
        self.metrics.record_metric("guideline_update_applied", 1.0, None).await;
        let _ = propagation_context;
        let _ = update_data;
        GuidelineUpdateResult {
            success: true,
            details: format!("recorded guideline update from {}", origin_agent_id),
        }
    }

    pub async fn verify_guideline_update(&self, update_id: &str) -> VerificationResult {
        VerificationResult {
            verified: true,
            details: format!("update {} recorded for agent {}", update_id, self.agent_id),
        }
    }

    pub async fn check_update_readiness(
        &self,
        origin_agent_id: &str,
        propagation_context: serde_json::Value,
    ) -> ReadinessResult {
        let _ = propagation_context;
        ReadinessResult {
            ready: self.agent_state().is_terminal() || self.agent_state() == AgentState::Ready,
            details: format!("readiness evaluated for update from {}", origin_agent_id),
        }
    }

    /// Ask a clarifying question of the generation capability. Transitions
    /// through CLARIFYING for the duration of the call.
    pub async fn clarify(&self, question: &str) -> AgentResult {
        let request_id = Uuid::new_v4().to_string();
        self.set_agent_state(AgentState::Clarifying, None).await;

        let request = GenerationRequest {
            messages: vec![GenerationMessage {
                role: "user".to_string(),
                content: question.to_string(),
            }],
            max_tokens: None,
            temperature: None,
            metadata: HashMap::new(),
        };

        let result = match self.generation.generate(request).await {
            Ok(response) if response.error.is_none() => {
                AgentResult::success(serde_json::json!({ "content": response.content }), request_id)
            }
            Ok(response) => AgentResult::failure(response.error.unwrap().to_string(), "validation_failure", request_id),
            Err(e) => AgentResult::failure(e.to_string(), "transient_failure", request_id),
        };

        self.set_agent_state(AgentState::Processing, None).await;
        result
    }

    /// Hand off to the next agent in a sequence. The decision of *what* to
    /// change in either output belongs to an external collaborator; this
    /// just marks the coordination boundary and passes both outputs through.
    pub async fn coordinate_with_next_agent(
        &self,
        next_agent: &str,
        my_output: serde_json::Value,
        next_output: serde_json::Value,
        params: Option<serde_json::Value>,
    ) -> (serde_json::Value, serde_json::Value, HashMap<String, String>) {
        self.set_agent_state(AgentState::Coordinating, None).await;
        let mut metadata = HashMap::new();
        metadata.insert("next_agent".to_string(), next_agent.to_string());
        metadata.insert("coordinated_by".to_string(), self.agent_id.clone());
        let _ = params;
        (my_output, next_output, metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerRegistry;
    use crate::context_store::ContextStore;
    use crate::ports::GenerationResponse;
    use crate::state_store::StateStore;
    use async_trait::async_trait;

    struct EchoCapability;

    #[async_trait]
    impl TextGenerationCapability for EchoCapability {
        async fn generate(&self, request: GenerationRequest) -> Result<crate::ports::GenerationResponse, anyhow::Error> {
            Ok(GenerationResponse {
                content: request.messages.last().map(|m| m.content.clone()).unwrap_or_default(),
                finish_reason: "stop".to_string(),
                usage: None,
                error: None,
            })
        }
    }

    struct SlowCapability;

    #[async_trait]
    impl TextGenerationCapability for SlowCapability {
        async fn generate(&self, _request: GenerationRequest) -> Result<GenerationResponse, anyhow::Error> {
            tokio::time::sleep(Duration::from_secs(2)).await;
            Ok(GenerationResponse {
                content: "late".to_string(),
                finish_reason: "stop".to_string(),
                usage: None,
                error: None,
            })
        }
    }

    fn runtime(generation: Arc<dyn TextGenerationCapability>) -> AgentRuntime {
        let bus = Arc::new(EventBus::new());
        bus.start();
        let state_store = Arc::new(StateStore::new(bus.clone()));
        let context_store = Arc::new(ContextStore::new(state_store.clone(), bus.clone()));
        let metrics = Arc::new(MetricsStore::new(state_store.clone(), bus.clone()));
        let circuit_breakers = Arc::new(CircuitBreakerRegistry::new(bus.clone(), state_store));
        let health = Arc::new(HealthTracker::new(bus.clone()));
        AgentRuntime::new("test-agent", bus, context_store, metrics, circuit_breakers, health, generation)
    }

    #[tokio::test]
    async fn happy_path_ends_in_complete() {
        let rt = runtime(Arc::new(EchoCapability));
        let result = rt
            .process_with_validation(
                vec![GenerationMessage { role: "user".into(), content: "hi".into() }],
                "prompt".into(),
                None,
                None,
                None,
                None,
                Duration::from_secs(5),
            )
            .await;
        assert_eq!(result.status, "success");
        assert_eq!(rt.agent_state(), AgentState::Complete);
    }

    #[tokio::test]
    async fn timeout_ends_in_error_within_grace_period() {
        let rt = runtime(Arc::new(SlowCapability));
        let start = std::time::Instant::now();
        let result = rt
            .process_with_validation(
                vec![GenerationMessage { role: "user".into(), content: "hi".into() }],
                "prompt".into(),
                None,
                None,
                None,
                None,
                Duration::from_millis(100),
            )
            .await;
        assert_eq!(result.error_type.as_deref(), Some("timeout"));
        assert_eq!(rt.agent_state(), AgentState::Error);
        assert!(start.elapsed() < Duration::from_millis(1300));
    }

    #[tokio::test]
    async fn state_lock_timeout_still_applies_the_mutation() {
        let rt = runtime(Arc::new(EchoCapability));
        // Hold the lock to force the fallback path.
        let _guard = rt.state_mutex.lock().await;
        rt.set_agent_state(AgentState::Error, None).await;
        drop(_guard);
        assert_eq!(rt.agent_state(), AgentState::Error);
    }

    #[tokio::test]
    async fn reflect_returns_canonical_rejection_when_breaker_open() {
        let rt = runtime(Arc::new(EchoCapability));
        let breaker = rt
            .circuit_breakers
            .get_or_create(&rt.reflect_breaker_name, CircuitBreakerConfig::default());
        breaker.trip("test").await;
        let result = rt.reflect(serde_json::json!({"a": 1}), "op-1").await;
        assert_eq!(result.status, "error");
        assert_eq!(result.error_type.as_deref(), Some("circuit_open"));
    }

    #[tokio::test]
    async fn reflect_then_refine_then_reflect_populates_context_histories() {
        let rt = runtime(Arc::new(EchoCapability));
        let operation_id = "op-s2";
        rt.context_store
            .create_context(&rt.agent_id, operation_id, serde_json::Value::Null, crate::context_store::ContextType::Ephemeral)
            .await;

        struct FailOnce(std::sync::atomic::AtomicBool);

        #[async_trait]
        impl TextGenerationCapability for FailOnce {
            async fn generate(&self, _request: GenerationRequest) -> Result<GenerationResponse, anyhow::Error> {
                if self.0.swap(true, Ordering::SeqCst) {
                    Ok(GenerationResponse {
                        content: "valid".to_string(),
                        finish_reason: "stop".to_string(),
                        usage: None,
                        error: None,
                    })
                } else {
                    Ok(GenerationResponse {
                        content: String::new(),
                        finish_reason: "stop".to_string(),
                        usage: None,
                        error: Some("schema mismatch".to_string()),
                    })
                }
            }
        }

        let rt = AgentRuntime::new(
            "test-agent",
            rt.event_bus.clone(),
            rt.context_store.clone(),
            rt.metrics.clone(),
            rt.circuit_breakers.clone(),
            rt.health.clone(),
            Arc::new(FailOnce(std::sync::atomic::AtomicBool::new(false))),
        );

        let first = rt.reflect(serde_json::json!({"output": "draft"}), operation_id).await;
        assert_eq!(first.status, "error");

        let refined = rt
            .refine(
                serde_json::json!({"output": "draft"}),
                serde_json::json!({"fix": "add field X"}),
                operation_id,
            )
            .await;
        assert_eq!(refined.status, "success");

        let second = rt.reflect(serde_json::json!({"output": "fixed"}), operation_id).await;
        assert_eq!(second.status, "success");

        let key = format!("context:{}:{}", rt.agent_id, operation_id);
        let ctx = rt.context_store.get_context(&key).await.unwrap();
        assert_eq!(ctx.validation_history.len(), 2);
        assert!(!ctx.validation_history[0].success);
        assert!(ctx.validation_history[1].success);
        assert_eq!(ctx.refinement_history.len(), 1);
    }

    #[tokio::test]
    async fn coordinate_passes_both_outputs_through() {
        let rt = runtime(Arc::new(EchoCapability));
        let (mine, next, meta) = rt
            .coordinate_with_next_agent("agent-b", serde_json::json!(1), serde_json::json!(2), None)
            .await;
        assert_eq!(mine, serde_json::json!(1));
        assert_eq!(next, serde_json::json!(2));
        assert_eq!(meta.get("next_agent").unwrap(), "agent-b");
    }
}
