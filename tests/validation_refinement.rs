//! S2: a failed reflection followed by a refinement followed by a passing
//! reflection leaves the operation's context with a two-entry
//! validation_history (fail, then success) and a one-entry
//! refinement_history.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use substrate_core::{
    AgentRuntime, CircuitBreakerRegistry, ContextStore, ContextType, EventBus, GenerationRequest,
    GenerationResponse, HealthTracker, MetricsStore, StateStore, TextGenerationCapability,
};

/// Fails the first call (simulating a schema-validation miss on reflection),
/// succeeds on every call after (the refined output, and the re-reflection).
struct FailsOnFirstCall(AtomicBool);

#[async_trait]
impl TextGenerationCapability for FailsOnFirstCall {
    async fn generate(&self, _request: GenerationRequest) -> Result<GenerationResponse, anyhow::Error> {
        if self.0.swap(true, Ordering::SeqCst) {
            Ok(GenerationResponse {
                content: "valid output".to_string(),
                finish_reason: "stop".to_string(),
                usage: None,
                error: None,
            })
        } else {
            Ok(GenerationResponse {
                content: String::new(),
                finish_reason: "stop".to_string(),
                usage: None,
                error: Some(serde_json::json!("missing required field")),
            })
        }
    }
}

#[tokio::test]
async fn failed_reflection_then_refinement_then_passing_reflection() {
    let bus = Arc::new(EventBus::new());
    bus.start();
    let state_store = Arc::new(StateStore::new(bus.clone()));
    let context_store = Arc::new(ContextStore::new(state_store.clone(), bus.clone()));
    let metrics = Arc::new(MetricsStore::new(state_store.clone(), bus.clone()));
    let circuit_breakers = Arc::new(CircuitBreakerRegistry::new(bus.clone(), state_store));
    let health = Arc::new(HealthTracker::new(bus.clone()));
    let agent = AgentRuntime::new(
        "A",
        bus,
        context_store.clone(),
        metrics,
        circuit_breakers,
        health,
        Arc::new(FailsOnFirstCall(AtomicBool::new(false))),
    );

    let operation_id = "garden-plan:A";
    context_store
        .create_context("A", operation_id, serde_json::Value::Null, ContextType::Ephemeral)
        .await;

    let original = serde_json::json!({"summary": "draft"});
    let first_reflection = agent.reflect(original.clone(), operation_id).await;
    assert_eq!(first_reflection.status, "error");

    let guidance = serde_json::json!({"fix": "add field X"});
    let refined = agent.refine(original, guidance, operation_id).await;
    assert_eq!(refined.status, "success");

    let second_reflection = agent.reflect(refined.output.unwrap(), operation_id).await;
    assert_eq!(second_reflection.status, "success");

    let key = format!("context:A:{}", operation_id);
    let ctx = context_store.get_context(&key).await.unwrap();
    assert_eq!(ctx.validation_history.len(), 2);
    assert!(!ctx.validation_history[0].success);
    assert!(ctx.validation_history[1].success);
    assert_eq!(ctx.refinement_history.len(), 1);
}
