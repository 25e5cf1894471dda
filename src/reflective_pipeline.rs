//! Generic sequential stage executor used by orchestrators (C12).
//!
//! Stages are (AgentRuntime, input-selector) pairs, grounded the same way
//! the teacher's notification router composes a `RetryConfig` with
//! exponential backoff around each send attempt: every stage gets its own
//! bounded number of attempts, each attempt bounded by a timeout, with
//! backoff between attempts.
use crate::agent_runtime::{AgentResult, AgentRuntime};
use crate::event_bus::EventBus;
use crate::events::{Event, EventType};
use crate::phase_coordinator::PhaseCoordinator;
use crate::ports::GenerationMessage;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Chooses the conversation fed to a stage's agent, given every upstream
/// stage's output recorded so far.
pub trait InputSelector: Send + Sync {
    fn select(&self, stage_outputs: &HashMap<String, serde_json::Value>) -> Vec<GenerationMessage>;
}

impl<F> InputSelector for F
where
    F: Fn(&HashMap<String, serde_json::Value>) -> Vec<GenerationMessage> + Send + Sync,
{
    fn select(&self, stage_outputs: &HashMap<String, serde_json::Value>) -> Vec<GenerationMessage> {
        (self)(stage_outputs)
    }
}

/// The operation_id a stage's `process_with_validation`/`refine` calls share
/// for a given phase run, so a later `refine` lands in the same
/// `AgentContext` that `process_with_validation` created.
pub fn stage_operation_id(phase_id: &str, stage_name: &str) -> String {
    format!("{}:{}", phase_id, stage_name)
}

pub struct PipelineStage {
    pub name: String,
    pub agent: Arc<AgentRuntime>,
    pub input_selector: Arc<dyn InputSelector>,
    pub schema: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub backoff_multiplier: f32,
    pub max_backoff: Duration,
    pub stage_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(200),
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs(10),
            stage_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let backoff = Duration::from_secs_f32(
            self.initial_backoff.as_secs_f32() * self.backoff_multiplier.powi(attempt as i32),
        );
        backoff.min(self.max_backoff)
    }
}

/// Standard failure descriptor returned when a stage exhausts its retries.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PipelineOutcome {
    pub status: String,
    pub stage_outputs: HashMap<String, serde_json::Value>,
    pub failed_stage: Option<String>,
    pub error: Option<String>,
}

impl PipelineOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == "success"
    }
}

pub struct ReflectivePipeline {
    phase_coordinator: Arc<PhaseCoordinator>,
    event_bus: Arc<EventBus>,
    retry_policy: RetryPolicy,
}

impl ReflectivePipeline {
    pub fn new(phase_coordinator: Arc<PhaseCoordinator>, event_bus: Arc<EventBus>) -> Self {
        Self {
            phase_coordinator,
            event_bus,
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Run every stage from the start, with no seeded upstream outputs.
    pub async fn run(&self, phase_id: &str, stages: &[PipelineStage]) -> PipelineOutcome {
        self.run_from(phase_id, stages, 0, HashMap::new()).await
    }

    /// Re-enter the pipeline at `start_index` with `seed_outputs` standing in
    /// for every stage before it — the refinement loop an orchestrator uses
    /// after a downstream failure: replay upstream results, retry forward.
    pub async fn run_from(
        &self,
        phase_id: &str,
        stages: &[PipelineStage],
        start_index: usize,
        seed_outputs: HashMap<String, serde_json::Value>,
    ) -> PipelineOutcome {
        let mut outputs = seed_outputs;

        for stage in stages.iter().skip(start_index) {
            self.emit_stage_event(EventType::StageStarted, phase_id, &stage.name).await;

            let attempt_result = self.run_stage_with_retries(phase_id, stage, &outputs).await;

            match attempt_result {
                Ok(result) => {
                    let output = result.output.clone().unwrap_or(serde_json::Value::Null);
                    self.phase_coordinator
                        .record_phase_state(phase_id, &format!("{}:output", stage.name), output.clone())
                        .await;
                    outputs.insert(stage.name.clone(), output);
                    self.emit_stage_event(EventType::StageCompleted, phase_id, &stage.name).await;
                }
                Err(result) => {
                    self.emit_stage_event(EventType::StageFailed, phase_id, &stage.name).await;
                    let outcome = PipelineOutcome {
                        status: "failure".to_string(),
                        stage_outputs: outputs,
                        failed_stage: Some(stage.name.clone()),
                        error: result.error,
                    };
                    self.emit_pipeline_completed(phase_id, &outcome).await;
                    return outcome;
                }
            }
        }

        let outcome = PipelineOutcome {
            status: "success".to_string(),
            stage_outputs: outputs,
            failed_stage: None,
            error: None,
        };
        self.emit_pipeline_completed(phase_id, &outcome).await;
        outcome
    }

    async fn run_stage_with_retries(
        &self,
        phase_id: &str,
        stage: &PipelineStage,
        outputs: &HashMap<String, serde_json::Value>,
    ) -> Result<AgentResult, AgentResult> {
        let mut attempt = 0;
        let operation_id = stage_operation_id(phase_id, &stage.name);
        loop {
            let conversation = stage.input_selector.select(outputs);
            let result = stage
                .agent
                .process_with_validation(
                    conversation,
                    stage.name.clone(),
                    stage.schema.clone(),
                    Some(phase_id.to_string()),
                    Some(operation_id.clone()),
                    None,
                    self.retry_policy.stage_timeout,
                )
                .await;

            if result.status == "success" {
                return Ok(result);
            }

            attempt += 1;
            if attempt >= self.retry_policy.max_retries {
                return Err(result);
            }
            warn!(stage = %stage.name, attempt, error = ?result.error, "stage attempt failed, retrying");
            tokio::time::sleep(self.retry_policy.backoff_for_attempt(attempt)).await;
        }
    }

    async fn emit_stage_event(&self, event_type: EventType, phase_id: &str, stage_name: &str) {
        let _ = self
            .event_bus
            .emit(Event::new(
                event_type,
                "reflective_pipeline",
                serde_json::json!({ "phase_id": phase_id, "stage": stage_name }),
            ))
            .await;
    }

    async fn emit_pipeline_completed(&self, phase_id: &str, outcome: &PipelineOutcome) {
        let _ = self
            .event_bus
            .emit(Event::new(
                EventType::PipelineCompleted,
                "reflective_pipeline",
                serde_json::json!({ "phase_id": phase_id, "status": outcome.status, "failed_stage": outcome.failed_stage }),
            ))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerRegistry;
    use crate::context_store::ContextStore;
    use crate::health::HealthTracker;
    use crate::metrics_store::MetricsStore;
    use crate::ports::{GenerationRequest, GenerationResponse, TextGenerationCapability};
    use crate::state_store::StateStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoCapability;

    #[async_trait]
    impl TextGenerationCapability for EchoCapability {
        async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, anyhow::Error> {
            Ok(GenerationResponse {
                content: request.messages.last().map(|m| m.content.clone()).unwrap_or_default(),
                finish_reason: "stop".to_string(),
                usage: None,
                error: None,
            })
        }
    }

    struct AlwaysFailCapability;

    #[async_trait]
    impl TextGenerationCapability for AlwaysFailCapability {
        async fn generate(&self, _request: GenerationRequest) -> Result<GenerationResponse, anyhow::Error> {
            Err(anyhow::anyhow!("capability unavailable"))
        }
    }

    fn harness() -> (Arc<PhaseCoordinator>, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new());
        bus.start();
        let state_store = Arc::new(StateStore::new(bus.clone()));
        let phase_coordinator = Arc::new(PhaseCoordinator::new(state_store, bus.clone()));
        (phase_coordinator, bus)
    }

    fn agent(name: &str, bus: Arc<EventBus>, generation: Arc<dyn TextGenerationCapability>) -> Arc<AgentRuntime> {
        let state_store = Arc::new(StateStore::new(bus.clone()));
        let context_store = Arc::new(ContextStore::new(state_store.clone(), bus.clone()));
        let metrics = Arc::new(MetricsStore::new(state_store.clone(), bus.clone()));
        let circuit_breakers = Arc::new(CircuitBreakerRegistry::new(bus.clone(), state_store));
        let health = Arc::new(HealthTracker::new(bus.clone()));
        Arc::new(AgentRuntime::new(name, bus, context_store, metrics, circuit_breakers, health, generation))
    }

    #[tokio::test]
    async fn two_stage_pipeline_chains_outputs() {
        let (pc, bus) = harness();
        let phase_id = pc.initialize_phase("pipeline", serde_json::json!({}), None).await.unwrap();
        pc.start_phase(&phase_id, serde_json::json!({})).await.unwrap();

        let stage1 = PipelineStage {
            name: "gather".to_string(),
            agent: agent("gather", bus.clone(), Arc::new(EchoCapability)),
            input_selector: Arc::new(|_: &HashMap<String, serde_json::Value>| {
                vec![GenerationMessage { role: "user".to_string(), content: "seed".to_string() }]
            }),
            schema: None,
        };
        let stage2 = PipelineStage {
            name: "summarize".to_string(),
            agent: agent("summarize", bus.clone(), Arc::new(EchoCapability)),
            input_selector: Arc::new(|outputs: &HashMap<String, serde_json::Value>| {
                vec![GenerationMessage {
                    role: "user".to_string(),
                    content: outputs.get("gather").cloned().unwrap_or_default().to_string(),
                }]
            }),
            schema: None,
        };

        let pipeline = ReflectivePipeline::new(pc, bus);
        let outcome = pipeline.run(&phase_id, &[stage1, stage2]).await;
        assert!(outcome.succeeded());
        assert!(outcome.stage_outputs.contains_key("gather"));
        assert!(outcome.stage_outputs.contains_key("summarize"));
    }

    #[tokio::test]
    async fn exhausted_retries_report_failed_stage() {
        let (pc, bus) = harness();
        let phase_id = pc.initialize_phase("pipeline", serde_json::json!({}), None).await.unwrap();
        pc.start_phase(&phase_id, serde_json::json!({})).await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let stage = PipelineStage {
            name: "flaky".to_string(),
            agent: agent("flaky", bus.clone(), Arc::new(AlwaysFailCapability)),
            input_selector: Arc::new(move |_: &HashMap<String, serde_json::Value>| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                vec![GenerationMessage { role: "user".to_string(), content: "x".to_string() }]
            }),
            schema: None,
        };

        let pipeline = ReflectivePipeline::new(pc, bus).with_retry_policy(RetryPolicy {
            max_retries: 2,
            initial_backoff: Duration::from_millis(1),
            backoff_multiplier: 1.0,
            max_backoff: Duration::from_millis(5),
            stage_timeout: Duration::from_secs(5),
        });

        let outcome = pipeline.run(&phase_id, &[stage]).await;
        assert!(!outcome.succeeded());
        assert_eq!(outcome.failed_stage.as_deref(), Some("flaky"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
