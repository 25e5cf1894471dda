//! Orchestrator shell (C13): sequences pipeline agents behind a phase,
//! gathers metrics, and drives refinement attempts when a stage's output
//! fails validation. Thin on purpose — all the hard state lives in
//! [`PhaseCoordinator`] and [`ReflectivePipeline`]; this just wires them
//! together the way a caller wires together a phase and its stage list.
use crate::events::Event;
use crate::events::EventType;
use crate::event_bus::EventBus;
use crate::errors::PhaseResult;
use crate::metrics_store::MetricsStore;
use crate::phase_coordinator::PhaseCoordinator;
use crate::reflective_pipeline::{stage_operation_id, PipelineOutcome, PipelineStage, ReflectivePipeline};
use std::collections::HashMap;
use std::sync::Arc;

/// Result of one top-level orchestrated run: the phase it ran under plus
/// the pipeline's outcome.
#[derive(Debug, Clone)]
pub struct OrchestratorRun {
    pub phase_id: String,
    pub outcome: PipelineOutcome,
}

pub struct Orchestrator {
    phase_coordinator: Arc<PhaseCoordinator>,
    pipeline: Arc<ReflectivePipeline>,
    event_bus: Arc<EventBus>,
    metrics: Arc<MetricsStore>,
}

impl Orchestrator {
    pub fn new(
        phase_coordinator: Arc<PhaseCoordinator>,
        pipeline: Arc<ReflectivePipeline>,
        event_bus: Arc<EventBus>,
        metrics: Arc<MetricsStore>,
    ) -> Self {
        Self {
            phase_coordinator,
            pipeline,
            event_bus,
            metrics,
        }
    }

    /// Create a phase, run every stage in order, and resolve the phase to
    /// COMPLETED or ABORTED depending on the pipeline's outcome.
    pub async fn run_pipeline(
        &self,
        phase_type: &str,
        stages: Vec<PipelineStage>,
    ) -> PhaseResult<OrchestratorRun> {
        let phase_id = self
            .phase_coordinator
            .initialize_phase(phase_type, serde_json::json!({ "stage_count": stages.len() }), None)
            .await?;
        self.phase_coordinator.start_phase(&phase_id, serde_json::Value::Null).await?;

        self.metrics
            .record_metric("orchestrator_pipeline_started", 1.0, None)
            .await;

        let outcome = self.pipeline.run(&phase_id, &stages).await;

        self.metrics
            .record_metric("orchestrator_stage_count", stages.len() as f64, None)
            .await;

        if outcome.succeeded() {
            let output = serde_json::to_value(&outcome.stage_outputs).unwrap_or(serde_json::Value::Null);
            self.phase_coordinator.complete_phase(&phase_id, output).await?;
        } else {
            let reason = outcome.error.clone().unwrap_or_else(|| "stage failed".to_string());
            self.phase_coordinator.abort_phase(&phase_id, &reason, false).await?;
        }

        let _ = self
            .event_bus
            .emit(Event::new(
                EventType::PipelineCompleted,
                "orchestrator",
                serde_json::json!({ "phase_id": phase_id, "status": outcome.status }),
            ))
            .await;

        Ok(OrchestratorRun { phase_id, outcome })
    }

    /// Drive a single refinement attempt for the stage at `failing_stage_index`
    /// per the validate-then-refine contract (§4.10's `refine`): the
    /// orchestrator supplies guidance derived from the failed reflection, the
    /// agent produces a corrected output, and the pipeline resumes downstream
    /// from the refined stage rather than restarting from the beginning.
    pub async fn refine_and_resume(
        &self,
        phase_id: &str,
        stages: &[PipelineStage],
        failing_stage_index: usize,
        guidance: serde_json::Value,
        prior_outputs: HashMap<String, serde_json::Value>,
    ) -> PipelineOutcome {
        let Some(stage) = stages.get(failing_stage_index) else {
            return PipelineOutcome {
                status: "failure".to_string(),
                stage_outputs: prior_outputs,
                failed_stage: None,
                error: Some("no such stage index".to_string()),
            };
        };

        let original_output = prior_outputs.get(&stage.name).cloned().unwrap_or(serde_json::Value::Null);
        let operation_id = stage_operation_id(phase_id, &stage.name);
        let refine_result = stage.agent.refine(original_output, guidance, &operation_id).await;

        let mut outputs = prior_outputs;
        if refine_result.status != "success" {
            return PipelineOutcome {
                status: "failure".to_string(),
                stage_outputs: outputs,
                failed_stage: Some(stage.name.clone()),
                error: refine_result.error,
            };
        }

        let refined_output = refine_result.output.unwrap_or(serde_json::Value::Null);
        self.phase_coordinator
            .record_phase_state(phase_id, &format!("{}:output", stage.name), refined_output.clone())
            .await;
        outputs.insert(stage.name.clone(), refined_output);

        self.pipeline
            .run_from(phase_id, stages, failing_stage_index + 1, outputs)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_runtime::AgentRuntime;
    use crate::circuit_breaker::CircuitBreakerRegistry;
    use crate::context_store::ContextStore;
    use crate::health::HealthTracker;
    use crate::ports::{GenerationMessage, GenerationRequest, GenerationResponse, TextGenerationCapability};
    use crate::reflective_pipeline::InputSelector;
    use crate::state_store::StateStore;
    use async_trait::async_trait;

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

    fn harness() -> (Orchestrator, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new());
        bus.start();
        let state_store = Arc::new(StateStore::new(bus.clone()));
        let phase_coordinator = Arc::new(PhaseCoordinator::new(state_store.clone(), bus.clone()));
        let pipeline = Arc::new(ReflectivePipeline::new(phase_coordinator.clone(), bus.clone()));
        let metrics = Arc::new(MetricsStore::new(state_store, bus.clone()));
        (
            Orchestrator::new(phase_coordinator, pipeline, bus.clone(), metrics),
            bus,
        )
    }

    fn agent(name: &str, bus: Arc<EventBus>) -> Arc<AgentRuntime> {
        let state_store = Arc::new(StateStore::new(bus.clone()));
        let context_store = Arc::new(ContextStore::new(state_store.clone(), bus.clone()));
        let metrics = Arc::new(MetricsStore::new(state_store.clone(), bus.clone()));
        let circuit_breakers = Arc::new(CircuitBreakerRegistry::new(bus.clone(), state_store));
        let health = Arc::new(HealthTracker::new(bus.clone()));
        Arc::new(AgentRuntime::new(name, bus, context_store, metrics, circuit_breakers, health, Arc::new(EchoCapability)))
    }

    fn passthrough_selector(key: Option<&'static str>) -> Arc<dyn InputSelector> {
        Arc::new(move |outputs: &HashMap<String, serde_json::Value>| {
            let content = key
                .and_then(|k| outputs.get(k))
                .cloned()
                .unwrap_or(serde_json::json!("seed"))
                .to_string();
            vec![GenerationMessage { role: "user".to_string(), content }]
        })
    }

    #[tokio::test]
    async fn three_stage_pipeline_matches_linear_happy_path() {
        let (orchestrator, bus) = harness();
        let stages = vec![
            PipelineStage { name: "A".to_string(), agent: agent("A", bus.clone()), input_selector: passthrough_selector(None), schema: None },
            PipelineStage { name: "B".to_string(), agent: agent("B", bus.clone()), input_selector: passthrough_selector(Some("A")), schema: None },
            PipelineStage { name: "C".to_string(), agent: agent("C", bus.clone()), input_selector: passthrough_selector(Some("B")), schema: None },
        ];

        let run = orchestrator.run_pipeline("garden-plan", stages).await.unwrap();
        assert!(run.outcome.succeeded());
        assert_eq!(run.outcome.stage_outputs.len(), 3);
    }

    struct AlwaysRejectingCapability;

    #[async_trait]
    impl TextGenerationCapability for AlwaysRejectingCapability {
        async fn generate(&self, _request: GenerationRequest) -> Result<GenerationResponse, anyhow::Error> {
            Err(anyhow::anyhow!("capability unavailable"))
        }
    }

    #[tokio::test]
    async fn refine_and_resume_continues_downstream_stages() {
        let (orchestrator, bus) = harness();
        let failing_agent = {
            let state_store = Arc::new(StateStore::new(bus.clone()));
            let context_store = Arc::new(ContextStore::new(state_store.clone(), bus.clone()));
            let metrics = Arc::new(MetricsStore::new(state_store.clone(), bus.clone()));
            let circuit_breakers = Arc::new(CircuitBreakerRegistry::new(bus.clone(), state_store));
            let health = Arc::new(HealthTracker::new(bus.clone()));
            Arc::new(AgentRuntime::new(
                "A",
                bus.clone(),
                context_store,
                metrics,
                circuit_breakers,
                health,
                Arc::new(AlwaysRejectingCapability),
            ))
        };

        let stages = vec![
            PipelineStage { name: "A".to_string(), agent: failing_agent, input_selector: passthrough_selector(None), schema: None },
            PipelineStage { name: "B".to_string(), agent: agent("B", bus.clone()), input_selector: passthrough_selector(Some("A")), schema: None },
        ];

        let phase_id = orchestrator
            .phase_coordinator
            .initialize_phase("garden-plan", serde_json::json!({}), None)
            .await
            .unwrap();
        orchestrator.phase_coordinator.start_phase(&phase_id, serde_json::Value::Null).await.unwrap();

        let mut prior = HashMap::new();
        prior.insert("A".to_string(), serde_json::json!({"draft": true}));

        let outcome = orchestrator
            .refine_and_resume(&phase_id, &stages, 0, serde_json::json!({"fix": "add field X"}), prior)
            .await;

        assert_eq!(outcome.failed_stage.as_deref(), Some("A".to_string()).as_deref());
        assert!(!outcome.succeeded());
    }
}
