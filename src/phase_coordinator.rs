//! Phase lifecycle, nested execution, checkpoints, and transition handlers (C11).
//!
//! Modeled the way the teacher's workflow state machine is: a small, total
//! transition function plus a registered handler invoked exactly once per
//! transition. Unlike the teacher's machine, which holds one workflow per
//! instance, a single `PhaseCoordinator` owns every phase in the process;
//! each phase gets its own lock so operations on one phase never block
//! operations on another.
use crate::errors::{PhaseError, PhaseResult};
use crate::event_bus::EventBus;
use crate::events::{Event, EventType};
use crate::state_store::{ResourceType, StateEntry, StateStore};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::warn;
use uuid::Uuid;

const DEFAULT_MAX_NESTING_DEPTH: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PhaseState {
    Ready,
    Running,
    Paused,
    Completed,
    Aborted,
    Failed,
}

impl PhaseState {
    pub fn can_transition_to(&self, target: PhaseState) -> bool {
        use PhaseState::*;
        matches!(
            (self, target),
            (Ready, Running)
                | (Running, Completed)
                | (Running, Paused)
                | (Running, Aborted)
                | (Running, Failed)
                | (Paused, Running)
                | (Paused, Aborted)
                | (Paused, Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PhaseState::Completed | PhaseState::Aborted | PhaseState::Failed)
    }
}

/// Invoked exactly once per `(from_type, to_type)` transition across every
/// phase of that type pairing. A failing handler rejects the transition and
/// forces the source phase to FAILED.
#[async_trait::async_trait]
pub trait TransitionHandler: Send + Sync {
    async fn handle(&self, phase: &PhaseSnapshot) -> PhaseResult<()>;
}

/// Read-only view of a phase passed to transition handlers and returned to
/// callers; the live `PhaseContext` stays inside the coordinator.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PhaseSnapshot {
    pub phase_id: String,
    pub phase_type: String,
    pub parent_id: Option<String>,
    pub state: PhaseState,
    pub config: serde_json::Value,
    pub input: Option<serde_json::Value>,
    pub output: Option<serde_json::Value>,
    pub depth: u32,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

struct PhaseContext {
    phase_id: String,
    phase_type: String,
    parent_id: Option<String>,
    state: PhaseState,
    config: serde_json::Value,
    input: Option<serde_json::Value>,
    output: Option<serde_json::Value>,
    depth: u32,
    created_at: chrono::DateTime<chrono::Utc>,
    checkpoints: Vec<Uuid>,
}

impl PhaseContext {
    fn snapshot(&self) -> PhaseSnapshot {
        PhaseSnapshot {
            phase_id: self.phase_id.clone(),
            phase_type: self.phase_type.clone(),
            parent_id: self.parent_id.clone(),
            state: self.state,
            config: self.config.clone(),
            input: self.input.clone(),
            output: self.output.clone(),
            depth: self.depth,
            created_at: self.created_at,
        }
    }

    fn state_prefix(&self) -> String {
        format!("phase:{}:", self.phase_id)
    }
}

struct Checkpoint {
    entries: HashMap<String, StateEntry>,
    input: Option<serde_json::Value>,
    output: Option<serde_json::Value>,
}

/// Process-wide phase registry. Every phase has its own `Mutex` so
/// operations on distinct phases never contend; the registry-membership map
/// only guards phase creation/lookup.
pub struct PhaseCoordinator {
    state_store: Arc<StateStore>,
    event_bus: Arc<EventBus>,
    phases: DashMap<String, Arc<Mutex<PhaseContext>>>,
    checkpoints: DashMap<Uuid, Checkpoint>,
    handlers: RwLock<HashMap<(String, String), Arc<dyn TransitionHandler>>>,
    max_nesting_depth: u32,
}

impl PhaseCoordinator {
    pub fn new(state_store: Arc<StateStore>, event_bus: Arc<EventBus>) -> Self {
        Self {
            state_store,
            event_bus,
            phases: DashMap::new(),
            checkpoints: DashMap::new(),
            handlers: RwLock::new(HashMap::new()),
            max_nesting_depth: DEFAULT_MAX_NESTING_DEPTH,
        }
    }

    pub fn with_max_nesting_depth(mut self, depth: u32) -> Self {
        self.max_nesting_depth = depth;
        self
    }

    /// `from_state`/`to_state` are the lifecycle state names (e.g. `"READY"`,
    /// `"RUNNING"`), not a phase's business type — a handler fires once for
    /// every phase making that lifecycle transition, regardless of type.
    pub async fn register_transition_handler(
        &self,
        from_state: &str,
        to_state: &str,
        handler: Arc<dyn TransitionHandler>,
    ) {
        self.handlers
            .write()
            .await
            .insert((from_state.to_string(), to_state.to_string()), handler);
    }

    pub async fn initialize_phase(
        &self,
        phase_type: &str,
        config: serde_json::Value,
        parent_id: Option<String>,
    ) -> PhaseResult<String> {
        let depth = match &parent_id {
            Some(pid) => {
                let parent = self.get_phase(pid)?;
                let parent = parent.lock().await;
                parent.depth + 1
            }
            None => 0,
        };
        if depth > self.max_nesting_depth {
            return Err(PhaseError::NestingTooDeep(self.max_nesting_depth));
        }

        let phase_id = Uuid::new_v4().to_string();
        let ctx = PhaseContext {
            phase_id: phase_id.clone(),
            phase_type: phase_type.to_string(),
            parent_id,
            state: PhaseState::Ready,
            config,
            input: None,
            output: None,
            depth,
            created_at: chrono::Utc::now(),
            checkpoints: Vec::new(),
        };
        self.phases.insert(phase_id.clone(), Arc::new(Mutex::new(ctx)));
        Ok(phase_id)
    }

    fn get_phase(&self, phase_id: &str) -> PhaseResult<Arc<Mutex<PhaseContext>>> {
        self.phases
            .get(phase_id)
            .map(|e| e.clone())
            .ok_or_else(|| PhaseError::NotFound(phase_id.to_string()))
    }

    async fn transition(&self, phase_id: &str, target: PhaseState) -> PhaseResult<PhaseSnapshot> {
        let phase = self.get_phase(phase_id)?;
        let mut guard = phase.lock().await;

        if !guard.state.can_transition_to(target) {
            return Err(PhaseError::InvalidTransition(state_key(guard.state), state_key(target)));
        }
        let phase_type = guard.phase_type.clone();
        let from_state = guard.state;

        let handler = {
            let handlers = self.handlers.read().await;
            handlers
                .get(&(state_key(from_state), state_key(target)))
                .cloned()
        };

        if let Some(handler) = handler {
            let snapshot = guard.snapshot();
            if handler.handle(&snapshot).await.is_err() {
                guard.state = PhaseState::Failed;
                let failed_snapshot = guard.snapshot();
                drop(guard);
                self.emit_transition(&phase_type, &failed_snapshot).await;
                return Err(PhaseError::HandlerRejected(phase_id.to_string()));
            }
        }

        guard.state = target;
        let snapshot = guard.snapshot();
        drop(guard);
        self.emit_transition(&phase_type, &snapshot).await;
        Ok(snapshot)
    }

    async fn emit_transition(&self, phase_type: &str, snapshot: &PhaseSnapshot) {
        let _ = self
            .event_bus
            .emit(Event::new(
                EventType::PhaseStateChanged,
                "phase_coordinator",
                serde_json::json!({
                    "phase_id": snapshot.phase_id,
                    "phase_type": phase_type,
                    "state": snapshot.state,
                }),
            ))
            .await;
    }

    pub async fn start_phase(&self, phase_id: &str, input: serde_json::Value) -> PhaseResult<PhaseSnapshot> {
        {
            let phase = self.get_phase(phase_id)?;
            let mut guard = phase.lock().await;
            guard.input = Some(input);
        }
        self.transition(phase_id, PhaseState::Running).await
    }

    pub async fn complete_phase(&self, phase_id: &str, output: serde_json::Value) -> PhaseResult<PhaseSnapshot> {
        {
            let phase = self.get_phase(phase_id)?;
            let mut guard = phase.lock().await;
            guard.output = Some(output);
        }
        self.transition(phase_id, PhaseState::Completed).await
    }

    pub async fn pause_phase(&self, phase_id: &str) -> PhaseResult<PhaseSnapshot> {
        self.transition(phase_id, PhaseState::Paused).await
    }

    pub async fn resume_phase(&self, phase_id: &str) -> PhaseResult<PhaseSnapshot> {
        self.transition(phase_id, PhaseState::Running).await
    }

    /// Abort is terminal. If `rollback` is set and a checkpoint exists, the
    /// phase's captured keys are restored before the ABORTED transition is
    /// recorded.
    pub async fn abort_phase(&self, phase_id: &str, reason: &str, rollback: bool) -> PhaseResult<PhaseSnapshot> {
        let newest_checkpoint = {
            let phase = self.get_phase(phase_id)?;
            let guard = phase.lock().await;
            guard.checkpoints.last().copied()
        };
        if rollback {
            if let Some(checkpoint_id) = newest_checkpoint {
                self.rollback_to_checkpoint(phase_id, checkpoint_id).await?;
            }
        }
        warn!(phase_id, reason, "phase aborted");
        self.transition(phase_id, PhaseState::Aborted).await
    }

    /// Capture the current StateStore keys under this phase's prefix, plus
    /// its running input/output, as a restorable point.
    pub async fn create_checkpoint(&self, phase_id: &str) -> PhaseResult<Uuid> {
        let phase = self.get_phase(phase_id)?;
        let mut guard = phase.lock().await;
        let prefix = guard.state_prefix();
        let entries = self.state_store.get_states_by_prefix(&prefix).await;
        let checkpoint_id = Uuid::new_v4();
        self.checkpoints.insert(
            checkpoint_id,
            Checkpoint {
                entries,
                input: guard.input.clone(),
                output: guard.output.clone(),
            },
        );
        guard.checkpoints.push(checkpoint_id);
        let _ = self
            .event_bus
            .emit(Event::new(
                EventType::CheckpointCreated,
                "phase_coordinator",
                serde_json::json!({ "phase_id": phase_id, "checkpoint_id": checkpoint_id.to_string() }),
            ))
            .await;
        Ok(checkpoint_id)
    }

    /// Restore the captured keys for `checkpoint_id`. All keys are written
    /// back before this returns; a concurrent `create_checkpoint` on the same
    /// phase is serialized behind the phase lock, not this call.
    pub async fn rollback_to_checkpoint(&self, phase_id: &str, checkpoint_id: Uuid) -> PhaseResult<()> {
        let phase = self.get_phase(phase_id)?;
        let mut guard = phase.lock().await;
        if !guard.checkpoints.contains(&checkpoint_id) {
            return Err(PhaseError::CheckpointNotFound(checkpoint_id.to_string()));
        }
        let checkpoint = self
            .checkpoints
            .get(&checkpoint_id)
            .ok_or_else(|| PhaseError::CheckpointNotFound(checkpoint_id.to_string()))?;

        for (key, entry) in checkpoint.entries.iter() {
            let _ = self
                .state_store
                .set_state(key, entry.value.clone(), entry.resource_type, Some(entry.metadata.clone()))
                .await;
        }
        guard.input = checkpoint.input.clone();
        guard.output = checkpoint.output.clone();
        Ok(())
    }

    /// Run a child phase synchronously from the parent's perspective. The
    /// parent remains RUNNING throughout; the child goes through its own
    /// full lifecycle. Nested phases inherit the parent's state prefix by
    /// virtue of sharing the same StateStore instance and keying convention.
    pub async fn coordinate_nested_execution(
        &self,
        parent_id: &str,
        target_type: &str,
        input: serde_json::Value,
        config: serde_json::Value,
    ) -> PhaseResult<serde_json::Value> {
        let child_id = self
            .initialize_phase(target_type, config, Some(parent_id.to_string()))
            .await?;
        self.start_phase(&child_id, input).await?;

        let phase = self.get_phase(&child_id)?;
        let output = {
            let guard = phase.lock().await;
            guard.output.clone()
        };
        let output = output.unwrap_or(serde_json::Value::Null);
        self.complete_phase(&child_id, output.clone()).await?;
        Ok(output)
    }

    pub async fn get_snapshot(&self, phase_id: &str) -> PhaseResult<PhaseSnapshot> {
        let phase = self.get_phase(phase_id)?;
        let guard = phase.lock().await;
        Ok(guard.snapshot())
    }

    /// Record an in-progress stage output against this phase's keyspace.
    /// Used by the reflective pipeline to persist per-stage results under
    /// the phase's conventional prefix.
    pub async fn record_phase_state(&self, phase_id: &str, suffix: &str, value: serde_json::Value) {
        let key = format!("phase:{}:{}", phase_id, suffix);
        let _ = self.state_store.set_state(&key, value, ResourceType::State, None).await;
    }
}

fn state_key(state: PhaseState) -> String {
    serde_json::to_value(state)
        .ok()
        .and_then(|v| v.as_str().map(|s| s.to_string()))
        .unwrap_or_default()
}
