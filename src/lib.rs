// Core runtime substrate for multi-agent orchestration: event bus, state
// store, reliability layer, agent contract, phase lifecycle, and the
// reflective pipeline / orchestrator shell built on top of them.

pub mod agent_runtime;
pub mod agent_state;
pub mod cache_store;
pub mod circuit_breaker;
pub mod config;
pub mod config_loader;
pub mod config_watcher;
pub mod context_store;
pub mod errors;
pub mod event_bus;
pub mod events;
pub mod health;
pub mod memory_tracker;
pub mod metrics_store;
pub mod orchestrator;
pub mod phase_coordinator;
pub mod ports;
pub mod reflective_pipeline;
pub mod state_store;
pub mod system_monitor;

pub use errors::{
    AgentRuntimeError, AgentRuntimeResult, CircuitBreakerError, CircuitBreakerResult, CoreError,
    CoreResult, ErrorEnvelope, ErrorKind, EventBusError, EventBusResult, MemoryTrackerError,
    MemoryTrackerResult, PhaseError, PhaseResult, StateStoreError, StateStoreResult,
};

pub use events::{Event, EventType};

pub use event_bus::{EventBus, EventHandler, OverflowPolicy, SubscribeOptions};

pub use state_store::{ResourceType, StateEntry, StateStore};

pub use ports::{
    DurableBackingStore, GenerationMessage, GenerationRequest, GenerationResponse,
    PromptRepository, SchemaValidator, TextGenerationCapability, ValidationOutcome,
};

pub use metrics_store::{MetricSample, MetricsStore};

pub use cache_store::{CacheStore, CRITICAL_THRESHOLD_MB, MAX_ALLOWED_MB, WARNING_THRESHOLD_MB};

pub use context_store::{
    AgentContext, ContextStore, ContextType, RefinementRecord, ValidationRecord,
    DEFAULT_EPHEMERAL_TTL,
};

pub use memory_tracker::{ComponentThresholds, MemoryTracker};

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState, ExecuteError,
};

pub use health::{HealthState, HealthStatus, HealthTracker};

pub use system_monitor::SystemMonitor;

pub use agent_state::{AgentState, ResourceState};

pub use agent_runtime::{AgentResult, AgentRuntime, GuidelineUpdateResult, ReadinessResult, VerificationResult};

pub use phase_coordinator::{PhaseCoordinator, PhaseSnapshot, PhaseState, TransitionHandler};

pub use reflective_pipeline::{InputSelector, PipelineOutcome, PipelineStage, ReflectivePipeline, RetryPolicy};

pub use orchestrator::{Orchestrator, OrchestratorRun};

pub use config::{ConfigManager, CoreConfig, LoggingConfig, RuntimeConfig, StorageConfig};

pub use config_loader::{ensure_config_directories, init_config, ConfigDiscoveryStrategy, ConfigLoader, ConfigValidator};

pub use config_watcher::{ConfigChangeEvent, ConfigChangeListener, ConfigWatcher, HotReloadManager};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
