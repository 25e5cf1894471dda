//! Error taxonomy for the orchestration core.
//!
//! Every failure that crosses a component boundary carries one of the
//! [`ErrorKind`] values below. The kind determines propagation policy
//! (retried internally, surfaced immediately, left to the caller, ...) and is
//! what callers should branch on, not the specific error variant.
use thiserror::Error;

/// Coarse category every error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Temporary I/O or capability hiccup. Retried within the component.
    TransientFailure,
    /// Size/quota/memory limit exceeded. Surfaced immediately, emits an alert.
    ResourceExhausted,
    /// Bounded wait elapsed. Caller may retry; task is cancelled cooperatively.
    Timeout,
    /// A circuit breaker refused the call. No retry; caller gets a canonical result.
    CircuitOpen,
    /// Candidate did not match schema. First-class return value, not exceptional.
    ValidationFailure,
    /// Version mismatch on a compare-and-set. Caller retries with a fresh read.
    StateConflict,
    /// Caller-supplied bad inputs. Fatal to the operation, never retried.
    ConfigurationError,
    /// Invariant violated. Component moves to FAILED, emits CRITICAL health.
    FatalInternal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::TransientFailure => "transient_failure",
            ErrorKind::ResourceExhausted => "resource_exhausted",
            ErrorKind::Timeout => "timeout",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::ValidationFailure => "validation_failure",
            ErrorKind::StateConflict => "state_conflict",
            ErrorKind::ConfigurationError => "configuration_error",
            ErrorKind::FatalInternal => "fatal_internal",
        };
        write!(f, "{}", s)
    }
}

/// User-visible failure envelope. Never carries a raw stack trace.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ErrorEnvelope {
    pub status: String,
    pub error: String,
    pub error_type: ErrorKind,
    pub request_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl ErrorEnvelope {
    pub fn new(error: impl Into<String>, error_type: ErrorKind, request_id: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            error: error.into(),
            error_type,
            request_id: request_id.into(),
            timestamp: chrono::Utc::now(),
        }
    }
}

/// Error type for the event bus (C1).
#[derive(Error, Debug, Clone)]
pub enum EventBusError {
    #[error("event bus is not running")]
    BusStopped,
    #[error("subscription not found: {0}")]
    SubscriptionNotFound(String),
    #[error("delivery timed out for subscriber {0}")]
    DeliveryTimeout(String),
}

impl EventBusError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EventBusError::BusStopped => ErrorKind::ConfigurationError,
            EventBusError::SubscriptionNotFound(_) => ErrorKind::ConfigurationError,
            EventBusError::DeliveryTimeout(_) => ErrorKind::Timeout,
        }
    }
}

pub type EventBusResult<T> = Result<T, EventBusError>;

/// Error type for the state store and its thin layers (C2-C5).
#[derive(Error, Debug, Clone)]
pub enum StateStoreError {
    #[error("key not found: {0}")]
    NotFound(String),
    #[error("version conflict on key {key}: expected {expected}, found {found}")]
    VersionConflict {
        key: String,
        expected: u64,
        found: u64,
    },
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("serialization error: {0}")]
    SerializationError(String),
    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),
    #[error("durable backing store error: {0}")]
    BackingStoreError(String),
}

impl StateStoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StateStoreError::NotFound(_) => ErrorKind::ConfigurationError,
            StateStoreError::VersionConflict { .. } => ErrorKind::StateConflict,
            StateStoreError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            StateStoreError::SerializationError(_) => ErrorKind::ConfigurationError,
            StateStoreError::SnapshotNotFound(_) => ErrorKind::ConfigurationError,
            StateStoreError::BackingStoreError(_) => ErrorKind::TransientFailure,
        }
    }
}

pub type StateStoreResult<T> = Result<T, StateStoreError>;

/// Error type for the circuit breaker registry (C7).
#[derive(Error, Debug, Clone)]
pub enum CircuitBreakerError {
    #[error("circuit '{0}' is open")]
    Open(String),
    #[error("circuit '{0}' not found")]
    NotFound(String),
    #[error("invalid dependency: registering {child} -> {parent} would create a cycle")]
    InvalidDependency { child: String, parent: String },
    #[error("failed to persist circuit breaker state: {0}")]
    Persistence(String),
}

impl CircuitBreakerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CircuitBreakerError::Open(_) => ErrorKind::CircuitOpen,
            CircuitBreakerError::NotFound(_) => ErrorKind::ConfigurationError,
            CircuitBreakerError::InvalidDependency { .. } => ErrorKind::ConfigurationError,
            CircuitBreakerError::Persistence(_) => ErrorKind::FatalInternal,
        }
    }
}

pub type CircuitBreakerResult<T> = Result<T, CircuitBreakerError>;

/// Error type for the memory tracker (C6).
#[derive(Error, Debug, Clone)]
pub enum MemoryTrackerError {
    #[error("component not registered: {0}")]
    ComponentNotRegistered(String),
    #[error("resource {resource_id} on {component_id} exceeds per-resource maximum: {size_mb:.2}MB > {max_mb:.2}MB")]
    LimitExceeded {
        component_id: String,
        resource_id: String,
        size_mb: f64,
        max_mb: f64,
    },
}

impl MemoryTrackerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MemoryTrackerError::ComponentNotRegistered(_) => ErrorKind::ConfigurationError,
            MemoryTrackerError::LimitExceeded { .. } => ErrorKind::ResourceExhausted,
        }
    }
}

pub type MemoryTrackerResult<T> = Result<T, MemoryTrackerError>;

/// Error type for the phase coordinator (C11).
#[derive(Error, Debug, Clone)]
pub enum PhaseError {
    #[error("phase not found: {0}")]
    NotFound(String),
    #[error("invalid phase transition: {0} -> {1}")]
    InvalidTransition(String, String),
    #[error("checkpoint not found: {0}")]
    CheckpointNotFound(String),
    #[error("nesting too deep: limit is {0}")]
    NestingTooDeep(u32),
    #[error("transition handler rejected the transition: {0}")]
    HandlerRejected(String),
}

impl PhaseError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PhaseError::NotFound(_) => ErrorKind::ConfigurationError,
            PhaseError::InvalidTransition(_, _) => ErrorKind::ConfigurationError,
            PhaseError::CheckpointNotFound(_) => ErrorKind::ConfigurationError,
            PhaseError::NestingTooDeep(_) => ErrorKind::ConfigurationError,
            PhaseError::HandlerRejected(_) => ErrorKind::FatalInternal,
        }
    }
}

pub type PhaseResult<T> = Result<T, PhaseError>;

/// Error type for the agent runtime (C10).
#[derive(Error, Debug, Clone)]
pub enum AgentRuntimeError {
    #[error("generation capability failed: {0}")]
    GenerationFailed(String),
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("circuit open for breaker '{0}'")]
    CircuitOpen(String),
    #[error("validation failed: {0}")]
    ValidationFailed(String),
    #[error("invalid agent state transition: {0} -> {1}")]
    InvalidStateTransition(String, String),
}

impl AgentRuntimeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentRuntimeError::GenerationFailed(_) => ErrorKind::TransientFailure,
            AgentRuntimeError::Timeout(_) => ErrorKind::Timeout,
            AgentRuntimeError::CircuitOpen(_) => ErrorKind::CircuitOpen,
            AgentRuntimeError::ValidationFailed(_) => ErrorKind::ValidationFailure,
            AgentRuntimeError::InvalidStateTransition(_, _) => ErrorKind::FatalInternal,
        }
    }
}

pub type AgentRuntimeResult<T> = Result<T, AgentRuntimeError>;

/// Top-level error used by the pipeline/orchestrator shell, unifying the
/// component-specific errors above.
#[derive(Error, Debug, Clone)]
pub enum CoreError {
    #[error(transparent)]
    EventBus(#[from] EventBusError),
    #[error(transparent)]
    StateStore(#[from] StateStoreError),
    #[error(transparent)]
    CircuitBreaker(#[from] CircuitBreakerError),
    #[error(transparent)]
    MemoryTracker(#[from] MemoryTrackerError),
    #[error(transparent)]
    Phase(#[from] PhaseError),
    #[error(transparent)]
    AgentRuntime(#[from] AgentRuntimeError),
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::EventBus(e) => e.kind(),
            CoreError::StateStore(e) => e.kind(),
            CoreError::CircuitBreaker(e) => e.kind(),
            CoreError::MemoryTracker(e) => e.kind(),
            CoreError::Phase(e) => e.kind(),
            CoreError::AgentRuntime(e) => e.kind(),
            CoreError::Configuration(_) => ErrorKind::ConfigurationError,
        }
    }

    /// Build the canonical error envelope returned to callers.
    pub fn to_envelope(&self, request_id: impl Into<String>) -> ErrorEnvelope {
        ErrorEnvelope::new(self.to_string(), self.kind(), request_id)
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_maps_circuit_open_correctly() {
        let err = CircuitBreakerError::Open("test".to_string());
        assert_eq!(err.kind(), ErrorKind::CircuitOpen);
    }

    #[test]
    fn envelope_never_exposes_debug_internals() {
        let err = CoreError::StateStore(StateStoreError::VersionConflict {
            key: "k".into(),
            expected: 1,
            found: 2,
        });
        let envelope = err.to_envelope("req-1");
        assert_eq!(envelope.error_type, ErrorKind::StateConflict);
        assert_eq!(envelope.status, "error");
        assert!(!envelope.error.contains("StateStoreError"));
    }
}
