//! Agent lifecycle state and its deterministic mapping onto the coarser
//! resource state every health/monitoring consumer actually cares about.
use serde::{Deserialize, Serialize};

/// An agent's fine-grained lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentState {
    Ready,
    Processing,
    Validating,
    FailedValidation,
    Complete,
    Error,
    Coordinating,
    Clarifying,
}

/// The coarse state every external observer (HealthTracker, SystemMonitor)
/// reasons about. Several `AgentState`s map onto the same `ResourceState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceState {
    Initializing,
    Active,
    Paused,
    Failed,
    Terminated,
}

impl AgentState {
    /// Deterministic map (§3): every `AgentState` has exactly one
    /// `ResourceState`, independent of history.
    pub fn resource_state(&self) -> ResourceState {
        match self {
            AgentState::Ready => ResourceState::Initializing,
            AgentState::Processing => ResourceState::Active,
            AgentState::Validating => ResourceState::Active,
            AgentState::Coordinating => ResourceState::Active,
            AgentState::Clarifying => ResourceState::Paused,
            AgentState::FailedValidation => ResourceState::Failed,
            AgentState::Error => ResourceState::Failed,
            AgentState::Complete => ResourceState::Terminated,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentState::Complete)
    }

    /// Valid next states from the current one. `Error` is reachable from
    /// everywhere (any invariant violation can force it); `Ready` is the
    /// only way back out of `Error`, representing a fresh operation.
    pub fn can_transition_to(&self, next: AgentState) -> bool {
        use AgentState::*;
        if next == Error {
            return true;
        }
        match self {
            Ready => matches!(next, Processing),
            Processing => matches!(next, Validating | Coordinating | Complete),
            Validating => matches!(next, Complete | FailedValidation),
            FailedValidation => matches!(next, Processing | Clarifying),
            Coordinating => matches!(next, Processing | Complete),
            Clarifying => matches!(next, Processing),
            Complete => false,
            Error => matches!(next, Ready),
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            AgentState::Ready => "initialized, awaiting first operation",
            AgentState::Processing => "running the generation capability",
            AgentState::Validating => "checking output against schema",
            AgentState::FailedValidation => "output failed validation, awaiting refinement",
            AgentState::Complete => "operation finished successfully",
            AgentState::Error => "operation failed",
            AgentState::Coordinating => "handing off to the next agent in sequence",
            AgentState::Clarifying => "awaiting an answer to a clarifying question",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_is_deterministic_for_every_state() {
        assert_eq!(AgentState::Ready.resource_state(), ResourceState::Initializing);
        assert_eq!(AgentState::Processing.resource_state(), ResourceState::Active);
        assert_eq!(AgentState::Validating.resource_state(), ResourceState::Active);
        assert_eq!(AgentState::Coordinating.resource_state(), ResourceState::Active);
        assert_eq!(AgentState::Clarifying.resource_state(), ResourceState::Paused);
        assert_eq!(AgentState::FailedValidation.resource_state(), ResourceState::Failed);
        assert_eq!(AgentState::Error.resource_state(), ResourceState::Failed);
        assert_eq!(AgentState::Complete.resource_state(), ResourceState::Terminated);
    }

    #[test]
    fn error_is_reachable_from_any_state() {
        for state in [
            AgentState::Ready,
            AgentState::Processing,
            AgentState::Validating,
            AgentState::FailedValidation,
            AgentState::Coordinating,
            AgentState::Clarifying,
        ] {
            assert!(state.can_transition_to(AgentState::Error));
        }
    }

    #[test]
    fn complete_is_terminal() {
        assert!(AgentState::Complete.is_terminal());
        assert!(!AgentState::Complete.can_transition_to(AgentState::Processing));
    }
}
