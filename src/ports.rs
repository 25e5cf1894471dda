//! Pluggable capability traits the runtime calls through but never
//! implements concretely. A deployment wires in a vendor-specific text
//! generation backend, a schema validator, a prompt repository, and
//! optionally a durable backing store; everything here only depends on the
//! shape of the contract.
use async_trait::async_trait;
use std::collections::HashMap;
use uuid::Uuid;

use crate::state_store::StateEntry;

/// A single turn in a generation request.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct GenerationMessage {
    pub role: String,
    pub content: String,
}

/// Request shape passed to a [`TextGenerationCapability`].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct GenerationRequest {
    pub messages: Vec<GenerationMessage>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub metadata: HashMap<String, String>,
}

/// Response shape returned by a [`TextGenerationCapability`].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct GenerationResponse {
    pub content: String,
    pub finish_reason: String,
    pub usage: Option<HashMap<String, u32>>,
    /// Some capabilities report a soft failure inline (rate limit, content
    /// filter, partial completion) instead of returning `Err`. A present
    /// value here is treated the same as a capability-level error.
    #[serde(default)]
    pub error: Option<serde_json::Value>,
}

/// Agents call through this trait to produce candidate output. No concrete
/// vendor integration lives in this crate; callers supply one.
#[async_trait]
pub trait TextGenerationCapability: Send + Sync {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, anyhow::Error>;
}

/// Validates a candidate value against a named schema. Validation is a
/// first-class outcome, not an exception: failures carry a list of
/// human-readable reasons rather than aborting the caller.
#[async_trait]
pub trait SchemaValidator: Send + Sync {
    async fn validate(
        &self,
        schema_name: &str,
        candidate: &serde_json::Value,
    ) -> Result<ValidationOutcome, anyhow::Error>;
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub reasons: Vec<String>,
}

/// Supplies the prompt templates an agent fills in before calling the
/// generation capability. Kept separate from the agent runtime so prompt
/// content can be versioned and swapped independently of orchestration
/// logic.
#[async_trait]
pub trait PromptRepository: Send + Sync {
    async fn get_prompt(&self, name: &str) -> Result<String, anyhow::Error>;
}

/// Optional capability a deployment can wire in so [`crate::state_store::StateStore`]
/// snapshots survive process restarts. Entirely optional: the in-memory
/// store is fully functional without one.
#[async_trait]
pub trait DurableBackingStore: Send + Sync {
    async fn persist_snapshot(
        &self,
        handle: Uuid,
        entries: &HashMap<String, StateEntry>,
    ) -> Result<(), anyhow::Error>;

    async fn load_snapshot(&self, handle: Uuid) -> Result<Option<HashMap<String, StateEntry>>, anyhow::Error>;
}
