// SPDX-License-Identifier: MIT OR Apache-2.0
//! The mediated tool interface and the capability registry behind it.
//!
//! Every node action goes through a [`ToolClient`]. The default client is
//! [`RegistryToolClient`], which resolves actions against a
//! [`CapabilityRegistry`] populated at startup from built-in handlers plus
//! explicitly gated plugins. Nothing in the engine calls a tool directly.

use crate::error::EngineError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// Token counters aggregated into run state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Prompt-side tokens.
    pub prompt: u64,
    /// Completion-side tokens.
    pub completion: u64,
}

impl TokenUsage {
    /// Accumulate another usage sample.
    pub fn add(&mut self, other: TokenUsage) {
        self.prompt += other.prompt;
        self.completion += other.completion;
    }
}

/// A recorded AI proposal: the exact bytes the model produced, plus the
/// provenance inputs that requested it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalRecord {
    /// Canonical hash of the schema the proposal was requested against.
    pub schema_hash: String,
    /// Seed passed to the provider.
    pub seed: u64,
    /// The proposal, verbatim.
    pub proposal: serde_json::Value,
}

/// Result of a mediated tool invocation.
#[derive(Debug, Clone, Default)]
pub struct ToolResult {
    /// Output written to `results[node_id]`.
    pub output: serde_json::Value,
    /// Latency reported by the handler. Deterministic handlers report
    /// deterministic values.
    pub latency_ms: u64,
    /// Token counters reported by the handler.
    pub token_usage: TokenUsage,
    /// Present when the handler consulted an AI provider; the executor
    /// records it as a `proposal_recorded` event before adjudication.
    pub proposal: Option<ProposalRecord>,
}

/// A single named capability.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Execute the action against the given inputs.
    async fn handle(
        &self,
        run_id: Uuid,
        inputs: &serde_json::Value,
    ) -> Result<ToolResult, EngineError>;
}

/// Mediates every node action of a run.
#[async_trait]
pub trait ToolClient: Send + Sync {
    /// Whether the action resolves to a handler.
    fn supports(&self, action: &str) -> bool;

    /// Dispatch an action.
    async fn invoke(
        &self,
        run_id: Uuid,
        action: &str,
        inputs: &serde_json::Value,
    ) -> Result<ToolResult, EngineError>;
}

/// The request shape of the LLM provider contract:
/// `{schema, seed, temperature} → json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalRequest {
    /// JSON schema the proposal must satisfy.
    pub schema: serde_json::Value,
    /// Provider seed.
    pub seed: u64,
    /// Always zero; the provider is still not trusted to be deterministic.
    pub temperature: f64,
}

/// The LLM provider seam. The engine consumes only this contract; provider
/// output is untrusted input and is schema-validated before adjudication.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Request a structured proposal.
    async fn propose(&self, request: &ProposalRequest) -> Result<serde_json::Value, EngineError>;
}

/// Registry of `name → handler`, immutable once execution begins.
#[derive(Default)]
pub struct CapabilityRegistry {
    handlers: BTreeMap<String, Arc<dyn ToolHandler>>,
}

impl CapabilityRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a built-in handler, replacing any previous entry.
    pub fn register(&mut self, name: impl Into<String>, handler: impl ToolHandler + 'static) {
        self.handlers.insert(name.into(), Arc::new(handler));
    }

    /// Register a plugin handler, gated by the explicitly allowed capability
    /// names.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Validation`] if the capability is not in the
    /// allow list.
    pub fn register_plugin(
        &mut self,
        name: impl Into<String>,
        handler: impl ToolHandler + 'static,
        allowed: &[String],
    ) -> Result<(), EngineError> {
        let name = name.into();
        if !allowed.iter().any(|cap| cap == &name) {
            return Err(EngineError::Validation(format!(
                "plugin capability {name:?} is not in the allow list"
            )));
        }
        self.handlers.insert(name, Arc::new(handler));
        Ok(())
    }

    /// Look up a handler by action name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.handlers.get(name).cloned()
    }

    /// Whether an action name is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Sorted list of registered capability names.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }
}

/// [`ToolClient`] backed by a [`CapabilityRegistry`].
pub struct RegistryToolClient {
    registry: CapabilityRegistry,
}

impl RegistryToolClient {
    /// Wrap a populated registry.
    #[must_use]
    pub fn new(registry: CapabilityRegistry) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl ToolClient for RegistryToolClient {
    fn supports(&self, action: &str) -> bool {
        self.registry.contains(action)
    }

    async fn invoke(
        &self,
        run_id: Uuid,
        action: &str,
        inputs: &serde_json::Value,
    ) -> Result<ToolResult, EngineError> {
        let Some(handler) = self.registry.get(action) else {
            return Err(EngineError::UnknownAction {
                node_id: String::new(),
                action: action.to_string(),
            });
        };
        handler.handle(run_id, inputs).await
    }
}
