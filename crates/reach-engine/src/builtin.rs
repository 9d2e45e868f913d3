// SPDX-License-Identifier: MIT OR Apache-2.0
//! Built-in capability handlers.

use crate::error::EngineError;
use crate::tool::{
    CapabilityRegistry, LlmClient, ProposalRecord, ProposalRequest, ToolHandler, ToolResult,
};
use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

/// `core.echo`: returns its inputs unchanged.
pub struct EchoHandler;

#[async_trait]
impl ToolHandler for EchoHandler {
    async fn handle(
        &self,
        _run_id: Uuid,
        inputs: &serde_json::Value,
    ) -> Result<ToolResult, EngineError> {
        Ok(ToolResult {
            output: inputs.clone(),
            ..ToolResult::default()
        })
    }
}

/// `core.checksum`: returns the canonical hash of its inputs.
pub struct ChecksumHandler;

#[async_trait]
impl ToolHandler for ChecksumHandler {
    async fn handle(
        &self,
        _run_id: Uuid,
        inputs: &serde_json::Value,
    ) -> Result<ToolResult, EngineError> {
        let hash = reach_hash::hash_canonical(inputs)?;
        Ok(ToolResult {
            output: serde_json::json!({
                "alg": reach_hash::HASH_ALG,
                "hash": hash,
            }),
            ..ToolResult::default()
        })
    }
}

/// `llm.propose`: requests a structured proposal from the provider,
/// records it verbatim, schema-validates it, and only then hands it on.
///
/// Inputs: `{schema, seed?}`. The provider temperature is pinned to zero,
/// but provider output is still treated as untrusted; the schema gate is
/// what makes adjudication deterministic.
pub struct LlmToolHandler {
    client: Arc<dyn LlmClient>,
}

impl LlmToolHandler {
    /// Wrap a provider client.
    #[must_use]
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ToolHandler for LlmToolHandler {
    async fn handle(
        &self,
        _run_id: Uuid,
        inputs: &serde_json::Value,
    ) -> Result<ToolResult, EngineError> {
        let schema = inputs
            .get("schema")
            .cloned()
            .ok_or_else(|| EngineError::Validation("llm.propose requires a schema".into()))?;
        let seed = inputs.get("seed").and_then(serde_json::Value::as_u64).unwrap_or(0);
        let request = ProposalRequest {
            schema: schema.clone(),
            seed,
            temperature: 0.0,
        };
        let proposal = self.client.propose(&request).await?;

        let validator = jsonschema::validator_for(&schema)
            .map_err(|e| EngineError::Validation(format!("invalid proposal schema: {e}")))?;
        if let Err(error) = validator.validate(&proposal) {
            return Err(EngineError::SchemaViolation {
                node_id: String::new(),
                message: error.to_string(),
            });
        }

        let schema_hash = reach_hash::hash_canonical(&schema)?;
        Ok(ToolResult {
            output: proposal.clone(),
            latency_ms: 0,
            token_usage: crate::tool::TokenUsage::default(),
            proposal: Some(ProposalRecord {
                schema_hash,
                seed,
                proposal,
            }),
        })
    }
}

/// Build the default registry: built-in handlers plus, when a provider is
/// configured, the LLM mediation handler.
#[must_use]
pub fn builtin_registry(llm: Option<Arc<dyn LlmClient>>) -> CapabilityRegistry {
    let mut registry = CapabilityRegistry::new();
    registry.register("core.echo", EchoHandler);
    registry.register("core.checksum", ChecksumHandler);
    if let Some(client) = llm {
        registry.register("llm.propose", LlmToolHandler::new(client));
    }
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct CannedLlm(serde_json::Value);

    #[async_trait]
    impl LlmClient for CannedLlm {
        async fn propose(
            &self,
            _request: &ProposalRequest,
        ) -> Result<serde_json::Value, EngineError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn echo_returns_inputs() {
        let result = EchoHandler
            .handle(Uuid::nil(), &json!({"msg": "hi"}))
            .await
            .unwrap();
        assert_eq!(result.output, json!({"msg": "hi"}));
        assert!(result.proposal.is_none());
    }

    #[tokio::test]
    async fn checksum_matches_canonical_hash() {
        let inputs = json!({"environment": "production", "action": "deploy"});
        let result = ChecksumHandler.handle(Uuid::nil(), &inputs).await.unwrap();
        assert_eq!(
            result.output["hash"],
            "165b836d9d6e803d5ce1bb8b7a01437ff68928f549887360cf13a0d551a66e85"
        );
        assert_eq!(result.output["alg"], reach_hash::HASH_ALG);
    }

    #[tokio::test]
    async fn llm_handler_records_valid_proposal() {
        let llm = Arc::new(CannedLlm(json!({"answer": 42})));
        let handler = LlmToolHandler::new(llm);
        let inputs = json!({
            "schema": {
                "type": "object",
                "properties": {"answer": {"type": "integer"}},
                "required": ["answer"]
            },
            "seed": 7
        });
        let result = handler.handle(Uuid::nil(), &inputs).await.unwrap();
        let record = result.proposal.unwrap();
        assert_eq!(record.seed, 7);
        assert_eq!(record.proposal, json!({"answer": 42}));
        assert_eq!(result.output, json!({"answer": 42}));
    }

    #[tokio::test]
    async fn llm_handler_rejects_schema_violation() {
        let llm = Arc::new(CannedLlm(json!({"answer": "not a number"})));
        let handler = LlmToolHandler::new(llm);
        let inputs = json!({
            "schema": {
                "type": "object",
                "properties": {"answer": {"type": "integer"}},
                "required": ["answer"]
            }
        });
        let err = handler.handle(Uuid::nil(), &inputs).await.unwrap_err();
        assert!(matches!(err, EngineError::SchemaViolation { .. }));
    }

    #[tokio::test]
    async fn registry_gates_llm_on_configuration() {
        let with = builtin_registry(Some(Arc::new(CannedLlm(json!(null)))));
        assert!(with.contains("llm.propose"));
        let without = builtin_registry(None);
        assert!(!without.contains("llm.propose"));
        assert!(without.contains("core.echo"));
        assert!(without.contains("core.checksum"));
    }
}
