// SPDX-License-Identifier: MIT OR Apache-2.0
//! Kahn-ordered DAG execution against the event store.

use crate::error::EngineError;
use crate::state::RunState;
use crate::tool::ToolClient;
use crate::{
    EVENT_NODE_COMPLETED, EVENT_PROPOSAL_RECORDED, EVENT_RUN_COMPLETED, EVENT_RUN_FAILED,
    EVENT_RUN_STARTED,
};
use reach_core::{CancelToken, PackDag, PackManifest, Run, run_fingerprint};
use reach_store::Store;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// Everything the executor needs to run a pack.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// Run id; provided by the caller so delegation can pin it.
    pub run_id: Uuid,
    /// Owning tenant.
    pub tenant_id: String,
    /// The pack to execute.
    pub pack: PackManifest,
    /// Environment label recorded on the run.
    pub environment: String,
    /// Delegation hops, in order.
    pub federation_path: Vec<String>,
    /// Peer trust scores observed at execution time.
    pub trust_scores: BTreeMap<String, f64>,
}

/// The result of a completed run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// The run row, fingerprint included.
    pub run: Run,
    /// Event-log fingerprint.
    pub fingerprint: String,
    /// Final materialized state.
    pub state: RunState,
}

/// Topologically order a pack DAG.
///
/// Delegates to [`reach_core::dag::topo_order`]; see there for the ordering
/// contract (Kahn's algorithm, ties broken by node id code-point order).
///
/// # Errors
///
/// Returns [`EngineError::Validation`] for duplicate node ids, edges that
/// reference unknown nodes, or cycles.
pub fn topo_order(dag: &PackDag) -> Result<Vec<String>, EngineError> {
    reach_core::dag::topo_order(dag).map_err(|e| EngineError::Validation(e.message))
}

/// Executes pack DAGs and writes their event logs.
pub struct DagExecutor {
    store: Arc<Store>,
    tool_client: Arc<dyn ToolClient>,
}

impl DagExecutor {
    /// Create an executor over the given store and tool client.
    #[must_use]
    pub fn new(store: Arc<Store>, tool_client: Arc<dyn ToolClient>) -> Self {
        Self { store, tool_client }
    }

    /// Execute a pack to completion.
    ///
    /// Exactly one executor advances a given run (the job lease enforces
    /// this), which is what makes the run's event ids monotonic.
    ///
    /// On node failure the failure event is recorded and a structured error
    /// propagates to the scheduler; on cancellation no failure event is
    /// written.
    ///
    /// # Errors
    ///
    /// See [`EngineError`]; validation errors surface before any event is
    /// written.
    pub async fn execute(
        &self,
        request: ExecutionRequest,
        ctx: &CancelToken,
    ) -> Result<RunOutcome, EngineError> {
        ctx.ensure_live().map_err(|_| EngineError::Cancelled)?;
        let order = topo_order(&request.pack.dag)?;
        let nodes: BTreeMap<&str, &reach_core::PackNode> = request
            .pack
            .dag
            .nodes
            .iter()
            .map(|n| (n.id.as_str(), n))
            .collect();
        for node in request.pack.dag.nodes.iter() {
            if !self.tool_client.supports(&node.action) {
                return Err(EngineError::UnknownAction {
                    node_id: node.id.clone(),
                    action: node.action.clone(),
                });
            }
        }

        let run_id = request.run_id;
        let tenant = request.tenant_id.as_str();
        let pack_ref = format!("{}@{}", request.pack.name, request.pack.version);
        let run = Run {
            id: run_id,
            tenant_id: request.tenant_id.clone(),
            pack_ref: pack_ref.clone(),
            fingerprint: None,
            created_at: self.store.now(),
            environment: request.environment.clone(),
            federation_path: request.federation_path.clone(),
            trust_scores: request.trust_scores.clone(),
        };
        self.store.insert_run(&run, ctx)?;
        self.store.append_event(
            run_id,
            tenant,
            EVENT_RUN_STARTED,
            &json!({
                "pack_ref": pack_ref,
                "environment": request.environment,
                "node_count": order.len(),
            }),
            ctx,
        )?;

        let mut state = RunState::default();
        for node_id in &order {
            ctx.ensure_live().map_err(|_| EngineError::Cancelled)?;
            let node = nodes[node_id.as_str()];
            tracing::debug!(run = %run_id, node = %node_id, action = %node.action, "dispatching node");
            let result = match self
                .tool_client
                .invoke(run_id, &node.action, &node.inputs)
                .await
            {
                Ok(result) => result,
                Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
                Err(err) => {
                    self.store.append_event(
                        run_id,
                        tenant,
                        EVENT_RUN_FAILED,
                        &json!({
                            "node_id": node_id,
                            "error_kind": err.kind().code(),
                            "message": err.to_string(),
                        }),
                        ctx,
                    )?;
                    return Err(EngineError::NodeFailed {
                        node_id: node_id.clone(),
                        message: err.to_string(),
                    });
                }
            };

            if let Some(record) = &result.proposal {
                self.store.append_event(
                    run_id,
                    tenant,
                    EVENT_PROPOSAL_RECORDED,
                    &json!({
                        "node_id": node_id,
                        "schema_hash": record.schema_hash,
                        "seed": record.seed,
                        "proposal": record.proposal,
                        "alg": reach_hash::HASH_ALG,
                        "provenance_hash": reach_hash::hash_canonical(&record.proposal)?,
                    }),
                    ctx,
                )?;
            }
            let event = self.store.append_event(
                run_id,
                tenant,
                EVENT_NODE_COMPLETED,
                &json!({
                    "node_id": node_id,
                    "action": node.action,
                    "output": result.output,
                    "latency_ms": result.latency_ms,
                    "token_usage": {
                        "prompt": result.token_usage.prompt,
                        "completion": result.token_usage.completion,
                    },
                }),
                ctx,
            )?;
            state.apply(&event.to_record());
        }

        let completed = self.store.append_event(
            run_id,
            tenant,
            EVENT_RUN_COMPLETED,
            &json!({
                "node_count": order.len(),
                "latency_ms": state.latency_ms,
                "token_usage": {
                    "prompt": state.token_usage.prompt,
                    "completion": state.token_usage.completion,
                },
            }),
            ctx,
        )?;
        state.apply(&completed.to_record());

        let records: Vec<_> = self
            .store
            .list_events(run_id, 0, ctx)?
            .iter()
            .map(reach_core::Event::to_record)
            .collect();
        let fingerprint = run_fingerprint(run_id, &records)?;
        self.store.set_run_fingerprint(run_id, &fingerprint, ctx)?;
        tracing::info!(run = %run_id, fingerprint = %fingerprint, "run completed");

        let mut run = run;
        run.fingerprint = Some(fingerprint.clone());
        Ok(RunOutcome {
            run,
            fingerprint,
            state,
        })
    }
}
