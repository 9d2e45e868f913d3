// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = "Deterministic DAG execution through a mediated tool interface."]
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! reach-engine
//!
//! Executes pack DAGs node by node in Kahn order (ties broken by node id),
//! dispatching every action through a [`ToolClient`] and folding results
//! into indexed run state. Two executions of the same pack with the same
//! inputs, tool client, and clock produce identical event logs and therefore
//! the same fingerprint. AI proposals are recorded verbatim as events and
//! are read back, never re-issued, during replay.

mod builtin;
mod error;
mod executor;
mod state;
mod tool;

pub use builtin::{ChecksumHandler, EchoHandler, LlmToolHandler, builtin_registry};
pub use error::EngineError;
pub use executor::{DagExecutor, ExecutionRequest, RunOutcome, topo_order};
pub use state::RunState;
pub use tool::{
    CapabilityRegistry, LlmClient, ProposalRecord, ProposalRequest, RegistryToolClient,
    TokenUsage, ToolClient, ToolHandler, ToolResult,
};

/// Event type for the first event of every run.
pub const EVENT_RUN_STARTED: &str = "run_started";
/// Event type recording a node's result.
pub const EVENT_NODE_COMPLETED: &str = "node_completed";
/// Event type recording a verbatim AI proposal before adjudication.
pub const EVENT_PROPOSAL_RECORDED: &str = "proposal_recorded";
/// Event type for the terminal event of a successful run.
pub const EVENT_RUN_COMPLETED: &str = "run_completed";
/// Event type for the terminal event of a failed run.
pub const EVENT_RUN_FAILED: &str = "run_failed";
