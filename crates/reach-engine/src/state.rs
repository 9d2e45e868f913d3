// SPDX-License-Identifier: MIT OR Apache-2.0
//! Run state: the deterministic fold over a run's event log.
//!
//! Replay equivalence hangs on this module: folding the full log and folding
//! a snapshot plus the tail must land on identical state, and therefore
//! identical state fingerprints.

use crate::tool::TokenUsage;
use crate::{EVENT_NODE_COMPLETED, EVENT_RUN_COMPLETED, EVENT_RUN_FAILED};
use reach_core::EventRecord;
use reach_hash::CanonicalError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Materialized state of a run.
///
/// Node results live in an indexed map keyed by node id; assignment is
/// always by index, never append, so concurrent completion order can never
/// leak into the state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    /// Node outputs keyed by node id.
    pub results: BTreeMap<String, serde_json::Value>,
    /// Total handler-reported latency.
    pub latency_ms: u64,
    /// Aggregated token counters.
    pub token_usage: TokenUsage,
    /// Set by the terminal `run_completed` event.
    pub completed: bool,
    /// Set by a terminal `run_failed` event.
    pub failed_node: Option<String>,
}

impl RunState {
    /// Fold one event into the state.
    ///
    /// Unknown event types are ignored: old engines replay logs written by
    /// newer ones without diverging on events they do not understand.
    pub fn apply(&mut self, record: &EventRecord) {
        match record.event_type.as_str() {
            EVENT_NODE_COMPLETED => {
                let Some(node_id) = record.payload.get("node_id").and_then(|v| v.as_str()) else {
                    return;
                };
                let output = record
                    .payload
                    .get("output")
                    .cloned()
                    .unwrap_or(serde_json::Value::Null);
                self.results.insert(node_id.to_string(), output);
                self.latency_ms += record
                    .payload
                    .get("latency_ms")
                    .and_then(serde_json::Value::as_u64)
                    .unwrap_or(0);
                self.token_usage.add(TokenUsage {
                    prompt: nested_u64(&record.payload, "token_usage", "prompt"),
                    completion: nested_u64(&record.payload, "token_usage", "completion"),
                });
            }
            EVENT_RUN_COMPLETED => {
                self.completed = true;
            }
            EVENT_RUN_FAILED => {
                self.failed_node = record
                    .payload
                    .get("node_id")
                    .and_then(|v| v.as_str())
                    .map(String::from);
            }
            _ => {}
        }
    }

    /// Fold an event log from scratch.
    #[must_use]
    pub fn replay(records: &[EventRecord]) -> Self {
        let mut state = Self::default();
        for record in records {
            state.apply(record);
        }
        state
    }

    /// Resume from a snapshot payload and fold the tail.
    ///
    /// # Errors
    ///
    /// Fails if the snapshot payload does not decode as run state.
    pub fn replay_from_snapshot(
        snapshot_payload: &serde_json::Value,
        tail: &[EventRecord],
    ) -> Result<Self, serde_json::Error> {
        let mut state: RunState = serde_json::from_value(snapshot_payload.clone())?;
        for record in tail {
            state.apply(record);
        }
        Ok(state)
    }

    /// Canonical hash of the state.
    ///
    /// # Errors
    ///
    /// Fails if the state cannot be serialized.
    pub fn fingerprint(&self) -> Result<String, CanonicalError> {
        reach_hash::hash_canonical(self)
    }
}

fn nested_u64(payload: &serde_json::Value, outer: &str, inner: &str) -> u64 {
    payload
        .get(outer)
        .and_then(|v| v.get(inner))
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node_event(id: i64, node_id: &str, output: serde_json::Value) -> EventRecord {
        EventRecord {
            id,
            event_type: EVENT_NODE_COMPLETED.into(),
            payload: json!({
                "node_id": node_id,
                "action": "core.echo",
                "output": output,
                "latency_ms": 3,
                "token_usage": {"prompt": 10, "completion": 4},
            }),
        }
    }

    #[test]
    fn replay_folds_results_by_node_id() {
        let log = vec![
            node_event(1, "b", json!("second")),
            node_event(2, "a", json!("first")),
            EventRecord {
                id: 3,
                event_type: EVENT_RUN_COMPLETED.into(),
                payload: json!({}),
            },
        ];
        let state = RunState::replay(&log);
        assert_eq!(state.results["a"], json!("first"));
        assert_eq!(state.results["b"], json!("second"));
        assert_eq!(state.latency_ms, 6);
        assert_eq!(state.token_usage.prompt, 20);
        assert_eq!(state.token_usage.completion, 8);
        assert!(state.completed);
        assert!(state.failed_node.is_none());
    }

    #[test]
    fn snapshot_then_tail_equals_full_replay() {
        let log: Vec<EventRecord> = (0..10)
            .map(|i| node_event(i + 1, &format!("n{i}"), json!(i)))
            .collect();
        let full = RunState::replay(&log);

        let prefix = RunState::replay(&log[..6]);
        let snapshot_payload = serde_json::to_value(&prefix).unwrap();
        let resumed = RunState::replay_from_snapshot(&snapshot_payload, &log[6..]).unwrap();

        assert_eq!(full, resumed);
        assert_eq!(
            full.fingerprint().unwrap(),
            resumed.fingerprint().unwrap()
        );
    }

    #[test]
    fn failed_run_records_node() {
        let log = vec![
            node_event(1, "a", json!(1)),
            EventRecord {
                id: 2,
                event_type: EVENT_RUN_FAILED.into(),
                payload: json!({"node_id": "b", "error_kind": "transient_io"}),
            },
        ];
        let state = RunState::replay(&log);
        assert_eq!(state.failed_node.as_deref(), Some("b"));
        assert!(!state.completed);
    }

    #[test]
    fn unknown_event_types_are_ignored() {
        let log = vec![EventRecord {
            id: 1,
            event_type: "future_event".into(),
            payload: json!({"whatever": true}),
        }];
        assert_eq!(RunState::replay(&log), RunState::default());
    }
}
