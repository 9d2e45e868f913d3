// SPDX-License-Identifier: MIT OR Apache-2.0
//! Pack DAG ordering and well-formedness.

use crate::{ErrorKind, PackDag, ReachError};
use std::collections::{BTreeMap, BTreeSet};

/// Topologically order a pack DAG.
///
/// Kahn's algorithm with the ready set kept sorted, so ties always break by
/// node id in Unicode code-point order. The order is a pure function of the
/// DAG: every host computes the same schedule for the same pack.
///
/// # Errors
///
/// Returns a [`ErrorKind::ValidationFailure`] error for duplicate node ids,
/// edges that reference unknown nodes, or cycles.
pub fn topo_order(dag: &PackDag) -> Result<Vec<String>, ReachError> {
    let invalid = |message: String| ReachError::new(ErrorKind::ValidationFailure, message);

    let mut indegree: BTreeMap<&str, usize> = BTreeMap::new();
    for node in &dag.nodes {
        if indegree.insert(node.id.as_str(), 0).is_some() {
            return Err(invalid(format!("duplicate node id {:?}", node.id)));
        }
    }
    let mut outgoing: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for edge in &dag.edges {
        if !indegree.contains_key(edge.from.as_str()) {
            return Err(invalid(format!("edge references unknown node {:?}", edge.from)));
        }
        if !indegree.contains_key(edge.to.as_str()) {
            return Err(invalid(format!("edge references unknown node {:?}", edge.to)));
        }
        outgoing
            .entry(edge.from.as_str())
            .or_default()
            .push(edge.to.as_str());
        *indegree.get_mut(edge.to.as_str()).expect("checked above") += 1;
    }

    let mut ready: BTreeSet<&str> = indegree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut order = Vec::with_capacity(dag.nodes.len());
    while let Some(next) = ready.iter().next().copied() {
        ready.remove(next);
        order.push(next.to_string());
        for succ in outgoing.get(next).into_iter().flatten() {
            let deg = indegree.get_mut(succ).expect("successor exists");
            *deg -= 1;
            if *deg == 0 {
                ready.insert(succ);
            }
        }
    }
    if order.len() != dag.nodes.len() {
        return Err(invalid("pack DAG contains a cycle".into()));
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PackEdge, PackNode};
    use serde_json::json;

    fn node(id: &str) -> PackNode {
        PackNode {
            id: id.into(),
            node_type: "task".into(),
            action: "core.echo".into(),
            inputs: json!({}),
        }
    }

    fn edge(from: &str, to: &str) -> PackEdge {
        PackEdge {
            from: from.into(),
            to: to.into(),
        }
    }

    #[test]
    fn ties_break_by_node_id() {
        let dag = PackDag {
            nodes: vec![node("c"), node("a"), node("b")],
            edges: vec![],
        };
        assert_eq!(topo_order(&dag).unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn edges_constrain_order() {
        let dag = PackDag {
            nodes: vec![node("a"), node("b"), node("z")],
            edges: vec![edge("z", "a"), edge("z", "b")],
        };
        assert_eq!(topo_order(&dag).unwrap(), vec!["z", "a", "b"]);
    }

    #[test]
    fn cycles_are_rejected() {
        let dag = PackDag {
            nodes: vec![node("a"), node("b")],
            edges: vec![edge("a", "b"), edge("b", "a")],
        };
        let err = topo_order(&dag).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ValidationFailure);
    }

    #[test]
    fn unknown_edge_endpoints_are_rejected() {
        let dag = PackDag {
            nodes: vec![node("a")],
            edges: vec![edge("a", "ghost")],
        };
        assert!(topo_order(&dag).is_err());
    }

    #[test]
    fn duplicate_node_ids_are_rejected() {
        let dag = PackDag {
            nodes: vec![node("a"), node("a")],
            edges: vec![],
        };
        assert!(topo_order(&dag).is_err());
    }

    #[test]
    fn diamond_resolves_deterministically() {
        let dag = PackDag {
            nodes: vec![node("d"), node("b"), node("c"), node("a")],
            edges: vec![edge("a", "b"), edge("a", "c"), edge("b", "d"), edge("c", "d")],
        };
        assert_eq!(topo_order(&dag).unwrap(), vec!["a", "b", "c", "d"]);
    }
}
