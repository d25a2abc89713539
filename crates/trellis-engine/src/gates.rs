use crate::{Graph, NodeOutcome, NodeStatus};
use std::collections::BTreeMap;

/// A goal gate is satisfied once its recorded status is SUCCESS or
/// PARTIAL_SUCCESS. Scanned at every exit-reach attempt; the run never
/// completes past an unsatisfied gate.
pub fn first_unsatisfied_goal_gate(
    graph: &Graph,
    visited_outcomes: &BTreeMap<String, NodeStatus>,
) -> Option<String> {
    for (node_id, status) in visited_outcomes {
        let Some(node) = graph.nodes.get(node_id) else {
            continue;
        };
        if node.goal_gate && !status.is_success_like() {
            return Some(node_id.clone());
        }
    }
    None
}

/// Fallback chain shared by gate rerouting and node-failure routing:
/// node retry_target, node fallback_retry_target, then the graph-level
/// defaults under the same names.
pub fn resolve_retry_target(graph: &Graph, node_id: &str) -> Option<String> {
    if let Some(node) = graph.nodes.get(node_id) {
        for target in [&node.retry_target, &node.fallback_retry_target] {
            if let Some(target) = target.as_deref() {
                if graph.nodes.contains_key(target) {
                    return Some(target.to_string());
                }
            }
        }
    }

    for key in ["retry_target", "fallback_retry_target"] {
        let target = graph.attrs.get_str(key).unwrap_or_default();
        if !target.is_empty() && graph.nodes.contains_key(target) {
            return Some(target.to_string());
        }
    }

    None
}

/// Applied when a node FAILs and edge selection produced nothing: an
/// explicit fail-condition edge was already given its chance in
/// routing, so the chain here is retry_target onward.
pub fn resolve_failure_route(graph: &Graph, node_id: &str, outcome: &NodeOutcome) -> Option<String> {
    debug_assert_eq!(outcome.status, NodeStatus::Fail);
    resolve_retry_target(graph, node_id)
}
