use crate::Graph;

/// How much prior execution context a freshly dispatched node
/// receives. Resolution order: incoming edge, node, graph default.
pub fn effective_carry_mode(
    graph: &Graph,
    target_node_id: &str,
    incoming_from_node_id: Option<&str>,
) -> String {
    if let Some(from) = incoming_from_node_id {
        for edge in graph.outgoing_edges(from) {
            if edge.to == target_node_id {
                if let Some(carry) = edge.attrs.get_str("carry") {
                    let trimmed = carry.trim();
                    if !trimmed.is_empty() {
                        return trimmed.to_string();
                    }
                }
            }
        }
    }

    if let Some(node) = graph.nodes.get(target_node_id) {
        if let Some(carry) = node.attrs.get_str("carry") {
            let trimmed = carry.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }

    if let Some(carry) = graph.default_carry.as_deref() {
        let trimmed = carry.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }

    "compact".to_string()
}

/// A resumed run degrades a `full` carry one step for the first
/// re-dispatched node: the in-memory transcript the mode referred to
/// died with the old process.
pub fn degraded_carry_on_resume(recorded: &str) -> Option<String> {
    (recorded.trim() == "full").then(|| "summary:high".to_string())
}
