use crate::{Edge, Graph, NodeOutcome, RuntimeContext, evaluate_condition_expression};

/// Deterministic edge selection. Strict priority order:
///
/// 1. edges whose condition evaluates true (an explicitly matched
///    condition dominates every later step — a low-weight conditional
///    match beats a high-weight unconditional edge)
/// 2. normalized label equal to the outcome's preferred label
/// 3. first eligible target in the outcome's suggested id list
/// 4. highest weight
/// 5. ties broken by lexically smallest target id
///
/// Returns `None` only when no edge passes step 1; validation
/// guarantees every non-terminal node keeps an unconditional edge.
pub fn select_edge<'a>(
    graph: &'a Graph,
    from_node_id: &'a str,
    outcome: &NodeOutcome,
    context: &RuntimeContext,
) -> Option<&'a Edge> {
    let edges: Vec<&Edge> = graph.outgoing_edges(from_node_id).collect();
    if edges.is_empty() {
        return None;
    }

    let condition_matched: Vec<&Edge> = edges
        .iter()
        .copied()
        .filter(|edge| {
            edge_condition(edge).is_some_and(|condition| {
                evaluate_condition_expression(condition, outcome, context).unwrap_or(false)
            })
        })
        .collect();
    if !condition_matched.is_empty() {
        return best_by_weight_then_lexical(condition_matched);
    }

    // Unconditional edges (empty condition = true) are eligible for the
    // label and suggestion steps.
    let eligible: Vec<&Edge> = edges
        .iter()
        .copied()
        .filter(|edge| edge_condition(edge).is_none())
        .collect();

    if let Some(preferred) = outcome.preferred_label.as_deref() {
        let preferred = normalize_label(preferred);
        if let Some(edge) = eligible
            .iter()
            .find(|edge| normalize_label(edge.label.as_deref().unwrap_or_default()) == preferred)
        {
            return Some(*edge);
        }
    }

    for suggested in &outcome.suggested_next_ids {
        if let Some(edge) = eligible.iter().find(|edge| edge.to == *suggested) {
            return Some(*edge);
        }
    }

    best_by_weight_then_lexical(eligible)
}

/// Explicitly condition-matched edges only. Used where unconditional
/// edges are not routing candidates: a failed fan-out's unconditional
/// edges are its branch entries, not onward routes.
pub fn select_condition_matched_edge<'a>(
    graph: &'a Graph,
    from_node_id: &'a str,
    outcome: &NodeOutcome,
    context: &RuntimeContext,
) -> Option<&'a Edge> {
    let matched: Vec<&Edge> = graph
        .outgoing_edges(from_node_id)
        .filter(|edge| {
            edge_condition(edge).is_some_and(|condition| {
                evaluate_condition_expression(condition, outcome, context).unwrap_or(false)
            })
        })
        .collect();
    best_by_weight_then_lexical(matched)
}

fn edge_condition(edge: &Edge) -> Option<&str> {
    edge.condition
        .as_deref()
        .map(str::trim)
        .filter(|condition| !condition.is_empty())
}

fn best_by_weight_then_lexical(edges: Vec<&Edge>) -> Option<&Edge> {
    edges.into_iter().max_by(|left, right| {
        left.weight
            .cmp(&right.weight)
            .then_with(|| right.to.cmp(&left.to))
    })
}

/// Lowercase, trim, and strip leading accelerator markers: `[K] Label`,
/// `K) Label`, `K - Label`.
pub fn normalize_label(input: &str) -> String {
    let trimmed = input.trim().to_ascii_lowercase();

    if trimmed.starts_with('[') {
        if let Some((_, rest)) = trimmed.split_once(']') {
            return rest.trim().to_string();
        }
    }

    let bytes = trimmed.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphanumeric() && bytes[1] == b')' {
        return trimmed[2..].trim().to_string();
    }
    if bytes.len() >= 3 && bytes[0].is_ascii_alphanumeric() && bytes[1] == b' ' && bytes[2] == b'-'
    {
        return trimmed[3..].trim().to_string();
    }

    trimmed
}
