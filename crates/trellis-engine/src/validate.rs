use crate::{
    Diagnostic, Graph, NodeKind, Severity, ValidationError, validate_condition_expression,
};
use std::collections::{BTreeSet, VecDeque};

pub trait LintRule {
    fn name(&self) -> &str;
    fn apply(&self, graph: &Graph) -> Vec<Diagnostic>;
}

pub fn validate(graph: &Graph, extra_rules: &[&dyn LintRule]) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();

    diagnostics.extend(rule_start_node(graph));
    diagnostics.extend(rule_exit_node(graph));
    diagnostics.extend(rule_edge_endpoints_exist(graph));
    diagnostics.extend(rule_start_no_incoming(graph));
    diagnostics.extend(rule_exit_no_outgoing(graph));
    diagnostics.extend(rule_reachability(graph));
    diagnostics.extend(rule_condition_syntax(graph));
    diagnostics.extend(rule_retry_target_exists(graph));
    diagnostics.extend(rule_unconditional_edge_coverage(graph));
    diagnostics.extend(rule_fan_out_reaches_fan_in(graph));

    for rule in extra_rules {
        diagnostics.extend(rule.apply(graph));
    }

    diagnostics
}

pub fn validate_or_raise(
    graph: &Graph,
    extra_rules: &[&dyn LintRule],
) -> Result<Vec<Diagnostic>, ValidationError> {
    let diagnostics = validate(graph, extra_rules);
    if diagnostics.iter().any(Diagnostic::is_error) {
        return Err(ValidationError::new(diagnostics));
    }
    Ok(diagnostics)
}

fn rule_start_node(graph: &Graph) -> Vec<Diagnostic> {
    let starts = graph.start_candidates();
    if starts.len() == 1 {
        Vec::new()
    } else {
        vec![Diagnostic::new(
            "start_node",
            Severity::Error,
            format!(
                "pipeline must have exactly one start node; found {}",
                starts.len()
            ),
        )]
    }
}

fn rule_exit_node(graph: &Graph) -> Vec<Diagnostic> {
    if graph.exit_candidates().is_empty() {
        vec![Diagnostic::new(
            "exit_node",
            Severity::Error,
            "pipeline must have at least one exit node",
        )]
    } else {
        Vec::new()
    }
}

fn rule_edge_endpoints_exist(graph: &Graph) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    for edge in &graph.edges {
        for (end, id) in [("source", &edge.from), ("target", &edge.to)] {
            if !graph.nodes.contains_key(id) {
                diagnostics.push(
                    Diagnostic::new(
                        "edge_endpoints_exist",
                        Severity::Error,
                        format!("edge {end} '{id}' does not exist"),
                    )
                    .with_edge(edge.from.clone(), edge.to.clone()),
                );
            }
        }
    }
    diagnostics
}

fn rule_start_no_incoming(graph: &Graph) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    for start in graph.start_candidates() {
        if graph.incoming_edges(&start.id).next().is_some() {
            diagnostics.push(
                Diagnostic::new(
                    "start_no_incoming",
                    Severity::Error,
                    "start node must have no incoming edges",
                )
                .with_node_id(start.id.clone()),
            );
        }
    }
    diagnostics
}

fn rule_exit_no_outgoing(graph: &Graph) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    for exit in graph.exit_candidates() {
        if graph.outgoing_edges(&exit.id).next().is_some() {
            diagnostics.push(
                Diagnostic::new(
                    "exit_no_outgoing",
                    Severity::Error,
                    "exit node must have no outgoing edges",
                )
                .with_node_id(exit.id.clone()),
            );
        }
    }
    diagnostics
}

fn rule_reachability(graph: &Graph) -> Vec<Diagnostic> {
    let Some(start) = graph.start_candidates().into_iter().next() else {
        return Vec::new();
    };

    let mut visited = BTreeSet::new();
    let mut queue = VecDeque::from([start.id.as_str()]);
    while let Some(node_id) = queue.pop_front() {
        if !visited.insert(node_id) {
            continue;
        }
        for edge in graph.outgoing_edges(node_id) {
            queue.push_back(edge.to.as_str());
        }
    }

    graph
        .nodes
        .keys()
        .filter(|node_id| !visited.contains(node_id.as_str()))
        .map(|node_id| {
            Diagnostic::new(
                "reachability",
                Severity::Warning,
                format!("node '{node_id}' is unreachable from the start node"),
            )
            .with_node_id(node_id.clone())
        })
        .collect()
}

fn rule_condition_syntax(graph: &Graph) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    for edge in &graph.edges {
        let Some(condition) = edge.condition.as_deref() else {
            continue;
        };
        if condition.trim().is_empty() {
            continue;
        }
        if let Err(error) = validate_condition_expression(condition) {
            diagnostics.push(
                Diagnostic::new("condition_syntax", Severity::Error, error)
                    .with_edge(edge.from.clone(), edge.to.clone()),
            );
        }
    }
    diagnostics
}

fn rule_retry_target_exists(graph: &Graph) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    for node in graph.nodes.values() {
        for (field, target) in [
            ("retry_target", &node.retry_target),
            ("fallback_retry_target", &node.fallback_retry_target),
        ] {
            if let Some(target) = target.as_deref() {
                if !graph.nodes.contains_key(target) {
                    diagnostics.push(
                        Diagnostic::new(
                            "retry_target_exists",
                            Severity::Error,
                            format!("{field} '{target}' does not exist"),
                        )
                        .with_node_id(node.id.clone()),
                    );
                }
            }
        }
    }
    diagnostics
}

// Guarantees select_edge never returns None on the happy path: every
// non-terminal node keeps at least one unconditional outgoing edge.
fn rule_unconditional_edge_coverage(graph: &Graph) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    for node in graph.nodes.values() {
        if node.kind.is_terminal() {
            continue;
        }
        let mut outgoing = graph.outgoing_edges(&node.id).peekable();
        if outgoing.peek().is_none() {
            diagnostics.push(
                Diagnostic::new(
                    "unconditional_edge_coverage",
                    Severity::Error,
                    format!("non-terminal node '{}' has no outgoing edges", node.id),
                )
                .with_node_id(node.id.clone()),
            );
            continue;
        }
        let has_unconditional = graph.outgoing_edges(&node.id).any(|edge| {
            edge.condition
                .as_deref()
                .map(str::trim)
                .filter(|condition| !condition.is_empty())
                .is_none()
        });
        if !has_unconditional {
            diagnostics.push(
                Diagnostic::new(
                    "unconditional_edge_coverage",
                    Severity::Warning,
                    format!(
                        "node '{}' has only conditional outgoing edges; a no-match outcome dead-ends",
                        node.id
                    ),
                )
                .with_node_id(node.id.clone()),
            );
        }
    }
    diagnostics
}

fn rule_fan_out_reaches_fan_in(graph: &Graph) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    for node in graph.nodes.values() {
        if node.kind != NodeKind::FanOut {
            continue;
        }

        let mut visited = BTreeSet::new();
        let mut queue: VecDeque<&str> = graph
            .outgoing_edges(&node.id)
            .map(|edge| edge.to.as_str())
            .collect();
        let mut found_fan_in = false;
        while let Some(node_id) = queue.pop_front() {
            if !visited.insert(node_id) {
                continue;
            }
            if graph
                .nodes
                .get(node_id)
                .is_some_and(|candidate| candidate.kind == NodeKind::FanIn)
            {
                found_fan_in = true;
                continue;
            }
            for edge in graph.outgoing_edges(node_id) {
                queue.push_back(edge.to.as_str());
            }
        }

        if !found_fan_in {
            diagnostics.push(
                Diagnostic::new(
                    "fan_out_reaches_fan_in",
                    Severity::Error,
                    format!("fan-out node '{}' has no downstream fan-in", node.id),
                )
                .with_node_id(node.id.clone()),
            );
        }
    }
    diagnostics
}
