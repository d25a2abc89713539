use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DurationValue {
    pub raw: String,
    pub millis: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Duration(DurationValue),
}

impl AttrValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn to_string_value(&self) -> String {
        match self {
            Self::String(value) => value.clone(),
            Self::Integer(value) => value.to_string(),
            Self::Float(value) => value.to_string(),
            Self::Boolean(value) => value.to_string(),
            Self::Duration(value) => value.raw.clone(),
        }
    }
}

/// Free-form attribute bag for handler-specific options.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Attributes {
    values: BTreeMap<String, AttrValue>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn values(&self) -> &BTreeMap<String, AttrValue> {
        &self.values
    }

    pub fn set(&mut self, key: impl Into<String>, value: AttrValue) {
        self.values.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&AttrValue> {
        self.values.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(AttrValue::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(AttrValue::as_bool)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(AttrValue::as_i64)
    }
}

/// The handler kind a node dispatches to. The small closed set of kinds
/// is typed; anything kind-specific rides in the node's attribute bag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Start,
    Exit,
    Work,
    Conditional,
    FanOut,
    FanIn,
    HumanWait,
    Tool,
    Supervisor,
}

impl NodeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Exit => "exit",
            Self::Work => "work",
            Self::Conditional => "conditional",
            Self::FanOut => "fan_out",
            Self::FanIn => "fan_in",
            Self::HumanWait => "human_wait",
            Self::Tool => "tool",
            Self::Supervisor => "supervisor",
        }
    }

    pub fn is_terminal(self) -> bool {
        self == Self::Exit
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub kind: NodeKind,
    pub label: Option<String>,
    pub goal_gate: bool,
    pub max_retries: Option<u32>,
    pub backoff: Option<String>,
    pub retry_target: Option<String>,
    pub fallback_retry_target: Option<String>,
    pub allow_partial: bool,
    pub attrs: Attributes,
}

impl Node {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
            label: None,
            goal_gate: false,
            max_retries: None,
            backoff: None,
            retry_target: None,
            fallback_retry_target: None,
            allow_partial: false,
            attrs: Attributes::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
    pub label: Option<String>,
    pub condition: Option<String>,
    pub weight: i64,
    pub attrs: Attributes,
}

/// Immutable graph handed to the runner. Built once per run by an
/// external parser or the builder below; the engine only reads it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    pub id: String,
    pub goal: Option<String>,
    pub default_carry: Option<String>,
    pub attrs: Attributes,
    pub nodes: BTreeMap<String, Node>,
    pub edges: Vec<Edge>,
}

impl Graph {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            goal: None,
            default_carry: None,
            attrs: Attributes::new(),
            nodes: BTreeMap::new(),
            edges: Vec::new(),
        }
    }

    pub fn outgoing_edges<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |edge| edge.from == node_id)
    }

    pub fn incoming_edges<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |edge| edge.to == node_id)
    }

    pub fn start_candidates(&self) -> Vec<&Node> {
        self.nodes
            .values()
            .filter(|node| node.kind == NodeKind::Start)
            .collect()
    }

    pub fn exit_candidates(&self) -> Vec<&Node> {
        self.nodes
            .values()
            .filter(|node| node.kind == NodeKind::Exit)
            .collect()
    }
}

/// Programmatic construction surface standing in for a file parser.
#[derive(Clone, Debug)]
pub struct GraphBuilder {
    graph: Graph,
}

impl GraphBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            graph: Graph::new(id),
        }
    }

    pub fn goal(mut self, goal: impl Into<String>) -> Self {
        self.graph.goal = Some(goal.into());
        self
    }

    pub fn default_carry(mut self, carry: impl Into<String>) -> Self {
        self.graph.default_carry = Some(carry.into());
        self
    }

    pub fn graph_attr(mut self, key: impl Into<String>, value: AttrValue) -> Self {
        self.graph.attrs.set(key, value);
        self
    }

    pub fn node(mut self, node: Node) -> Self {
        self.graph.nodes.insert(node.id.clone(), node);
        self
    }

    /// Unlabeled, unconditional, weight-0 edge.
    pub fn edge(self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edge_full(from, to, |edge| edge)
    }

    pub fn edge_full(
        mut self,
        from: impl Into<String>,
        to: impl Into<String>,
        configure: impl FnOnce(Edge) -> Edge,
    ) -> Self {
        let edge = Edge {
            from: from.into(),
            to: to.into(),
            label: None,
            condition: None,
            weight: 0,
            attrs: Attributes::new(),
        };
        self.graph.edges.push(configure(edge));
        self
    }

    pub fn build(self) -> Graph {
        self.graph
    }
}

/// Shorthand builders used heavily by tests and embedders.
pub fn work_node(id: impl Into<String>) -> Node {
    Node::new(id, NodeKind::Work)
}

pub fn start_node(id: impl Into<String>) -> Node {
    Node::new(id, NodeKind::Start)
}

pub fn exit_node(id: impl Into<String>) -> Node {
    Node::new(id, NodeKind::Exit)
}

/// Linear pipeline: start, the given work nodes in order, exit.
pub fn linear_graph(id: impl Into<String>, work_ids: &[&str]) -> Graph {
    let mut builder = GraphBuilder::new(id).node(start_node("start")).node(exit_node("exit"));
    let mut previous = "start".to_string();
    for work_id in work_ids {
        builder = builder.node(work_node(*work_id)).edge(previous.clone(), *work_id);
        previous = (*work_id).to_string();
    }
    builder.edge(previous, "exit").build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_graph_expected_nodes_and_edge_order() {
        let graph = linear_graph("g", &["a", "b"]);

        assert_eq!(graph.nodes.len(), 4);
        let targets: Vec<&str> = graph.edges.iter().map(|edge| edge.to.as_str()).collect();
        assert_eq!(targets, vec!["a", "b", "exit"]);
        assert_eq!(graph.start_candidates().len(), 1);
        assert_eq!(graph.exit_candidates().len(), 1);
    }

    #[test]
    fn outgoing_edges_expected_filtered_by_source() {
        let graph = GraphBuilder::new("g")
            .node(start_node("start"))
            .node(work_node("a"))
            .node(work_node("b"))
            .node(exit_node("exit"))
            .edge("start", "a")
            .edge("start", "b")
            .edge("a", "exit")
            .edge("b", "exit")
            .build();

        let from_start: Vec<&str> = graph
            .outgoing_edges("start")
            .map(|edge| edge.to.as_str())
            .collect();
        assert_eq!(from_start, vec!["a", "b"]);
        assert_eq!(graph.incoming_edges("exit").count(), 2);
    }
}
