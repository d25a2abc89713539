use crate::handlers::NodeHandler;
use crate::{EngineError, Graph, Node, NodeOutcome, RuntimeContext};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HumanChoice {
    pub key: String,
    pub label: String,
    pub to_node: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HumanQuestion {
    pub node_id: String,
    pub text: String,
    pub choices: Vec<HumanChoice>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HumanAnswer {
    Selected(String),
    Timeout,
    Skipped,
}

/// Seam to whatever asks the human; the engine only awaits the answer.
#[async_trait]
pub trait Interviewer: Send + Sync {
    async fn ask(&self, question: HumanQuestion) -> HumanAnswer;
}

#[derive(Debug, Default)]
pub struct AutoApproveInterviewer;

#[async_trait]
impl Interviewer for AutoApproveInterviewer {
    async fn ask(&self, question: HumanQuestion) -> HumanAnswer {
        question
            .choices
            .first()
            .map(|choice| HumanAnswer::Selected(choice.key.clone()))
            .unwrap_or(HumanAnswer::Skipped)
    }
}

pub struct WaitHumanHandler {
    interviewer: Arc<dyn Interviewer>,
}

impl WaitHumanHandler {
    pub fn new(interviewer: Arc<dyn Interviewer>) -> Self {
        Self { interviewer }
    }
}

#[async_trait]
impl NodeHandler for WaitHumanHandler {
    async fn execute(
        &self,
        node: &Node,
        _context: &RuntimeContext,
        graph: &Graph,
    ) -> Result<NodeOutcome, EngineError> {
        let choices = derive_choices(node, graph);
        if choices.is_empty() {
            return Ok(NodeOutcome::failure(format!(
                "human-wait node '{}' has no outgoing choices",
                node.id
            )));
        }

        let question = HumanQuestion {
            node_id: node.id.clone(),
            text: node
                .label
                .as_deref()
                .filter(|label| !label.trim().is_empty())
                .unwrap_or("Select an option:")
                .to_string(),
            choices: choices.clone(),
        };

        let selected = match self.interviewer.ask(question).await {
            HumanAnswer::Selected(raw) => {
                find_choice(&choices, &raw).unwrap_or_else(|| choices[0].clone())
            }
            HumanAnswer::Timeout => {
                let default_choice = node
                    .attrs
                    .get_str("human.default_choice")
                    .and_then(|raw| find_choice(&choices, raw));
                match default_choice {
                    Some(choice) => choice,
                    None => {
                        return Ok(NodeOutcome::retry("human gate timeout, no default"));
                    }
                }
            }
            HumanAnswer::Skipped => {
                return Ok(NodeOutcome::failure("human skipped interaction"));
            }
        };

        let mut outcome = NodeOutcome::success();
        outcome.notes = Some(format!("human selected {}", selected.key));
        outcome.context_updates.insert(
            "human.selected".to_string(),
            Value::String(selected.key.clone()),
        );
        outcome.preferred_label = Some(selected.label.clone());
        outcome.suggested_next_ids = vec![selected.to_node.clone()];
        Ok(outcome)
    }
}

fn derive_choices(node: &Node, graph: &Graph) -> Vec<HumanChoice> {
    graph
        .outgoing_edges(&node.id)
        .map(|edge| {
            let label = edge
                .label
                .as_deref()
                .filter(|label| !label.trim().is_empty())
                .unwrap_or(&edge.to)
                .to_string();
            HumanChoice {
                key: accelerator_key(&label),
                label,
                to_node: edge.to.clone(),
            }
        })
        .collect()
}

fn accelerator_key(label: &str) -> String {
    let trimmed = label.trim();
    if let Some(inner) = trimmed.strip_prefix('[').and_then(|raw| raw.split_once(']')) {
        let key = inner.0.trim();
        if !key.is_empty() {
            return key.to_ascii_uppercase();
        }
    }
    if let Some((left, _)) = trimmed.split_once(')') {
        let key = left.trim();
        if key.len() == 1 {
            return key.to_ascii_uppercase();
        }
    }
    trimmed
        .chars()
        .next()
        .map(|ch| ch.to_ascii_uppercase().to_string())
        .unwrap_or_else(|| "X".to_string())
}

fn find_choice(choices: &[HumanChoice], raw: &str) -> Option<HumanChoice> {
    let needle = raw.trim().to_ascii_lowercase();
    choices
        .iter()
        .find(|choice| {
            choice.key.to_ascii_lowercase() == needle
                || choice.label.to_ascii_lowercase() == needle
                || choice.to_node.to_ascii_lowercase() == needle
        })
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Edge, GraphBuilder, NodeKind, NodeStatus, work_node};

    struct FixedInterviewer(HumanAnswer);

    #[async_trait]
    impl Interviewer for FixedInterviewer {
        async fn ask(&self, _question: HumanQuestion) -> HumanAnswer {
            self.0.clone()
        }
    }

    fn gate_graph() -> Graph {
        GraphBuilder::new("g")
            .node(Node::new("gate", NodeKind::HumanWait))
            .node(work_node("yes"))
            .node(work_node("no"))
            .edge_full("gate", "yes", |edge| Edge {
                label: Some("[Y] Yes".to_string()),
                ..edge
            })
            .edge_full("gate", "no", |edge| Edge {
                label: Some("[N] No".to_string()),
                ..edge
            })
            .build()
    }

    #[tokio::test(flavor = "current_thread")]
    async fn wait_human_selected_expected_success_with_suggested_next() {
        let graph = gate_graph();
        let node = graph.nodes.get("gate").expect("gate should exist");
        let handler =
            WaitHumanHandler::new(Arc::new(FixedInterviewer(HumanAnswer::Selected("N".into()))));

        let outcome = handler
            .execute(node, &RuntimeContext::new(), &graph)
            .await
            .expect("execution should succeed");
        assert_eq!(outcome.status, NodeStatus::Success);
        assert_eq!(outcome.suggested_next_ids, vec!["no".to_string()]);
        assert_eq!(outcome.preferred_label.as_deref(), Some("[N] No"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn wait_human_timeout_without_default_expected_retry() {
        let graph = gate_graph();
        let node = graph.nodes.get("gate").expect("gate should exist");
        let handler = WaitHumanHandler::new(Arc::new(FixedInterviewer(HumanAnswer::Timeout)));

        let outcome = handler
            .execute(node, &RuntimeContext::new(), &graph)
            .await
            .expect("execution should succeed");
        assert_eq!(outcome.status, NodeStatus::Retry);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn wait_human_timeout_with_default_expected_default_choice() {
        let mut graph = gate_graph();
        let gate = graph.nodes.get_mut("gate").expect("gate should exist");
        gate.attrs.set(
            "human.default_choice",
            crate::AttrValue::String("no".to_string()),
        );
        let node = graph.nodes.get("gate").expect("gate should exist");
        let handler = WaitHumanHandler::new(Arc::new(FixedInterviewer(HumanAnswer::Timeout)));

        let outcome = handler
            .execute(node, &RuntimeContext::new(), &graph)
            .await
            .expect("execution should succeed");
        assert_eq!(outcome.status, NodeStatus::Success);
        assert_eq!(outcome.suggested_next_ids, vec!["no".to_string()]);
    }
}
