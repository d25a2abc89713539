use crate::handlers::NodeHandler;
use crate::{
    EngineError, Graph, Node, NodeOutcome, NodeStatus, RuntimeContext, SubTurn, SubTurnSender,
};
use async_trait::async_trait;
use serde_json::{Value, json};

/// Scripted stand-in for the real execution backend. The backend that
/// does the node's actual work lives behind this same seam and is
/// supplied by the embedder; this handler drives the engine from node
/// attributes and context so pipelines run end to end without one.
///
/// Recognized attributes:
/// - `work.outcome`: success | partial_success | retry | fail
/// - `work.output`: string merged into context at `<node_id>.output`
/// - `work.sub_steps`: comma-separated internal step names, each
///   emitted as a sub-turn
///
/// A scripted outcome can also come from context under
/// `work.<node_id>.outcome`, which wins over the attribute.
pub struct WorkHandler {
    sub_turns: Option<SubTurnSender>,
}

impl WorkHandler {
    pub fn new(sub_turns: Option<SubTurnSender>) -> Self {
        Self { sub_turns }
    }
}

#[async_trait]
impl NodeHandler for WorkHandler {
    async fn execute(
        &self,
        node: &Node,
        context: &RuntimeContext,
        _graph: &Graph,
    ) -> Result<NodeOutcome, EngineError> {
        if let Some(sender) = self.sub_turns.as_ref() {
            for (index, step) in sub_steps(node).into_iter().enumerate() {
                let _ = sender.send(SubTurn {
                    name: step.clone(),
                    payload: json!({ "node_id": node.id, "step_index": index }),
                });
            }
        }

        let scripted = context
            .get(&format!("work.{}.outcome", node.id))
            .and_then(Value::as_str)
            .or_else(|| node.attrs.get_str("work.outcome"));
        let status = match scripted {
            Some(raw) => NodeStatus::try_from(raw.trim())?,
            None => NodeStatus::Success,
        };

        let mut outcome = match status {
            NodeStatus::Fail => NodeOutcome::failure(format!("work node '{}' failed", node.id)),
            NodeStatus::Retry => NodeOutcome::retry(format!("work node '{}' asked to retry", node.id)),
            _ => {
                let mut outcome = NodeOutcome::success();
                outcome.status = status;
                outcome
            }
        };

        if let Some(output) = node.attrs.get_str("work.output") {
            outcome.context_updates.insert(
                format!("{}.output", node.id),
                Value::String(output.to_string()),
            );
        }
        Ok(outcome)
    }
}

fn sub_steps(node: &Node) -> Vec<String> {
    node.attrs
        .get_str("work.sub_steps")
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|step| !step.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AttrValue, GraphBuilder, sub_turn_channel, work_node};

    fn graph_with(node: Node) -> Graph {
        GraphBuilder::new("g").node(node).build()
    }

    #[tokio::test(flavor = "current_thread")]
    async fn work_handler_default_expected_success() {
        let node = work_node("build");
        let graph = graph_with(node.clone());

        let outcome = WorkHandler::new(None)
            .execute(&node, &RuntimeContext::new(), &graph)
            .await
            .expect("execution should succeed");
        assert_eq!(outcome.status, NodeStatus::Success);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn work_handler_scripted_fail_expected_fail_with_reason() {
        let mut node = work_node("build");
        node.attrs
            .set("work.outcome", AttrValue::String("fail".to_string()));
        let graph = graph_with(node.clone());

        let outcome = WorkHandler::new(None)
            .execute(&node, &RuntimeContext::new(), &graph)
            .await
            .expect("execution should succeed");
        assert_eq!(outcome.status, NodeStatus::Fail);
        assert!(outcome.failure_reason.is_some());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn work_handler_context_script_expected_wins_over_attr() {
        let mut node = work_node("build");
        node.attrs
            .set("work.outcome", AttrValue::String("fail".to_string()));
        let graph = graph_with(node.clone());
        let mut context = RuntimeContext::new();
        context.insert("work.build.outcome".to_string(), json!("success"));

        let outcome = WorkHandler::new(None)
            .execute(&node, &context, &graph)
            .await
            .expect("execution should succeed");
        assert_eq!(outcome.status, NodeStatus::Success);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn work_handler_sub_steps_expected_one_sub_turn_each() {
        let (sender, mut receiver) = sub_turn_channel();
        let mut node = work_node("build");
        node.attrs.set(
            "work.sub_steps",
            AttrValue::String("plan, draft ,refine".to_string()),
        );
        let graph = graph_with(node.clone());

        WorkHandler::new(Some(sender))
            .execute(&node, &RuntimeContext::new(), &graph)
            .await
            .expect("execution should succeed");

        let mut names = Vec::new();
        while let Ok(sub_turn) = receiver.try_recv() {
            names.push(sub_turn.name);
        }
        assert_eq!(names, vec!["plan", "draft", "refine"]);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn work_handler_output_attr_expected_context_update() {
        let mut node = work_node("build");
        node.attrs
            .set("work.output", AttrValue::String("artifact-7".to_string()));
        let graph = graph_with(node.clone());

        let outcome = WorkHandler::new(None)
            .execute(&node, &RuntimeContext::new(), &graph)
            .await
            .expect("execution should succeed");
        assert_eq!(
            outcome.context_updates.get("build.output"),
            Some(&json!("artifact-7"))
        );
    }
}
