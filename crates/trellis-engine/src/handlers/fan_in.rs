use crate::handlers::NodeHandler;
use crate::{EngineError, Graph, Node, NodeOutcome, NodeStatus, RuntimeContext};
use async_trait::async_trait;
use serde_json::{Value, json};

#[derive(Clone, Debug)]
struct Candidate {
    id: String,
    status: NodeStatus,
    score: f64,
}

/// Evaluates the branch results the coordinator left in context under
/// `parallel.results`: ranks candidates by status then score and
/// publishes the best one for downstream routing.
#[derive(Debug, Default)]
pub struct FanInHandler;

#[async_trait]
impl NodeHandler for FanInHandler {
    async fn execute(
        &self,
        _node: &Node,
        context: &RuntimeContext,
        _graph: &Graph,
    ) -> Result<NodeOutcome, EngineError> {
        let Some(results) = context.get("parallel.results").and_then(Value::as_array) else {
            return Ok(NodeOutcome::failure("no parallel results to evaluate"));
        };
        let mut candidates: Vec<Candidate> =
            results.iter().filter_map(candidate_from_value).collect();
        if candidates.is_empty() {
            return Ok(NodeOutcome::failure("no parseable parallel results"));
        }

        candidates.sort_by(|left, right| {
            rank_status(left.status)
                .cmp(&rank_status(right.status))
                .then_with(|| {
                    right
                        .score
                        .partial_cmp(&left.score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| left.id.cmp(&right.id))
        });
        let best = candidates[0].clone();

        let all_failed = candidates
            .iter()
            .all(|candidate| candidate.status == NodeStatus::Fail);

        let mut outcome = NodeOutcome::success();
        outcome.status = if all_failed {
            NodeStatus::Fail
        } else {
            NodeStatus::Success
        };
        outcome.notes = Some(format!(
            "selected best branch: {} ({})",
            best.id,
            best.status.as_str()
        ));
        outcome
            .context_updates
            .insert("parallel.best_id".to_string(), Value::String(best.id));
        outcome.context_updates.insert(
            "parallel.best_status".to_string(),
            Value::String(best.status.as_str().to_string()),
        );
        outcome
            .context_updates
            .insert("parallel.best_score".to_string(), json!(best.score));
        Ok(outcome)
    }
}

fn candidate_from_value(value: &Value) -> Option<Candidate> {
    let object = value.as_object()?;
    let id = object
        .get("branch_id")
        .and_then(Value::as_str)
        .or_else(|| object.get("target_node").and_then(Value::as_str))?
        .to_string();
    let status = object
        .get("status")
        .and_then(Value::as_str)
        .and_then(|raw| NodeStatus::try_from(raw).ok())
        .unwrap_or(NodeStatus::Fail);
    let score = object.get("score").and_then(Value::as_f64).unwrap_or(0.0);
    Some(Candidate { id, status, score })
}

fn rank_status(status: NodeStatus) -> u8 {
    match status {
        NodeStatus::Success => 0,
        NodeStatus::PartialSuccess => 1,
        NodeStatus::Retry => 2,
        NodeStatus::Fail => 3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{GraphBuilder, NodeKind};

    fn fan_in_node() -> (Node, Graph) {
        let node = Node::new("join", NodeKind::FanIn);
        let graph = GraphBuilder::new("g").node(node.clone()).build();
        (node, graph)
    }

    #[tokio::test(flavor = "current_thread")]
    async fn fan_in_selects_best_candidate_expected_success() {
        let (node, graph) = fan_in_node();
        let mut context = RuntimeContext::new();
        context.insert(
            "parallel.results".to_string(),
            json!([
                {"branch_id": "a", "status": "partial_success", "score": 0.4},
                {"branch_id": "b", "status": "success", "score": 0.1},
                {"branch_id": "c", "status": "success", "score": 0.9}
            ]),
        );

        let outcome = FanInHandler
            .execute(&node, &context, &graph)
            .await
            .expect("execution should succeed");

        assert_eq!(outcome.status, NodeStatus::Success);
        assert_eq!(
            outcome.context_updates.get("parallel.best_id"),
            Some(&Value::String("c".to_string()))
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn fan_in_all_failed_expected_fail() {
        let (node, graph) = fan_in_node();
        let mut context = RuntimeContext::new();
        context.insert(
            "parallel.results".to_string(),
            json!([
                {"branch_id": "a", "status": "fail", "score": 0.4},
                {"branch_id": "b", "status": "fail", "score": 0.9}
            ]),
        );

        let outcome = FanInHandler
            .execute(&node, &context, &graph)
            .await
            .expect("execution should succeed");
        assert_eq!(outcome.status, NodeStatus::Fail);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn fan_in_without_results_expected_fail() {
        let (node, graph) = fan_in_node();
        let outcome = FanInHandler
            .execute(&node, &RuntimeContext::new(), &graph)
            .await
            .expect("execution should succeed");
        assert_eq!(outcome.status, NodeStatus::Fail);
    }
}
