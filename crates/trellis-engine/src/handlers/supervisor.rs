use crate::handlers::NodeHandler;
use crate::{
    EngineError, Graph, Node, NodeOutcome, NodeStatus, RuntimeContext, evaluate_condition_expression,
};
use async_trait::async_trait;
use serde_json::Value;

/// Bounded observe/steer loop over a child pipeline reported through
/// context. Each cycle reads the child's status, applies a steering
/// decision when one is queued, and stops on completion, failure, a
/// stop condition, or the cycle cap.
///
/// Context inputs:
/// - `supervisor.child.status` / `supervisor.child.status_sequence`
/// - `supervisor.child.outcome` / `supervisor.child.outcome_sequence`
/// - `supervisor.steer_decision`
///
/// Node attributes:
/// - `supervisor.max_cycles` (default 1000)
/// - `supervisor.stop_condition` (condition expression)
#[derive(Debug, Default)]
pub struct SupervisorHandler;

#[async_trait]
impl NodeHandler for SupervisorHandler {
    async fn execute(
        &self,
        node: &Node,
        context: &RuntimeContext,
        _graph: &Graph,
    ) -> Result<NodeOutcome, EngineError> {
        let max_cycles = node
            .attrs
            .get_i64("supervisor.max_cycles")
            .filter(|cycles| *cycles >= 1)
            .unwrap_or(1000) as usize;
        let stop_condition = node
            .attrs
            .get_str("supervisor.stop_condition")
            .unwrap_or_default()
            .trim()
            .to_string();

        for cycle in 1..=max_cycles {
            let status = child_value_at_cycle(context, "supervisor.child.status", cycle);
            let outcome = child_value_at_cycle(context, "supervisor.child.outcome", cycle);

            if let Some(status) = status.as_deref() {
                if status == "completed" && outcome.as_deref() == Some("success") {
                    return Ok(cycles_outcome(cycle, "child completed"));
                }
                if status == "failed" {
                    return Ok(NodeOutcome::failure("supervised child failed"));
                }
            }

            if !stop_condition.is_empty() {
                let marker = NodeOutcome::success();
                let passed = evaluate_condition_expression(&stop_condition, &marker, context)
                    .map_err(|error| {
                        EngineError::Runtime(format!(
                            "supervisor.stop_condition evaluation failed: {error}"
                        ))
                    })?;
                if passed {
                    return Ok(cycles_outcome(cycle, "stop condition satisfied"));
                }
            }

            if let Some(decision) = context
                .get("supervisor.steer_decision")
                .and_then(Value::as_str)
                .filter(|value| !value.trim().is_empty())
            {
                let mut outcome = cycles_outcome(cycle, "steering decision applied");
                outcome.context_updates.insert(
                    "supervisor.last_steer".to_string(),
                    Value::String(decision.to_string()),
                );
                return Ok(outcome);
            }
        }

        Ok(NodeOutcome::failure("supervisor max cycles exceeded"))
    }
}

fn cycles_outcome(cycle: usize, note: &str) -> NodeOutcome {
    let mut outcome = NodeOutcome::success();
    outcome.status = NodeStatus::Success;
    outcome.notes = Some(note.to_string());
    outcome.context_updates.insert(
        "supervisor.cycles".to_string(),
        Value::Number((cycle as u64).into()),
    );
    outcome
}

fn child_value_at_cycle(context: &RuntimeContext, key: &str, cycle: usize) -> Option<String> {
    let sequence_key = format!("{key}_sequence");
    context
        .get(&sequence_key)
        .and_then(Value::as_array)
        .and_then(|entries| entries.get(cycle.saturating_sub(1)))
        .and_then(Value::as_str)
        .map(ToOwned::to_owned)
        .or_else(|| {
            context
                .get(key)
                .and_then(Value::as_str)
                .map(ToOwned::to_owned)
        })
}
