use crate::handlers::NodeHandler;
use crate::{EngineError, Graph, Node, NodeOutcome, RuntimeContext};
use async_trait::async_trait;
use serde_json::Value;

/// Simulated command surface: the real adapter runs behind the same
/// seam. `tool.command` is required; `tool.output` overrides the
/// simulated result.
#[derive(Debug, Default)]
pub struct ToolHandler;

#[async_trait]
impl NodeHandler for ToolHandler {
    async fn execute(
        &self,
        node: &Node,
        _context: &RuntimeContext,
        _graph: &Graph,
    ) -> Result<NodeOutcome, EngineError> {
        let command = node.attrs.get_str("tool.command").unwrap_or_default().trim();
        if command.is_empty() {
            return Ok(NodeOutcome::failure(format!(
                "tool node '{}' has no tool.command",
                node.id
            )));
        }

        let output = node
            .attrs
            .get_str("tool.output")
            .map(ToOwned::to_owned)
            .unwrap_or_else(|| format!("[simulated tool output] {command}"));

        let mut outcome = NodeOutcome::success();
        outcome.notes = Some(format!("tool completed: {command}"));
        outcome
            .context_updates
            .insert("tool.output".to_string(), Value::String(output));
        Ok(outcome)
    }
}
