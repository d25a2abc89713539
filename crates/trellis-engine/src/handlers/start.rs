use crate::handlers::NodeHandler;
use crate::{EngineError, Graph, Node, NodeOutcome, RuntimeContext};
use async_trait::async_trait;
use serde_json::Value;

#[derive(Debug, Default)]
pub struct StartHandler;

#[async_trait]
impl NodeHandler for StartHandler {
    async fn execute(
        &self,
        _node: &Node,
        _context: &RuntimeContext,
        graph: &Graph,
    ) -> Result<NodeOutcome, EngineError> {
        let mut outcome = NodeOutcome::success();
        if let Some(goal) = graph.goal.as_deref() {
            outcome
                .context_updates
                .insert("graph.goal".to_string(), Value::String(goal.to_string()));
        }
        Ok(outcome)
    }
}
