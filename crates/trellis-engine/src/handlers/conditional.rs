use crate::handlers::NodeHandler;
use crate::{EngineError, Graph, Node, NodeOutcome, RuntimeContext};
use async_trait::async_trait;

/// Pass-through: the decision happens in edge selection, where the
/// outgoing conditions are evaluated against this node's outcome.
#[derive(Debug, Default)]
pub struct ConditionalHandler;

#[async_trait]
impl NodeHandler for ConditionalHandler {
    async fn execute(
        &self,
        node: &Node,
        _context: &RuntimeContext,
        _graph: &Graph,
    ) -> Result<NodeOutcome, EngineError> {
        let mut outcome = NodeOutcome::success();
        outcome.notes = Some(format!("conditional node evaluated: {}", node.id));
        Ok(outcome)
    }
}
