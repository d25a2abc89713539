use crate::handlers::NodeHandler;
use crate::{EngineError, Graph, Node, NodeOutcome, RuntimeContext};
use async_trait::async_trait;

#[derive(Debug, Default)]
pub struct ExitHandler;

#[async_trait]
impl NodeHandler for ExitHandler {
    async fn execute(
        &self,
        node: &Node,
        _context: &RuntimeContext,
        _graph: &Graph,
    ) -> Result<NodeOutcome, EngineError> {
        let mut outcome = NodeOutcome::success();
        outcome.notes = Some(format!("reached exit node '{}'", node.id));
        Ok(outcome)
    }
}
