use crate::{EngineError, Graph, Node, NodeOutcome, RuntimeContext};
use async_trait::async_trait;
use std::sync::Arc;

pub mod conditional;
pub mod exit;
pub mod fan_in;
pub mod registry;
pub mod start;
pub mod supervisor;
pub mod tool;
pub mod wait_human;
pub mod work;

pub use registry::HandlerRegistry;

/// One node's work. Implementations are dispatched through the
/// registry and are free to do anything behind this seam; the engine
/// only consumes the outcome.
#[async_trait]
pub trait NodeHandler: Send + Sync {
    async fn execute(
        &self,
        node: &Node,
        context: &RuntimeContext,
        graph: &Graph,
    ) -> Result<NodeOutcome, EngineError>;
}

pub type SharedNodeHandler = Arc<dyn NodeHandler>;

pub fn core_registry() -> registry::HandlerRegistry {
    let mut registry = registry::HandlerRegistry::new();
    registry.register_kind(crate::NodeKind::Start, Arc::new(start::StartHandler));
    registry.register_kind(crate::NodeKind::Exit, Arc::new(exit::ExitHandler));
    registry.register_kind(crate::NodeKind::Work, Arc::new(work::WorkHandler::new(None)));
    registry.register_kind(
        crate::NodeKind::Conditional,
        Arc::new(conditional::ConditionalHandler),
    );
    registry.register_kind(crate::NodeKind::Tool, Arc::new(tool::ToolHandler));
    registry.register_kind(
        crate::NodeKind::HumanWait,
        Arc::new(wait_human::WaitHumanHandler::new(Arc::new(
            wait_human::AutoApproveInterviewer,
        ))),
    );
    registry.register_kind(
        crate::NodeKind::Supervisor,
        Arc::new(supervisor::SupervisorHandler),
    );
    registry.register_kind(crate::NodeKind::FanIn, Arc::new(fan_in::FanInHandler));
    registry
}
