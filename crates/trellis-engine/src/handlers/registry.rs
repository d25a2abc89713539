use crate::handlers::SharedNodeHandler;
use crate::{Node, NodeKind};
use std::collections::BTreeMap;

/// Maps a node to its handler. Resolution order: explicit `type` attr
/// override, then the node's kind, then the default handler. An
/// explicit dependency-injected object, never a process-wide global,
/// so runs in one process can carry different registries.
#[derive(Default)]
pub struct HandlerRegistry {
    by_kind: BTreeMap<&'static str, SharedNodeHandler>,
    by_type_name: BTreeMap<String, SharedNodeHandler>,
    default_kind: Option<NodeKind>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            by_kind: BTreeMap::new(),
            by_type_name: BTreeMap::new(),
            default_kind: Some(NodeKind::Work),
        }
    }

    pub fn register_kind(
        &mut self,
        kind: NodeKind,
        handler: SharedNodeHandler,
    ) -> Option<SharedNodeHandler> {
        self.by_kind.insert(kind.as_str(), handler)
    }

    pub fn register_type(
        &mut self,
        type_name: impl Into<String>,
        handler: SharedNodeHandler,
    ) -> Option<SharedNodeHandler> {
        self.by_type_name.insert(type_name.into(), handler)
    }

    pub fn set_default_kind(&mut self, kind: NodeKind) {
        self.default_kind = Some(kind);
    }

    pub fn resolve(&self, node: &Node) -> Option<SharedNodeHandler> {
        if let Some(type_name) = node.attrs.get_str("type") {
            let trimmed = type_name.trim();
            if !trimmed.is_empty() {
                if let Some(handler) = self.by_type_name.get(trimmed) {
                    return Some(handler.clone());
                }
            }
        }
        self.by_kind
            .get(node.kind.as_str())
            .cloned()
            .or_else(|| {
                self.default_kind
                    .and_then(|kind| self.by_kind.get(kind.as_str()).cloned())
            })
    }
}
