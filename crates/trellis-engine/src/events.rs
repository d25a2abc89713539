use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RuntimeEvent {
    pub sequence_no: u64,
    pub timestamp: String,
    pub kind: RuntimeEventKind,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum RuntimeEventKind {
    Pipeline(PipelineEvent),
    Node(NodeEvent),
    Parallel(ParallelEvent),
    Checkpoint(CheckpointEvent),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PipelineEvent {
    Started { run_id: String, graph_id: String },
    Resumed { run_id: String, graph_id: String },
    Completed { run_id: String, graph_id: String },
    Paused { run_id: String, graph_id: String, next_node: Option<String> },
    Failed { run_id: String, graph_id: String, reason: String },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeEvent {
    Started {
        run_id: String,
        node_id: String,
        attempt: u32,
    },
    Completed {
        run_id: String,
        node_id: String,
        attempt: u32,
        status: String,
        notes: Option<String>,
    },
    Failed {
        run_id: String,
        node_id: String,
        attempt: u32,
        status: String,
        notes: Option<String>,
        will_retry: bool,
    },
    Retrying {
        run_id: String,
        node_id: String,
        attempt: u32,
        next_attempt: u32,
        delay_ms: u64,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParallelEvent {
    Started {
        run_id: String,
        node_id: String,
        branch_count: usize,
    },
    BranchStarted {
        run_id: String,
        node_id: String,
        branch_id: String,
        target_node: String,
    },
    BranchCompleted {
        run_id: String,
        node_id: String,
        branch_id: String,
        target_node: String,
        status: String,
    },
    MergeConflict {
        run_id: String,
        node_id: String,
        conflicting_paths: Vec<String>,
    },
    Completed {
        run_id: String,
        node_id: String,
        success_count: usize,
        failure_count: usize,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CheckpointEvent {
    Saved {
        run_id: String,
        node_id: String,
        turn_id: String,
    },
}

pub trait RuntimeEventObserver: Send + Sync {
    fn on_event(&self, event: &RuntimeEvent);
}

impl<F> RuntimeEventObserver for F
where
    F: Fn(&RuntimeEvent) + Send + Sync,
{
    fn on_event(&self, event: &RuntimeEvent) {
        self(event);
    }
}

pub type SharedRuntimeEventObserver = Arc<dyn RuntimeEventObserver>;
pub type RuntimeEventSender = mpsc::UnboundedSender<RuntimeEvent>;
pub type RuntimeEventReceiver = mpsc::UnboundedReceiver<RuntimeEvent>;

#[derive(Clone, Default)]
pub struct RuntimeEventSink {
    observer: Option<SharedRuntimeEventObserver>,
    sender: Option<RuntimeEventSender>,
}

impl RuntimeEventSink {
    pub fn with_observer(observer: SharedRuntimeEventObserver) -> Self {
        Self {
            observer: Some(observer),
            sender: None,
        }
    }

    pub fn with_sender(sender: RuntimeEventSender) -> Self {
        Self {
            observer: None,
            sender: Some(sender),
        }
    }

    pub fn observer(mut self, observer: SharedRuntimeEventObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn sender(mut self, sender: RuntimeEventSender) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.observer.is_some() || self.sender.is_some()
    }

    pub fn emit(&self, event: RuntimeEvent) {
        if let Some(observer) = self.observer.as_ref() {
            observer.on_event(&event);
        }
        if let Some(sender) = self.sender.as_ref() {
            let _ = sender.send(event);
        }
    }
}

pub fn runtime_event_channel() -> (RuntimeEventSender, RuntimeEventReceiver) {
    mpsc::unbounded_channel()
}
