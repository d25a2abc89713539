use crate::handlers::{self, HandlerRegistry};
use crate::workspace::SharedWorkspaceDriver;
use crate::{RetryBackoffConfig, RuntimeContext, RuntimeEventSink};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use trellis_turnlog::SharedTurnLog;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Success,
    PartialSuccess,
    Retry,
    Fail,
}

impl NodeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::PartialSuccess => "partial_success",
            Self::Retry => "retry",
            Self::Fail => "fail",
        }
    }

    pub fn is_success_like(self) -> bool {
        matches!(self, Self::Success | Self::PartialSuccess)
    }
}

impl TryFrom<&str> for NodeStatus {
    type Error = crate::EngineError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "success" => Ok(Self::Success),
            "partial_success" => Ok(Self::PartialSuccess),
            "retry" => Ok(Self::Retry),
            "fail" => Ok(Self::Fail),
            other => Err(crate::EngineError::Runtime(format!(
                "unknown node status '{other}'"
            ))),
        }
    }
}

/// Result of one node execution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeOutcome {
    pub status: NodeStatus,
    pub notes: Option<String>,
    pub failure_reason: Option<String>,
    pub context_updates: RuntimeContext,
    pub preferred_label: Option<String>,
    pub suggested_next_ids: Vec<String>,
}

impl NodeOutcome {
    pub fn success() -> Self {
        Self {
            status: NodeStatus::Success,
            notes: None,
            failure_reason: None,
            context_updates: RuntimeContext::new(),
            preferred_label: None,
            suggested_next_ids: Vec::new(),
        }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            status: NodeStatus::Fail,
            notes: Some(reason.clone()),
            failure_reason: Some(reason),
            context_updates: RuntimeContext::new(),
            preferred_label: None,
            suggested_next_ids: Vec::new(),
        }
    }

    pub fn retry(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            status: NodeStatus::Retry,
            notes: Some(reason.clone()),
            failure_reason: Some(reason),
            context_updates: RuntimeContext::new(),
            preferred_label: None,
            suggested_next_ids: Vec::new(),
        }
    }

    pub fn with_update(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context_updates.insert(key.into(), value);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
}

impl RunPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PipelineRunResult {
    pub run_id: String,
    pub lineage_id: Option<String>,
    pub phase: RunPhase,
    pub failure_reason: Option<String>,
    pub completed_nodes: Vec<String>,
    pub node_outcomes: BTreeMap<String, NodeOutcome>,
    pub context: RuntimeContext,
}

/// Cooperative pause. Requesting a pause never preempts an in-flight
/// node; the runner honors it after the next checkpoint append.
#[derive(Clone, Debug)]
pub struct PauseSignal {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl PauseSignal {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    pub fn request_pause(&self) {
        let _ = self.sender.send(true);
    }

    pub fn clear(&self) {
        let _ = self.sender.send(false);
    }

    pub fn is_requested(&self) -> bool {
        *self.receiver.borrow()
    }
}

impl Default for PauseSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// One internal turn of a handler that subdivides its node. Emitted
/// through the channel below and appended to the log by the runner,
/// preserving fine-grained resumability without an async handler seam.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubTurn {
    pub name: String,
    pub payload: Value,
}

pub type SubTurnSender = mpsc::UnboundedSender<SubTurn>;
pub type SubTurnReceiver = mpsc::UnboundedReceiver<SubTurn>;

pub fn sub_turn_channel() -> (SubTurnSender, SubTurnReceiver) {
    mpsc::unbounded_channel()
}

#[derive(Clone)]
pub struct RunConfig {
    pub run_id: Option<String>,
    /// Fork point: continue history from this turn instead of a fresh
    /// lineage.
    pub base_turn_id: Option<String>,
    pub log: Option<SharedTurnLog>,
    pub registry: Arc<HandlerRegistry>,
    pub events: RuntimeEventSink,
    pub retry_backoff: Option<RetryBackoffConfig>,
    pub pause: PauseSignal,
    pub workspace: Option<SharedWorkspaceDriver>,
    pub max_reroutes: u32,
    pub sub_turns: Option<Arc<tokio::sync::Mutex<SubTurnReceiver>>>,
}

impl RunConfig {
    pub fn with_sub_turn_receiver(mut self, receiver: SubTurnReceiver) -> Self {
        self.sub_turns = Some(Arc::new(tokio::sync::Mutex::new(receiver)));
        self
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            run_id: None,
            base_turn_id: None,
            log: None,
            registry: Arc::new(handlers::core_registry()),
            events: RuntimeEventSink::default(),
            retry_backoff: None,
            pause: PauseSignal::new(),
            workspace: None,
            max_reroutes: 16,
            sub_turns: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_outcome_failure_expected_reason_mirrored() {
        let outcome = NodeOutcome::failure("boom");
        assert_eq!(outcome.status, NodeStatus::Fail);
        assert_eq!(outcome.failure_reason.as_deref(), Some("boom"));
        assert_eq!(outcome.notes.as_deref(), Some("boom"));
    }

    #[test]
    fn pause_signal_expected_visible_after_request() {
        let pause = PauseSignal::new();
        assert!(!pause.is_requested());
        pause.request_pause();
        assert!(pause.is_requested());
        pause.clear();
        assert!(!pause.is_requested());
    }

    #[test]
    fn node_status_round_trip_expected_same_variant() {
        for status in [
            NodeStatus::Success,
            NodeStatus::PartialSuccess,
            NodeStatus::Retry,
            NodeStatus::Fail,
        ] {
            assert_eq!(NodeStatus::try_from(status.as_str()).expect("parse"), status);
        }
    }
}
