use serde_json::Value;
use trellis_turnlog::{TurnCorrelation, TurnEnvelope};

pub const LIFECYCLE_TURN_TYPE_ID: &str = "trellis.lifecycle";
pub const NODE_EVENT_TURN_TYPE_ID: &str = "trellis.node_event";
pub const CHECKPOINT_TURN_TYPE_ID: &str = "trellis.checkpoint";
pub const SUB_TURN_TYPE_ID: &str = "trellis.sub_turn";
pub const PARALLEL_EVENT_TURN_TYPE_ID: &str = "trellis.parallel_event";
pub const MERGE_CONFLICT_TURN_TYPE_ID: &str = "trellis.merge_conflict";

pub const LIFECYCLE_STARTED: &str = "lifecycle_started";
pub const LIFECYCLE_COMPLETED: &str = "lifecycle_completed";
pub const LIFECYCLE_FAILED: &str = "lifecycle_failed";
pub const LIFECYCLE_PAUSED: &str = "lifecycle_paused";

pub const NODE_STARTED: &str = "node_started";
pub const NODE_COMPLETED: &str = "node_completed";
pub const NODE_FAILED: &str = "node_failed";
pub const NODE_RETRYING: &str = "node_retrying";

pub const CHECKPOINT_SAVED: &str = "checkpoint_saved";
pub const SUB_NODE_TURN: &str = "sub_node_turn";

pub const BRANCH_STARTED: &str = "parallel_branch_started";
pub const BRANCH_COMPLETED: &str = "parallel_branch_completed";
pub const MERGE_CONFLICT_RECORDED: &str = "merge_conflict_recorded";

pub(crate) fn terminal_lifecycle_kinds() -> [&'static str; 2] {
    [LIFECYCLE_COMPLETED, LIFECYCLE_FAILED]
}

pub fn envelope(
    run_id: &str,
    event_kind: &str,
    timestamp: String,
    payload: Value,
    correlation: TurnCorrelation,
) -> TurnEnvelope {
    TurnEnvelope {
        schema_version: 1,
        run_id: Some(run_id.to_string()),
        node_id: correlation.node_id.clone(),
        attempt_id: correlation.attempt_id.clone(),
        event_kind: event_kind.to_string(),
        timestamp,
        payload,
        correlation,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_expected_correlation_mirrored_into_header() {
        let built = envelope(
            "run-1",
            NODE_STARTED,
            "1.000Z".to_string(),
            json!({}),
            TurnCorrelation {
                run_id: Some("run-1".to_string()),
                node_id: Some("plan".to_string()),
                attempt_id: Some("plan:1".to_string()),
                sequence_no: Some(2),
                ..TurnCorrelation::default()
            },
        );

        assert_eq!(built.node_id.as_deref(), Some("plan"));
        assert_eq!(built.attempt_id.as_deref(), Some("plan:1"));
        assert_eq!(built.event_kind, NODE_STARTED);
    }
}
