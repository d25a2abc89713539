use crate::{EngineError, NodeStatus, RuntimeContext};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The runner's full mutable state. Exactly what a checkpoint carries
/// and exactly what resume reconstructs.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub current_node: String,
    pub completed_nodes: Vec<String>,
    pub context: RuntimeContext,
    pub retry_counters: BTreeMap<String, u32>,
    pub visited_outcomes: BTreeMap<String, NodeStatus>,
    pub reroute_count: u32,
}

/// One checkpoint turn's payload: the run state plus the next node
/// already resolved, appended after every node completes and before
/// the edge advance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub schema_version: u32,
    pub run_id: String,
    pub sequence_no: u64,
    pub state: RunState,
    pub next_node_id: Option<String>,
    /// Context-carry mode resolved for the node about to be
    /// dispatched; resume reads it to apply the one-step degrade.
    pub next_node_carry: Option<String>,
    /// Revision of the shared external resource at checkpoint time,
    /// present only when a workspace driver is attached.
    pub workspace_revision: Option<String>,
}

pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;

impl CheckpointState {
    pub fn encode(&self) -> Result<Vec<u8>, EngineError> {
        serde_json::to_vec(self)
            .map_err(|error| EngineError::Runtime(format!("failed to serialize checkpoint: {error}")))
    }

    pub fn decode(payload: &[u8]) -> Result<Self, EngineError> {
        serde_json::from_slice(payload).map_err(|error| {
            EngineError::Runtime(format!("failed to deserialize checkpoint: {error}"))
        })
    }

    pub fn content_hash(&self) -> Result<String, EngineError> {
        Ok(blake3::hash(&self.encode()?).to_hex().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> CheckpointState {
        CheckpointState {
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            run_id: "run-1".to_string(),
            sequence_no: 5,
            state: RunState {
                current_node: "plan".to_string(),
                completed_nodes: vec!["start".to_string(), "plan".to_string()],
                context: BTreeMap::from([
                    ("plan.status".to_string(), json!("done")),
                    ("attempts".to_string(), json!(2)),
                ]),
                retry_counters: BTreeMap::from([("plan".to_string(), 1)]),
                visited_outcomes: BTreeMap::from([
                    ("start".to_string(), NodeStatus::Success),
                    ("plan".to_string(), NodeStatus::PartialSuccess),
                ]),
                reroute_count: 1,
            },
            next_node_id: Some("review".to_string()),
            next_node_carry: Some("full".to_string()),
            workspace_revision: Some("rev-3".to_string()),
        }
    }

    #[test]
    fn checkpoint_round_trip_expected_identical_state() {
        let checkpoint = sample();
        let encoded = checkpoint.encode().expect("checkpoint should encode");
        let decoded = CheckpointState::decode(&encoded).expect("checkpoint should decode");
        assert_eq!(decoded, checkpoint);
    }

    #[test]
    fn checkpoint_content_hash_expected_stable() {
        let checkpoint = sample();
        assert_eq!(
            checkpoint.content_hash().expect("hash should compute"),
            checkpoint.content_hash().expect("hash should compute")
        );
    }

    #[test]
    fn run_state_round_trip_arbitrary_maps_expected_equal() {
        let state = RunState {
            current_node: "x".to_string(),
            completed_nodes: vec!["a".to_string(), "b".to_string(), "a".to_string()],
            context: BTreeMap::from([("k".to_string(), json!({"nested": [1, 2, 3]}))]),
            retry_counters: BTreeMap::from([("a".to_string(), 0), ("b".to_string(), 7)]),
            visited_outcomes: BTreeMap::from([
                ("a".to_string(), NodeStatus::Fail),
                ("b".to_string(), NodeStatus::Retry),
            ]),
            reroute_count: 3,
        };

        let encoded = serde_json::to_vec(&state).expect("state should serialize");
        let decoded: RunState = serde_json::from_slice(&encoded).expect("state should deserialize");
        assert_eq!(decoded, state);
    }

    #[test]
    fn checkpoint_decode_garbage_expected_runtime_error() {
        let error = CheckpointState::decode(b"not json").expect_err("decode should fail");
        assert!(matches!(error, EngineError::Runtime(_)));
    }
}
