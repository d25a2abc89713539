use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type LineageId = String;
pub type TurnId = String;
pub type BlobHash = String;

/// Sentinel parent id for the first turn of a fresh lineage.
pub const ROOT_TURN_ID: &str = "0";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lineage {
    pub lineage_id: LineageId,
    pub head_turn_id: TurnId,
    pub head_depth: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredTurnRef {
    pub lineage_id: LineageId,
    pub turn_id: TurnId,
    pub depth: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendTurnRequest {
    pub lineage_id: LineageId,
    pub parent_turn_id: Option<TurnId>,
    pub type_id: String,
    pub type_version: u32,
    pub payload: Vec<u8>,
    pub idempotency_key: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredTurn {
    pub lineage_id: LineageId,
    pub turn_id: TurnId,
    pub parent_turn_id: TurnId,
    pub depth: u32,
    pub type_id: String,
    pub type_version: u32,
    pub payload: Vec<u8>,
    pub idempotency_key: Option<String>,
    pub content_hash: Option<BlobHash>,
}

/// Lightweight listing entry for status tooling.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineageSummary {
    pub lineage_id: LineageId,
    pub head_turn_id: TurnId,
    pub head_depth: u32,
    pub head_type_id: Option<String>,
    pub forked_from: Option<TurnId>,
}

/// Correlation block carried inside every engine-produced turn payload.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnCorrelation {
    pub run_id: Option<String>,
    pub lineage_id: Option<LineageId>,
    pub node_id: Option<String>,
    pub attempt_id: Option<String>,
    pub branch_id: Option<String>,
    pub parent_turn_id: Option<TurnId>,
    pub sequence_no: Option<u64>,
}

/// Common JSON envelope for engine turn payloads.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TurnEnvelope {
    pub schema_version: u32,
    pub run_id: Option<String>,
    pub node_id: Option<String>,
    pub attempt_id: Option<String>,
    pub event_kind: String,
    pub timestamp: String,
    pub payload: Value,
    pub correlation: TurnCorrelation,
}

fn encode_part(part: &str) -> String {
    format!("{}:{}", part.len(), part)
}

/// Length-prefixed key so re-appends after a crash dedupe instead of
/// duplicating history.
pub fn pipeline_idempotency_key(
    run_id: &str,
    node_id: &str,
    attempt_id: &str,
    event_kind: &str,
    sequence_no: u64,
) -> String {
    format!(
        "trellis:v1|{}|{}|{}|{}|{}",
        encode_part(run_id),
        encode_part(node_id),
        encode_part(attempt_id),
        encode_part(event_kind),
        sequence_no
    )
}
