use crate::{CheckpointState, EngineError, SubTurn};
use serde_json::{Value, json};
use std::time::{SystemTime, UNIX_EPOCH};
use trellis_turnlog::{
    AppendTurnRequest, LineageId, SharedTurnLog, StoredTurn, TurnCorrelation, TurnId,
    pipeline_idempotency_key,
};

pub mod types;

pub use types::*;

/// The engine's sequenced writer over the turn log: one instance per
/// lineage segment, tracking the append sequence used for idempotency
/// keys. Every persistence path of the runner goes through here; an
/// append failure propagates so the runner never advances past an
/// unpersisted checkpoint.
pub struct RunLog {
    log: Option<SharedTurnLog>,
    run_id: String,
    lineage_id: Option<LineageId>,
    branch_id: Option<String>,
    sequence_no: u64,
    last_turn_id: Option<TurnId>,
}

impl RunLog {
    pub async fn open(
        log: Option<SharedTurnLog>,
        run_id: String,
        base_turn_id: Option<TurnId>,
    ) -> Result<Self, EngineError> {
        let lineage_id = match log.as_ref() {
            Some(log) => Some(log.create_lineage(base_turn_id).await?.lineage_id),
            None => None,
        };
        Ok(Self {
            log,
            run_id,
            lineage_id,
            branch_id: None,
            sequence_no: 0,
            last_turn_id: None,
        })
    }

    /// Attaches to an existing lineage instead of opening a new one
    /// (the resume path).
    pub fn attach(
        log: SharedTurnLog,
        run_id: String,
        lineage_id: LineageId,
        sequence_no: u64,
    ) -> Self {
        Self {
            log: Some(log),
            run_id,
            lineage_id: Some(lineage_id),
            branch_id: None,
            sequence_no,
            last_turn_id: None,
        }
    }

    /// Branch segment writer: forks the lineage at its current head so
    /// the branch's turns live in their own segment sharing the parent
    /// history.
    pub async fn open_branch(&self, branch_id: &str) -> Result<RunLog, EngineError> {
        let Some(log) = self.log.as_ref() else {
            return Ok(RunLog {
                log: None,
                run_id: self.run_id.clone(),
                lineage_id: None,
                branch_id: Some(branch_id.to_string()),
                sequence_no: 0,
                last_turn_id: None,
            });
        };
        let lineage_id = self.lineage_id.as_ref().ok_or_else(|| {
            EngineError::Runtime("branch fork requested without a lineage".to_string())
        })?;
        let head = log.get_head(lineage_id).await?;
        let branch_lineage = log.create_lineage(Some(head.turn_id)).await?;
        Ok(RunLog {
            log: Some(log.clone()),
            run_id: self.run_id.clone(),
            lineage_id: Some(branch_lineage.lineage_id),
            branch_id: Some(branch_id.to_string()),
            sequence_no: 0,
            last_turn_id: None,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn lineage_id(&self) -> Option<&LineageId> {
        self.lineage_id.as_ref()
    }

    pub fn last_turn_id(&self) -> Option<&TurnId> {
        self.last_turn_id.as_ref()
    }

    pub fn sequence_no(&self) -> u64 {
        self.sequence_no
    }

    pub async fn append_lifecycle(
        &mut self,
        event_kind: &str,
        payload: Value,
    ) -> Result<Option<StoredTurn>, EngineError> {
        self.append(LIFECYCLE_TURN_TYPE_ID, event_kind, None, None, payload)
            .await
    }

    pub async fn append_node_event(
        &mut self,
        node_id: &str,
        attempt_id: &str,
        event_kind: &str,
        payload: Value,
    ) -> Result<Option<StoredTurn>, EngineError> {
        self.append(
            NODE_EVENT_TURN_TYPE_ID,
            event_kind,
            Some(node_id),
            Some(attempt_id),
            payload,
        )
        .await
    }

    pub async fn append_checkpoint(
        &mut self,
        node_id: &str,
        attempt_id: &str,
        checkpoint: &CheckpointState,
    ) -> Result<Option<StoredTurn>, EngineError> {
        let payload = json!({
            "checkpoint": serde_json::to_value(checkpoint).map_err(|error| {
                EngineError::Runtime(format!("failed to serialize checkpoint: {error}"))
            })?,
            "checkpoint_hash": checkpoint.content_hash()?,
        });
        self.append(
            CHECKPOINT_TURN_TYPE_ID,
            CHECKPOINT_SAVED,
            Some(node_id),
            Some(attempt_id),
            payload,
        )
        .await
    }

    pub async fn append_sub_turn(
        &mut self,
        node_id: &str,
        attempt_id: &str,
        sub_turn: &SubTurn,
    ) -> Result<Option<StoredTurn>, EngineError> {
        self.append(
            SUB_TURN_TYPE_ID,
            SUB_NODE_TURN,
            Some(node_id),
            Some(attempt_id),
            json!({ "name": sub_turn.name, "payload": sub_turn.payload }),
        )
        .await
    }

    pub async fn append_branch_event(
        &mut self,
        node_id: &str,
        branch_id: &str,
        event_kind: &str,
        payload: Value,
    ) -> Result<Option<StoredTurn>, EngineError> {
        self.append(
            PARALLEL_EVENT_TURN_TYPE_ID,
            event_kind,
            Some(node_id),
            Some(branch_id),
            payload,
        )
        .await
    }

    pub async fn append_merge_conflict(
        &mut self,
        node_id: &str,
        payload: Value,
    ) -> Result<Option<StoredTurn>, EngineError> {
        self.append(
            MERGE_CONFLICT_TURN_TYPE_ID,
            MERGE_CONFLICT_RECORDED,
            Some(node_id),
            None,
            payload,
        )
        .await
    }

    async fn append(
        &mut self,
        type_id: &str,
        event_kind: &str,
        node_id: Option<&str>,
        attempt_id: Option<&str>,
        payload: Value,
    ) -> Result<Option<StoredTurn>, EngineError> {
        let sequence_no = self.next_sequence_no();
        let Some(log) = self.log.as_ref() else {
            return Ok(None);
        };
        let lineage_id = self
            .lineage_id
            .as_ref()
            .ok_or_else(|| EngineError::Runtime("append without a lineage".to_string()))?
            .clone();

        let correlation = TurnCorrelation {
            run_id: Some(self.run_id.clone()),
            lineage_id: Some(lineage_id.clone()),
            node_id: node_id.map(str::to_string),
            attempt_id: attempt_id.map(str::to_string),
            branch_id: self.branch_id.clone(),
            parent_turn_id: self.last_turn_id.clone(),
            sequence_no: Some(sequence_no),
        };
        let envelope = envelope(
            &self.run_id,
            event_kind,
            timestamp_now(),
            payload,
            correlation,
        );
        let encoded = serde_json::to_vec(&envelope).map_err(|error| {
            EngineError::Runtime(format!("failed to serialize turn envelope: {error}"))
        })?;

        let idempotency_key = pipeline_idempotency_key(
            &self.run_id,
            node_id.unwrap_or("__run__"),
            attempt_id.unwrap_or("__run__"),
            event_kind,
            sequence_no,
        );
        let turn = log
            .append_turn(AppendTurnRequest {
                lineage_id,
                parent_turn_id: None,
                type_id: type_id.to_string(),
                type_version: 1,
                payload: encoded,
                idempotency_key,
            })
            .await?;
        self.last_turn_id = Some(turn.turn_id.clone());
        Ok(Some(turn))
    }

    fn next_sequence_no(&mut self) -> u64 {
        self.sequence_no += 1;
        self.sequence_no
    }
}

pub fn timestamp_now() -> String {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!(
        "{}.{:03}Z",
        since_epoch.as_secs(),
        since_epoch.subsec_millis()
    )
}

pub fn decode_envelope(turn: &StoredTurn) -> Result<trellis_turnlog::TurnEnvelope, EngineError> {
    serde_json::from_slice(&turn.payload).map_err(|error| {
        EngineError::Runtime(format!(
            "failed to decode turn {} envelope: {error}",
            turn.turn_id
        ))
    })
}

pub fn decode_checkpoint_turn(turn: &StoredTurn) -> Result<CheckpointState, EngineError> {
    let envelope = decode_envelope(turn)?;
    let checkpoint = envelope.payload.get("checkpoint").ok_or_else(|| {
        EngineError::Runtime(format!(
            "turn {} has no checkpoint payload",
            turn.turn_id
        ))
    })?;
    serde_json::from_value(checkpoint.clone()).map_err(|error| {
        EngineError::Runtime(format!(
            "failed to decode checkpoint in turn {}: {error}",
            turn.turn_id
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CHECKPOINT_SCHEMA_VERSION, RunState};
    use std::sync::Arc;
    use trellis_turnlog::{MemoryTurnLog, TurnLog};

    fn checkpoint(run_id: &str, sequence_no: u64) -> CheckpointState {
        CheckpointState {
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            run_id: run_id.to_string(),
            sequence_no,
            state: RunState::default(),
            next_node_id: Some("next".to_string()),
            next_node_carry: None,
            workspace_revision: None,
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn run_log_append_expected_sequenced_turns() {
        let log: SharedTurnLog = Arc::new(MemoryTurnLog::new());
        let mut run_log = RunLog::open(Some(log.clone()), "run-1".to_string(), None)
            .await
            .expect("run log should open");

        run_log
            .append_lifecycle(LIFECYCLE_STARTED, json!({"graph_id": "g"}))
            .await
            .expect("append should succeed");
        run_log
            .append_node_event("plan", "plan:1", NODE_STARTED, json!({}))
            .await
            .expect("append should succeed");
        let turn = run_log
            .append_checkpoint("plan", "plan:1", &checkpoint("run-1", 3))
            .await
            .expect("append should succeed")
            .expect("turn should be stored");

        assert_eq!(turn.type_id, CHECKPOINT_TURN_TYPE_ID);
        let lineage_id = run_log.lineage_id().expect("lineage id").clone();
        let turns = log
            .list_turns(&lineage_id, None, 16)
            .await
            .expect("turns should list");
        assert_eq!(turns.len(), 3);
        let decoded = decode_checkpoint_turn(&turns[2]).expect("checkpoint should decode");
        assert_eq!(decoded.next_node_id.as_deref(), Some("next"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn run_log_without_backend_expected_noop_appends() {
        let mut run_log = RunLog::open(None, "run-1".to_string(), None)
            .await
            .expect("run log should open");
        let stored = run_log
            .append_lifecycle(LIFECYCLE_STARTED, json!({}))
            .await
            .expect("append should succeed");
        assert!(stored.is_none());
        assert_eq!(run_log.sequence_no(), 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn open_branch_expected_own_segment_sharing_history() {
        let log: SharedTurnLog = Arc::new(MemoryTurnLog::new());
        let mut parent = RunLog::open(Some(log.clone()), "run-1".to_string(), None)
            .await
            .expect("run log should open");
        parent
            .append_lifecycle(LIFECYCLE_STARTED, json!({}))
            .await
            .expect("append should succeed");

        let mut branch = parent
            .open_branch("branch-a")
            .await
            .expect("branch log should open");
        branch
            .append_branch_event("split", "branch-a", BRANCH_STARTED, json!({}))
            .await
            .expect("append should succeed");

        let parent_turns = log
            .list_turns(parent.lineage_id().expect("lineage"), None, 16)
            .await
            .expect("turns should list");
        assert_eq!(parent_turns.len(), 1);

        let branch_turns = log
            .list_turns(branch.lineage_id().expect("lineage"), None, 16)
            .await
            .expect("turns should list");
        assert_eq!(branch_turns.len(), 2);
        assert_eq!(branch_turns[0].type_id, LIFECYCLE_TURN_TYPE_ID);
        assert_eq!(branch_turns[1].type_id, PARALLEL_EVENT_TURN_TYPE_ID);
    }
}
