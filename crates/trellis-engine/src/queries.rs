use crate::resume::find_latest_checkpoint;
use crate::storage::{
    CHECKPOINT_TURN_TYPE_ID, LIFECYCLE_COMPLETED, LIFECYCLE_FAILED, LIFECYCLE_PAUSED,
    LIFECYCLE_TURN_TYPE_ID, decode_checkpoint_turn, decode_envelope,
};
use crate::{CheckpointState, EngineError, RunPhase};
use serde::{Deserialize, Serialize};
use trellis_turnlog::{LineageId, SharedTurnLog};

const SUMMARY_TURN_WINDOW: usize = 1024;

/// Status-surface view of one lineage, decoded from its stored turns.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub lineage_id: LineageId,
    pub run_id: Option<String>,
    pub phase: RunPhase,
    pub current_node: Option<String>,
    pub next_node: Option<String>,
    pub completed_node_count: usize,
    pub retry_total: u32,
    pub turn_count: usize,
}

pub async fn run_summary(
    log: &SharedTurnLog,
    lineage_id: &LineageId,
) -> Result<RunSummary, EngineError> {
    let turns = log.list_turns(lineage_id, None, SUMMARY_TURN_WINDOW).await?;
    if turns.is_empty() {
        return Ok(RunSummary {
            lineage_id: lineage_id.clone(),
            run_id: None,
            phase: RunPhase::Pending,
            current_node: None,
            next_node: None,
            completed_node_count: 0,
            retry_total: 0,
            turn_count: 0,
        });
    }

    let mut phase = RunPhase::Running;
    let mut run_id = None;
    for turn in turns.iter().rev() {
        if turn.type_id != LIFECYCLE_TURN_TYPE_ID {
            continue;
        }
        let envelope = decode_envelope(turn)?;
        run_id = envelope.run_id.clone();
        phase = match envelope.event_kind.as_str() {
            LIFECYCLE_COMPLETED => RunPhase::Completed,
            LIFECYCLE_FAILED => RunPhase::Failed,
            LIFECYCLE_PAUSED => RunPhase::Paused,
            _ => RunPhase::Running,
        };
        break;
    }

    let checkpoint = find_latest_checkpoint(&turns)
        .map(decode_checkpoint_turn)
        .transpose()?;
    let (current_node, next_node, completed_node_count, retry_total) = match &checkpoint {
        Some(checkpoint) => (
            Some(checkpoint.state.current_node.clone()),
            checkpoint.next_node_id.clone(),
            checkpoint.state.completed_nodes.len(),
            checkpoint.state.retry_counters.values().sum(),
        ),
        None => (None, None, 0, 0),
    };
    if run_id.is_none() {
        run_id = checkpoint.as_ref().map(|checkpoint| checkpoint.run_id.clone());
    }

    Ok(RunSummary {
        lineage_id: lineage_id.clone(),
        run_id,
        phase,
        current_node,
        next_node,
        completed_node_count,
        retry_total,
        turn_count: turns.len(),
    })
}

pub async fn list_runs(log: &SharedTurnLog) -> Result<Vec<RunSummary>, EngineError> {
    let mut summaries = Vec::new();
    for lineage in log.list_lineages().await? {
        summaries.push(run_summary(log, &lineage.lineage_id).await?);
    }
    Ok(summaries)
}

pub async fn latest_checkpoint(
    log: &SharedTurnLog,
    lineage_id: &LineageId,
) -> Result<Option<CheckpointState>, EngineError> {
    let turns = log.list_turns(lineage_id, None, SUMMARY_TURN_WINDOW).await?;
    find_latest_checkpoint(&turns)
        .map(decode_checkpoint_turn)
        .transpose()
}

pub async fn checkpoint_turn_ids(
    log: &SharedTurnLog,
    lineage_id: &LineageId,
) -> Result<Vec<String>, EngineError> {
    let turns = log.list_turns(lineage_id, None, SUMMARY_TURN_WINDOW).await?;
    Ok(turns
        .into_iter()
        .filter(|turn| turn.type_id == CHECKPOINT_TURN_TYPE_ID)
        .map(|turn| turn.turn_id)
        .collect())
}
