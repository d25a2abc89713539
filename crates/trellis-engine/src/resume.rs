use crate::runner::engine_core;
use crate::storage::{
    CHECKPOINT_TURN_TYPE_ID, LIFECYCLE_PAUSED, LIFECYCLE_TURN_TYPE_ID, RunLog, decode_checkpoint_turn,
    decode_envelope, terminal_lifecycle_kinds,
};
use crate::{
    CheckpointState, EngineError, Graph, PipelineRunResult, PipelineRunner, RunConfig, RunState,
    degraded_carry_on_resume, validate_or_raise,
};
use serde_json::Value;
use trellis_turnlog::{LineageId, SharedTurnLog, StoredTurn, TurnId};

const RESUME_TAIL_WINDOW: usize = 64;

#[derive(Clone, Debug)]
pub struct ResumeState {
    pub lineage_id: LineageId,
    pub checkpoint: CheckpointState,
    pub head_depth: u32,
    pub was_paused: bool,
}

/// Strict resume inspection: the head turn must be a checkpoint, with
/// exactly one trailing `paused` lifecycle turn tolerated above it. A
/// completed or failed run is not resumable.
pub async fn load_resume_state(
    log: &SharedTurnLog,
    lineage_id: &LineageId,
) -> Result<ResumeState, EngineError> {
    let head = log.get_head(lineage_id).await?;
    let tail = log.list_turns(lineage_id, None, RESUME_TAIL_WINDOW).await?;
    let mut newest_first = tail.iter().rev();

    let newest = newest_first
        .next()
        .ok_or_else(|| EngineError::ResumeIntegrity("lineage has no turns".to_string()))?;

    let (checkpoint_turn, was_paused) = if newest.type_id == LIFECYCLE_TURN_TYPE_ID {
        let envelope = decode_envelope(newest)?;
        if terminal_lifecycle_kinds().contains(&envelope.event_kind.as_str()) {
            return Err(EngineError::ResumeIntegrity(format!(
                "run already ended with '{}'",
                envelope.event_kind
            )));
        }
        if envelope.event_kind != LIFECYCLE_PAUSED {
            return Err(EngineError::ResumeIntegrity(format!(
                "head turn is a '{}' lifecycle turn, not a checkpoint",
                envelope.event_kind
            )));
        }
        let beneath = newest_first.next().ok_or_else(|| {
            EngineError::ResumeIntegrity("paused lineage has no checkpoint beneath".to_string())
        })?;
        (beneath, true)
    } else {
        (newest, false)
    };

    if checkpoint_turn.type_id != CHECKPOINT_TURN_TYPE_ID {
        return Err(EngineError::ResumeIntegrity(format!(
            "head turn '{}' is not a checkpoint",
            checkpoint_turn.type_id
        )));
    }

    Ok(ResumeState {
        lineage_id: lineage_id.clone(),
        checkpoint: decode_checkpoint_turn(checkpoint_turn)?,
        head_depth: head.depth,
        was_paused,
    })
}

/// Replay inspection: any historical turn may be the fork point, so
/// this walks back to the latest checkpoint at or before the head.
pub async fn load_replay_state(
    log: &SharedTurnLog,
    lineage_id: &LineageId,
) -> Result<ResumeState, EngineError> {
    let head = log.get_head(lineage_id).await?;
    let tail = log.list_turns(lineage_id, None, RESUME_TAIL_WINDOW).await?;
    let checkpoint_turn = find_latest_checkpoint(&tail).ok_or_else(|| {
        EngineError::ResumeIntegrity(format!(
            "no checkpoint found in the last {RESUME_TAIL_WINDOW} turns of lineage {lineage_id}"
        ))
    })?;

    Ok(ResumeState {
        lineage_id: lineage_id.clone(),
        checkpoint: decode_checkpoint_turn(checkpoint_turn)?,
        head_depth: head.depth,
        was_paused: false,
    })
}

pub(crate) fn find_latest_checkpoint(turns: &[StoredTurn]) -> Option<&StoredTurn> {
    turns
        .iter()
        .rev()
        .find(|turn| turn.type_id == CHECKPOINT_TURN_TYPE_ID)
}

impl PipelineRunner {
    /// Continue a lineage forward from its head checkpoint.
    pub async fn resume(
        &self,
        graph: &Graph,
        lineage_id: &LineageId,
        config: RunConfig,
    ) -> Result<PipelineRunResult, EngineError> {
        let resume_state = {
            let log = require_log(&config)?;
            load_resume_state(&log, lineage_id).await?
        };
        self.continue_from(graph, resume_state, config).await
    }

    /// Fork a new lineage at a historical turn and continue execution
    /// there. The source lineage is never touched.
    pub async fn replay(
        &self,
        graph: &Graph,
        from_turn_id: &TurnId,
        config: RunConfig,
    ) -> Result<PipelineRunResult, EngineError> {
        let replay_state = {
            let log = require_log(&config)?;
            let forked = log.fork_lineage(from_turn_id.clone()).await?;
            load_replay_state(&log, &forked.lineage_id).await?
        };
        self.continue_from(graph, replay_state, config).await
    }

    async fn continue_from(
        &self,
        graph: &Graph,
        resume_state: ResumeState,
        mut config: RunConfig,
    ) -> Result<PipelineRunResult, EngineError> {
        validate_or_raise(graph, &[])?;
        let log = require_log(&config)?;
        let checkpoint = resume_state.checkpoint;

        let next_node = checkpoint.next_node_id.clone().ok_or_else(|| {
            EngineError::ResumeIntegrity(
                "checkpoint has no next node to continue from".to_string(),
            )
        })?;
        if !graph.nodes.contains_key(&next_node) {
            return Err(EngineError::ResumeIntegrity(format!(
                "checkpoint points at unknown node '{next_node}'"
            )));
        }

        if let Some(revision) = checkpoint.workspace_revision.as_ref() {
            if let Some(workspace) = config.workspace.as_ref() {
                workspace.restore(revision).await.map_err(|error| {
                    EngineError::ResumeIntegrity(format!(
                        "workspace cannot be restored to revision '{revision}': {error}"
                    ))
                })?;
            }
        }

        let mut state: RunState = checkpoint.state.clone();
        state.current_node = next_node;
        if let Some(degraded) = checkpoint
            .next_node_carry
            .as_deref()
            .and_then(degraded_carry_on_resume)
        {
            state
                .context
                .insert("resume.carry_override".to_string(), Value::String(degraded));
        }

        let run_id = config
            .run_id
            .take()
            .unwrap_or_else(|| checkpoint.run_id.clone());
        let run_log = RunLog::attach(
            log,
            run_id.clone(),
            resume_state.lineage_id,
            u64::from(resume_state.head_depth),
        );
        let core = engine_core(graph, &config, run_id);
        self.continue_run(core, run_log, state).await
    }
}

fn require_log(config: &RunConfig) -> Result<SharedTurnLog, EngineError> {
    config.log.clone().ok_or_else(|| {
        EngineError::ResumeIntegrity("no turn log configured for resume".to_string())
    })
}
