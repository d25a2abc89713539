use crate::storage::{
    LIFECYCLE_COMPLETED, LIFECYCLE_FAILED, LIFECYCLE_PAUSED, LIFECYCLE_STARTED, NODE_COMPLETED,
    NODE_FAILED, NODE_RETRYING, NODE_STARTED, RunLog, timestamp_now,
};
use crate::{
    CheckpointEvent, CheckpointState, EngineError, Graph, Node, NodeEvent, NodeKind, NodeOutcome,
    NodeStatus, PauseSignal, PipelineEvent, PipelineRunResult, RetryBackoffConfig, RunConfig,
    RunPhase, RunState, RuntimeEvent, RuntimeEventKind, RuntimeEventSink, SubTurnReceiver,
    build_retry_policy, delay_for_attempt_ms, effective_carry_mode, finalize_retry_exhausted,
    first_unsatisfied_goal_gate, handlers::HandlerRegistry, jitter_seed_for_run, parallel,
    resolve_failure_route, resolve_retry_target, select_condition_matched_edge, select_edge,
    should_retry_outcome,
    validate_context_key, validate_or_raise, workspace::SharedWorkspaceDriver,
};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Shared, cheaply clonable execution environment: everything a
/// traversal loop needs besides its own `RunState` and log segment.
/// Branch sub-runners clone this.
#[derive(Clone)]
pub(crate) struct EngineCore {
    pub graph: Arc<Graph>,
    pub registry: Arc<HandlerRegistry>,
    pub events: EventBus,
    pub retry_override: Option<RetryBackoffConfig>,
    pub jitter_seed: u64,
    pub workspace: Option<SharedWorkspaceDriver>,
    pub sub_turns: Option<Arc<tokio::sync::Mutex<SubTurnReceiver>>>,
    pub pause: PauseSignal,
    pub run_id: String,
    pub max_reroutes: u32,
}

#[derive(Clone)]
pub(crate) struct EventBus {
    sink: RuntimeEventSink,
    sequence: Arc<AtomicU64>,
}

impl EventBus {
    pub(crate) fn new(sink: RuntimeEventSink) -> Self {
        Self {
            sink,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    pub(crate) fn emit(&self, kind: RuntimeEventKind) {
        let sequence_no = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.sink.is_enabled() {
            return;
        }
        self.sink.emit(RuntimeEvent {
            sequence_no,
            timestamp: timestamp_now(),
            kind,
        });
    }
}

pub(crate) enum DriveEnd {
    Completed,
    Failed(String),
    Paused { next_node: Option<String> },
}

#[derive(Debug, Default)]
pub struct PipelineRunner;

impl PipelineRunner {
    pub async fn run(
        &self,
        graph: &Graph,
        mut config: RunConfig,
    ) -> Result<PipelineRunResult, EngineError> {
        validate_or_raise(graph, &[])?;

        let run_id = config
            .run_id
            .take()
            .unwrap_or_else(|| format!("{}-run", graph.id));
        let start = graph
            .start_candidates()
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::InvalidGraph("graph has no start node".to_string()))?;

        let mut state = RunState {
            current_node: start.id.clone(),
            ..RunState::default()
        };
        let base_turn_id = config.base_turn_id.take();
        let log = config.log.clone();
        let core = engine_core(graph, &config, run_id.clone());

        let mut run_log = RunLog::open(log, run_id.clone(), base_turn_id).await?;
        run_log
            .append_lifecycle(LIFECYCLE_STARTED, json!({ "graph_id": graph.id }))
            .await?;
        core.events
            .emit(RuntimeEventKind::Pipeline(PipelineEvent::Started {
                run_id: run_id.clone(),
                graph_id: graph.id.clone(),
            }));

        let mut node_outcomes = BTreeMap::new();
        let end = drive(&core, &mut run_log, &mut state, &mut node_outcomes).await;
        finalize(&core, &mut run_log, state, node_outcomes, end).await
    }

    /// Continuation entry shared by resume and replay: the lineage and
    /// state are already reconstructed, the loop just keeps going.
    pub(crate) async fn continue_run(
        &self,
        core: EngineCore,
        mut run_log: RunLog,
        mut state: RunState,
    ) -> Result<PipelineRunResult, EngineError> {
        core.events
            .emit(RuntimeEventKind::Pipeline(PipelineEvent::Resumed {
                run_id: core.run_id.clone(),
                graph_id: core.graph.id.clone(),
            }));
        let mut node_outcomes = BTreeMap::new();
        let end = drive(&core, &mut run_log, &mut state, &mut node_outcomes).await;
        finalize(&core, &mut run_log, state, node_outcomes, end).await
    }
}

pub(crate) fn engine_core(graph: &Graph, config: &RunConfig, run_id: String) -> EngineCore {
    EngineCore {
        graph: Arc::new(graph.clone()),
        registry: config.registry.clone(),
        events: EventBus::new(config.events.clone()),
        retry_override: config.retry_backoff.clone(),
        jitter_seed: jitter_seed_for_run(&run_id),
        workspace: config.workspace.clone(),
        sub_turns: config.sub_turns.clone(),
        pause: config.pause.clone(),
        run_id,
        max_reroutes: config.max_reroutes,
    }
}

async fn drive(
    core: &EngineCore,
    run_log: &mut RunLog,
    state: &mut RunState,
    node_outcomes: &mut BTreeMap<String, NodeOutcome>,
) -> Result<DriveEnd, EngineError> {
    loop {
        let node = core
            .graph
            .nodes
            .get(&state.current_node)
            .ok_or_else(|| {
                EngineError::InvalidGraph(format!(
                    "traversal reached unknown node '{}'",
                    state.current_node
                ))
            })?
            .clone();

        if node.kind == NodeKind::Exit {
            // Gates are checked before the exit node runs; an
            // unsatisfied gate reroutes instead of exiting.
            if let Some(gate_id) = first_unsatisfied_goal_gate(&core.graph, &state.visited_outcomes)
            {
                match resolve_retry_target(&core.graph, &gate_id) {
                    Some(target) if state.reroute_count < core.max_reroutes => {
                        state.reroute_count += 1;
                        state.current_node = target;
                        continue;
                    }
                    Some(_) => {
                        return Ok(DriveEnd::Failed(format!(
                            "goal gate '{gate_id}' still unsatisfied after {} reroutes",
                            state.reroute_count
                        )));
                    }
                    None => {
                        return Ok(DriveEnd::Failed(format!(
                            "goal gate '{gate_id}' did not reach success and no retry target is configured"
                        )));
                    }
                }
            }

            let (outcome, attempt_id) =
                execute_node_with_retry(core, run_log, state, &node).await?;
            let failed = outcome.status == NodeStatus::Fail;
            let failure_reason = outcome.failure_reason.clone();
            record_outcome(state, node_outcomes, &node, outcome)?;
            append_checkpoint(core, run_log, state, &node, &attempt_id, None).await?;
            if failed {
                return Ok(DriveEnd::Failed(failure_reason.unwrap_or_else(|| {
                    format!("exit node '{}' failed", node.id)
                })));
            }
            return Ok(DriveEnd::Completed);
        }

        let (outcome, attempt_id, fan_in_target) = if node.kind == NodeKind::FanOut {
            let (outcome, fan_in) =
                parallel::execute_fan_out(core, run_log, state, &node).await?;
            let jump = outcome.status.is_success_like().then_some(fan_in);
            (outcome, format!("{}:1", node.id), jump)
        } else {
            let (outcome, attempt_id) =
                execute_node_with_retry(core, run_log, state, &node).await?;
            (outcome, attempt_id, None)
        };

        let status = outcome.status;
        let failure_reason = outcome.failure_reason.clone();
        let routing_outcome = outcome.clone();
        record_outcome(state, node_outcomes, &node, outcome)?;

        let next = if let Some(fan_in) = fan_in_target {
            Some(fan_in)
        } else if status == NodeStatus::Fail {
            // An explicit fail-condition edge wins; then the retry
            // target chain; then the run is failed. A failed fan-out
            // never routes through its unconditional branch edges.
            let selected = if node.kind == NodeKind::FanOut {
                select_condition_matched_edge(&core.graph, &node.id, &routing_outcome, &state.context)
            } else {
                select_edge(&core.graph, &node.id, &routing_outcome, &state.context)
            };
            match selected {
                Some(edge) => Some(edge.to.clone()),
                None => match resolve_failure_route(&core.graph, &node.id, &routing_outcome) {
                    Some(target) if state.reroute_count < core.max_reroutes => {
                        state.reroute_count += 1;
                        Some(target)
                    }
                    _ => None,
                },
            }
        } else {
            select_edge(&core.graph, &node.id, &routing_outcome, &state.context)
                .map(|edge| edge.to.clone())
        };

        append_checkpoint(core, run_log, state, &node, &attempt_id, next.clone()).await?;

        let Some(next) = next else {
            return Ok(DriveEnd::Failed(failure_reason.unwrap_or_else(|| {
                format!("no eligible edge from node '{}'", node.id)
            })));
        };

        if core.pause.is_requested() {
            return Ok(DriveEnd::Paused {
                next_node: Some(next),
            });
        }
        state.current_node = next;
    }
}

/// Retry controller around one node execution. FAIL and RETRY share
/// the retry budget; exhaustion either coerces to partial success or
/// lets the failure stand for routing.
pub(crate) async fn execute_node_with_retry(
    core: &EngineCore,
    run_log: &mut RunLog,
    state: &mut RunState,
    node: &Node,
) -> Result<(NodeOutcome, String), EngineError> {
    let policy = build_retry_policy(node, &core.graph, core.retry_override.clone());

    let mut attempt = 1;
    loop {
        let attempt_id = format!("{}:{attempt}", node.id);
        run_log
            .append_node_event(
                &node.id,
                &attempt_id,
                NODE_STARTED,
                json!({ "node_id": node.id, "attempt": attempt }),
            )
            .await?;
        core.events.emit(RuntimeEventKind::Node(NodeEvent::Started {
            run_id: core.run_id.clone(),
            node_id: node.id.clone(),
            attempt,
        }));

        let handler = core.registry.resolve(node).ok_or_else(|| {
            EngineError::Runtime(format!(
                "no handler registered for node '{}' (kind {})",
                node.id,
                node.kind.as_str()
            ))
        })?;
        let outcome = match handler.execute(node, &state.context, &core.graph).await {
            Ok(outcome) => outcome,
            Err(error) => NodeOutcome::failure(error.to_string()),
        };
        drain_sub_turns(core, run_log, &node.id, &attempt_id).await?;

        if !should_retry_outcome(&outcome) {
            run_log
                .append_node_event(
                    &node.id,
                    &attempt_id,
                    NODE_COMPLETED,
                    json!({
                        "node_id": node.id,
                        "status": outcome.status.as_str(),
                        "notes": outcome.notes,
                    }),
                )
                .await?;
            core.events.emit(RuntimeEventKind::Node(NodeEvent::Completed {
                run_id: core.run_id.clone(),
                node_id: node.id.clone(),
                attempt,
                status: outcome.status.as_str().to_string(),
                notes: outcome.notes.clone(),
            }));
            return Ok((outcome, attempt_id));
        }

        let will_retry = attempt < policy.max_attempts;
        if !will_retry {
            let final_outcome = finalize_retry_exhausted(node, outcome);
            let (event_kind, event) = if final_outcome.status == NodeStatus::PartialSuccess {
                (
                    NODE_COMPLETED,
                    RuntimeEventKind::Node(NodeEvent::Completed {
                        run_id: core.run_id.clone(),
                        node_id: node.id.clone(),
                        attempt,
                        status: final_outcome.status.as_str().to_string(),
                        notes: final_outcome.notes.clone(),
                    }),
                )
            } else {
                (
                    NODE_FAILED,
                    RuntimeEventKind::Node(NodeEvent::Failed {
                        run_id: core.run_id.clone(),
                        node_id: node.id.clone(),
                        attempt,
                        status: final_outcome.status.as_str().to_string(),
                        notes: final_outcome.notes.clone(),
                        will_retry: false,
                    }),
                )
            };
            run_log
                .append_node_event(
                    &node.id,
                    &attempt_id,
                    event_kind,
                    json!({
                        "node_id": node.id,
                        "status": final_outcome.status.as_str(),
                        "notes": final_outcome.notes,
                        "attempt": attempt,
                    }),
                )
                .await?;
            core.events.emit(event);
            return Ok((final_outcome, attempt_id));
        }

        run_log
            .append_node_event(
                &node.id,
                &attempt_id,
                NODE_FAILED,
                json!({
                    "node_id": node.id,
                    "status": outcome.status.as_str(),
                    "notes": outcome.notes,
                    "will_retry": true,
                }),
            )
            .await?;
        core.events.emit(RuntimeEventKind::Node(NodeEvent::Failed {
            run_id: core.run_id.clone(),
            node_id: node.id.clone(),
            attempt,
            status: outcome.status.as_str().to_string(),
            notes: outcome.notes.clone(),
            will_retry: true,
        }));

        *state.retry_counters.entry(node.id.clone()).or_default() += 1;
        let delay_ms = delay_for_attempt_ms(attempt, &policy.backoff, core.jitter_seed);
        run_log
            .append_node_event(
                &node.id,
                &attempt_id,
                NODE_RETRYING,
                json!({
                    "node_id": node.id,
                    "attempt": attempt,
                    "next_attempt": attempt + 1,
                    "delay_ms": delay_ms,
                }),
            )
            .await?;
        core.events.emit(RuntimeEventKind::Node(NodeEvent::Retrying {
            run_id: core.run_id.clone(),
            node_id: node.id.clone(),
            attempt,
            next_attempt: attempt + 1,
            delay_ms,
        }));
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
        attempt += 1;
    }
}

pub(crate) fn record_outcome(
    state: &mut RunState,
    node_outcomes: &mut BTreeMap<String, NodeOutcome>,
    node: &Node,
    outcome: NodeOutcome,
) -> Result<(), EngineError> {
    state.completed_nodes.push(node.id.clone());
    state.visited_outcomes.insert(node.id.clone(), outcome.status);
    for (key, value) in &outcome.context_updates {
        validate_context_key(key)?;
        state.context.insert(key.clone(), value.clone());
    }
    node_outcomes.insert(node.id.clone(), outcome);
    Ok(())
}

async fn append_checkpoint(
    core: &EngineCore,
    run_log: &mut RunLog,
    state: &RunState,
    node: &Node,
    attempt_id: &str,
    next_node_id: Option<String>,
) -> Result<(), EngineError> {
    let workspace_revision = match core.workspace.as_ref() {
        Some(workspace) => Some(workspace.snapshot().await?),
        None => None,
    };
    let next_node_carry = next_node_id
        .as_deref()
        .map(|next| effective_carry_mode(&core.graph, next, Some(&node.id)));
    let checkpoint = CheckpointState {
        schema_version: crate::CHECKPOINT_SCHEMA_VERSION,
        run_id: core.run_id.clone(),
        sequence_no: run_log.sequence_no() + 1,
        state: state.clone(),
        next_node_id,
        next_node_carry,
        workspace_revision,
    };
    let turn = run_log
        .append_checkpoint(&node.id, attempt_id, &checkpoint)
        .await?;
    core.events
        .emit(RuntimeEventKind::Checkpoint(CheckpointEvent::Saved {
            run_id: core.run_id.clone(),
            node_id: node.id.clone(),
            turn_id: turn.map(|turn| turn.turn_id).unwrap_or_default(),
        }));
    Ok(())
}

pub(crate) async fn drain_sub_turns(
    core: &EngineCore,
    run_log: &mut RunLog,
    node_id: &str,
    attempt_id: &str,
) -> Result<(), EngineError> {
    let Some(receiver) = core.sub_turns.as_ref() else {
        return Ok(());
    };
    let mut receiver = receiver.lock().await;
    while let Ok(sub_turn) = receiver.try_recv() {
        run_log
            .append_sub_turn(node_id, attempt_id, &sub_turn)
            .await?;
    }
    Ok(())
}

async fn finalize(
    core: &EngineCore,
    run_log: &mut RunLog,
    state: RunState,
    node_outcomes: BTreeMap<String, NodeOutcome>,
    end: Result<DriveEnd, EngineError>,
) -> Result<PipelineRunResult, EngineError> {
    let (phase, failure_reason) = match end {
        Ok(DriveEnd::Completed) => {
            run_log
                .append_lifecycle(LIFECYCLE_COMPLETED, json!({ "graph_id": core.graph.id }))
                .await?;
            core.events
                .emit(RuntimeEventKind::Pipeline(PipelineEvent::Completed {
                    run_id: core.run_id.clone(),
                    graph_id: core.graph.id.clone(),
                }));
            (RunPhase::Completed, None)
        }
        Ok(DriveEnd::Failed(reason)) => {
            run_log
                .append_lifecycle(
                    LIFECYCLE_FAILED,
                    json!({ "graph_id": core.graph.id, "reason": reason }),
                )
                .await?;
            core.events
                .emit(RuntimeEventKind::Pipeline(PipelineEvent::Failed {
                    run_id: core.run_id.clone(),
                    graph_id: core.graph.id.clone(),
                    reason: reason.clone(),
                }));
            (RunPhase::Failed, Some(reason))
        }
        Ok(DriveEnd::Paused { next_node }) => {
            run_log
                .append_lifecycle(
                    LIFECYCLE_PAUSED,
                    json!({ "graph_id": core.graph.id, "next_node": next_node }),
                )
                .await?;
            core.events
                .emit(RuntimeEventKind::Pipeline(PipelineEvent::Paused {
                    run_id: core.run_id.clone(),
                    graph_id: core.graph.id.clone(),
                    next_node,
                }));
            (RunPhase::Paused, None)
        }
        Err(error) => {
            // The error itself still surfaces; the failed-lifecycle
            // turn is appended best effort so the lineage never ends
            // on a dangling node event.
            let _ = run_log
                .append_lifecycle(
                    LIFECYCLE_FAILED,
                    json!({ "graph_id": core.graph.id, "reason": error.to_string() }),
                )
                .await;
            core.events
                .emit(RuntimeEventKind::Pipeline(PipelineEvent::Failed {
                    run_id: core.run_id.clone(),
                    graph_id: core.graph.id.clone(),
                    reason: error.to_string(),
                }));
            return Err(error);
        }
    };

    Ok(PipelineRunResult {
        run_id: core.run_id.clone(),
        lineage_id: run_log.lineage_id().cloned(),
        phase,
        failure_reason,
        completed_nodes: state.completed_nodes,
        node_outcomes,
        context: state.context,
    })
}
