use crate::runner::{EngineCore, execute_node_with_retry, record_outcome};
use crate::storage::{BRANCH_COMPLETED, BRANCH_STARTED, RunLog};
use crate::workspace::WorkspaceHandle;
use crate::{
    EngineError, Node, NodeKind, NodeOutcome, NodeStatus, ParallelEvent, RunState, RuntimeContext,
    RuntimeEventKind, select_edge,
};
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tokio::task::JoinSet;

const MAX_BRANCH_STEPS: usize = 10_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum JoinPolicy {
    All,
    Any,
    Quorum,
}

impl JoinPolicy {
    fn as_str(self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Any => "any",
            Self::Quorum => "quorum",
        }
    }
}

#[derive(Clone, Debug)]
struct BranchPlan {
    branch_id: String,
    entry_node: String,
    workspace_handle: Option<WorkspaceHandle>,
}

#[derive(Debug)]
struct BranchRun {
    branch_id: String,
    entry_node: String,
    status: NodeStatus,
    notes: Option<String>,
    completed_nodes: Vec<String>,
    visited_outcomes: BTreeMap<String, NodeStatus>,
    retry_counters: BTreeMap<String, u32>,
    context_delta: RuntimeContext,
    score: f64,
    workspace_handle: Option<WorkspaceHandle>,
}

/// Fan-out execution: every outgoing edge of the fan-out node opens a
/// branch that runs concurrently on its own sub-runner, isolated
/// context clone, and lineage segment, up to (exclusive of) the
/// matching fan-in. The fan-in join is a total barrier; the configured
/// policy decides the aggregate status after all branches finish.
pub(crate) async fn execute_fan_out(
    core: &EngineCore,
    run_log: &mut RunLog,
    state: &mut RunState,
    node: &Node,
) -> Result<(NodeOutcome, String), EngineError> {
    // Unconditional outgoing edges open branches; conditional edges on
    // a fan-out route the aggregate outcome after the join.
    let entries: Vec<(String, String)> = core
        .graph
        .outgoing_edges(&node.id)
        .filter(|edge| {
            edge.condition
                .as_deref()
                .map(str::trim)
                .filter(|condition| !condition.is_empty())
                .is_none()
        })
        .map(|edge| {
            let branch_id = edge
                .label
                .as_deref()
                .filter(|label| !label.trim().is_empty())
                .unwrap_or(edge.to.as_str())
                .to_string();
            (branch_id, edge.to.clone())
        })
        .collect();
    if entries.is_empty() {
        return Ok((
            NodeOutcome::failure(format!("fan-out node '{}' has no branches", node.id)),
            String::new(),
        ));
    }

    let fan_in = find_matching_fan_in(core, node, &entries)?;
    let join_policy = parse_join_policy(node);
    let quorum_needed = quorum_target(node, entries.len());

    core.events
        .emit(RuntimeEventKind::Parallel(ParallelEvent::Started {
            run_id: core.run_id.clone(),
            node_id: node.id.clone(),
            branch_count: entries.len(),
        }));

    let lineage_key = run_log
        .lineage_id()
        .cloned()
        .unwrap_or_else(|| core.run_id.clone());
    let mut plans = Vec::with_capacity(entries.len());
    for (branch_id, entry_node) in &entries {
        let workspace_handle = if branch_writes_workspace(core, entry_node, &fan_in) {
            match core.workspace.as_ref() {
                Some(workspace) => Some(
                    workspace
                        .create_isolated_copy(&format!("{lineage_key}/{branch_id}"))
                        .await?,
                ),
                None => None,
            }
        } else {
            None
        };
        plans.push(BranchPlan {
            branch_id: branch_id.clone(),
            entry_node: entry_node.clone(),
            workspace_handle,
        });
    }

    let mut tasks = JoinSet::new();
    for plan in plans {
        run_log
            .append_branch_event(
                &node.id,
                &plan.branch_id,
                BRANCH_STARTED,
                json!({ "branch_id": plan.branch_id, "target_node": plan.entry_node }),
            )
            .await?;
        core.events
            .emit(RuntimeEventKind::Parallel(ParallelEvent::BranchStarted {
                run_id: core.run_id.clone(),
                node_id: node.id.clone(),
                branch_id: plan.branch_id.clone(),
                target_node: plan.entry_node.clone(),
            }));

        let branch_core = core.clone();
        let branch_log = run_log.open_branch(&plan.branch_id).await?;
        let branch_state = RunState {
            current_node: plan.entry_node.clone(),
            context: state.context.clone(),
            ..RunState::default()
        };
        let stop_at = fan_in.clone();
        tasks.spawn(Box::pin(run_branch(
            branch_core,
            plan,
            branch_state,
            branch_log,
            stop_at,
        )));
    }

    // Branches land in completion order; that order also drives the
    // context and workspace merges below.
    let mut results: Vec<BranchRun> = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        let branch = joined.map_err(|error| {
            EngineError::Runtime(format!("parallel branch task failed: {error}"))
        })??;
        run_log
            .append_branch_event(
                &node.id,
                &branch.branch_id,
                BRANCH_COMPLETED,
                json!({
                    "branch_id": branch.branch_id,
                    "target_node": branch.entry_node,
                    "status": branch.status.as_str(),
                    "notes": branch.notes,
                }),
            )
            .await?;
        core.events
            .emit(RuntimeEventKind::Parallel(ParallelEvent::BranchCompleted {
                run_id: core.run_id.clone(),
                node_id: node.id.clone(),
                branch_id: branch.branch_id.clone(),
                target_node: branch.entry_node.clone(),
                status: branch.status.as_str().to_string(),
            }));
        results.push(branch);
    }

    let success_count = results
        .iter()
        .filter(|branch| branch.status.is_success_like())
        .count();
    let fail_count = results.len() - success_count;

    let (status, notes) = match join_policy {
        JoinPolicy::All => {
            if fail_count == 0 {
                (
                    NodeStatus::Success,
                    format!("all {} branches completed successfully", results.len()),
                )
            } else {
                (
                    NodeStatus::Fail,
                    format!(
                        "join=all failed: {} of {} branches failed",
                        fail_count,
                        results.len()
                    ),
                )
            }
        }
        JoinPolicy::Any => {
            if success_count > 0 {
                (
                    NodeStatus::Success,
                    format!("join=any satisfied: {success_count} successful branches"),
                )
            } else {
                (
                    NodeStatus::Fail,
                    "join=any failed: no successful branch".to_string(),
                )
            }
        }
        JoinPolicy::Quorum => {
            if success_count >= quorum_needed {
                (
                    NodeStatus::Success,
                    format!(
                        "join=quorum satisfied: {success_count} successful branches (required {quorum_needed})"
                    ),
                )
            } else {
                (
                    NodeStatus::Fail,
                    format!(
                        "join=quorum failed: {success_count} successful branches (required {quorum_needed})"
                    ),
                )
            }
        }
    };

    // Branch state folds into the parent in completion order. Context
    // keys merge last-writer-wins; deterministic per key only when
    // branches avoid collisions.
    let mut updates = RuntimeContext::new();
    for branch in &results {
        state.completed_nodes.extend(branch.completed_nodes.iter().cloned());
        state
            .visited_outcomes
            .extend(branch.visited_outcomes.clone());
        for (node_id, count) in &branch.retry_counters {
            *state.retry_counters.entry(node_id.clone()).or_default() += count;
        }
        for (key, value) in &branch.context_delta {
            updates.insert(key.clone(), value.clone());
        }
    }

    let merge_payload = merge_workspaces(core, run_log, node, &results).await?;
    if let Some(payload) = merge_payload {
        updates.extend(payload);
    }

    let mut sorted: Vec<&BranchRun> = results.iter().collect();
    sorted.sort_by(|left, right| left.branch_id.cmp(&right.branch_id));
    updates.insert(
        "parallel.results".to_string(),
        Value::Array(
            sorted
                .iter()
                .map(|branch| {
                    json!({
                        "branch_id": branch.branch_id,
                        "target_node": branch.entry_node,
                        "status": branch.status.as_str(),
                        "score": branch.score,
                        "notes": branch.notes,
                    })
                })
                .collect(),
        ),
    );
    updates.insert(
        "parallel.branch_count".to_string(),
        json!(results.len() as u64),
    );
    updates.insert(
        "parallel.success_count".to_string(),
        json!(success_count as u64),
    );
    updates.insert("parallel.fail_count".to_string(), json!(fail_count as u64));
    updates.insert(
        "parallel.join_policy".to_string(),
        Value::String(join_policy.as_str().to_string()),
    );

    core.events
        .emit(RuntimeEventKind::Parallel(ParallelEvent::Completed {
            run_id: core.run_id.clone(),
            node_id: node.id.clone(),
            success_count,
            failure_count: fail_count,
        }));

    let mut outcome = NodeOutcome::success();
    outcome.status = status;
    outcome.notes = Some(notes.clone());
    if status == NodeStatus::Fail {
        outcome.failure_reason = Some(notes);
    }
    outcome.context_updates = updates;
    Ok((outcome, fan_in))
}

/// Boxed wrapper over `execute_fan_out` so the recursive call from
/// `run_branch` has a concrete `Send` future type. The `+ Send`
/// coercion must live outside `execute_fan_out`'s own opaque-type
/// defining scope, hence this standalone helper.
fn execute_fan_out_boxed<'a>(
    core: &'a EngineCore,
    run_log: &'a mut RunLog,
    state: &'a mut RunState,
    node: &'a Node,
) -> std::pin::Pin<
    Box<dyn std::future::Future<Output = Result<(NodeOutcome, String), EngineError>> + Send + 'a>,
> {
    Box::pin(execute_fan_out(core, run_log, state, node))
}

/// One branch's sub-runner: the parent's traversal loop minus
/// checkpoints, stopping at the fan-in. Declared workspace writes are
/// applied through the branch's isolated copy after each node.
async fn run_branch(
    core: EngineCore,
    plan: BranchPlan,
    mut state: RunState,
    mut run_log: RunLog,
    stop_at: String,
) -> Result<BranchRun, EngineError> {
    let mut node_outcomes = BTreeMap::new();
    let mut context_delta = RuntimeContext::new();
    let mut status = NodeStatus::Success;
    let mut notes = None;
    let mut steps = 0usize;

    while state.current_node != stop_at {
        steps += 1;
        if steps > MAX_BRANCH_STEPS {
            status = NodeStatus::Fail;
            notes = Some(format!(
                "branch '{}' exceeded {MAX_BRANCH_STEPS} steps before reaching fan-in",
                plan.branch_id
            ));
            break;
        }

        let node = core
            .graph
            .nodes
            .get(&state.current_node)
            .ok_or_else(|| {
                EngineError::InvalidGraph(format!(
                    "branch '{}' reached unknown node '{}'",
                    plan.branch_id, state.current_node
                ))
            })?
            .clone();

        let (outcome, _attempt_id) = if node.kind == NodeKind::FanOut {
                let (outcome, nested_fan_in) =
                execute_fan_out_boxed(&core, &mut run_log, &mut state, &node).await?;
            state.current_node = nested_fan_in.clone();
            context_delta.extend(outcome.context_updates.clone());
            record_outcome(&mut state, &mut node_outcomes, &node, outcome.clone())?;
            if outcome.status == NodeStatus::Fail {
                status = NodeStatus::Fail;
                notes = outcome.notes.clone();
                break;
            }
            continue;
        } else {
            execute_node_with_retry(&core, &mut run_log, &mut state, &node).await?
        };

        context_delta.extend(outcome.context_updates.clone());
        let outcome_status = outcome.status;
        let outcome_notes = outcome.notes.clone();
        let routing_outcome = outcome.clone();
        record_outcome(&mut state, &mut node_outcomes, &node, outcome)?;
        apply_declared_workspace_writes(&core, &plan, &node).await?;

        if outcome_status == NodeStatus::Fail {
            status = NodeStatus::Fail;
            notes = outcome_notes;
            break;
        }

        match select_edge(&core.graph, &node.id, &routing_outcome, &state.context) {
            Some(edge) => state.current_node = edge.to.clone(),
            None => {
                status = NodeStatus::Fail;
                notes = Some(format!(
                    "branch '{}' dead-ended at node '{}'",
                    plan.branch_id, node.id
                ));
                break;
            }
        }
    }

    if let (Some(handle), Some(workspace)) =
        (plan.workspace_handle.as_ref(), core.workspace.as_ref())
    {
        let changed = workspace.changed_paths(handle).await?;
        if !changed.is_empty() {
            workspace
                .commit(
                    handle,
                    &changed,
                    &format!("branch '{}' work", plan.branch_id),
                )
                .await?;
        }
    }

    let score = context_delta
        .get("branch.score")
        .and_then(Value::as_f64)
        .unwrap_or(0.0);

    Ok(BranchRun {
        branch_id: plan.branch_id,
        entry_node: plan.entry_node,
        status,
        notes,
        completed_nodes: state.completed_nodes,
        visited_outcomes: state.visited_outcomes,
        retry_counters: state.retry_counters,
        context_delta,
        score,
        workspace_handle: plan.workspace_handle,
    })
}

async fn apply_declared_workspace_writes(
    core: &EngineCore,
    plan: &BranchPlan,
    node: &Node,
) -> Result<(), EngineError> {
    let Some(handle) = plan.workspace_handle.as_ref() else {
        return Ok(());
    };
    let Some(workspace) = core.workspace.as_ref() else {
        return Ok(());
    };
    for (key, value) in node.attrs.values() {
        if let Some(path) = key.strip_prefix("workspace.write.") {
            workspace
                .write(handle, path, value.to_string_value().as_bytes())
                .await?;
        }
    }
    Ok(())
}

async fn merge_workspaces(
    core: &EngineCore,
    run_log: &mut RunLog,
    node: &Node,
    results: &[BranchRun],
) -> Result<Option<RuntimeContext>, EngineError> {
    let handles: Vec<WorkspaceHandle> = results
        .iter()
        .filter_map(|branch| branch.workspace_handle.clone())
        .collect();
    if handles.is_empty() {
        return Ok(None);
    }
    let workspace = core.workspace.as_ref().ok_or_else(|| {
        EngineError::Workspace("isolated copies exist but no workspace driver".to_string())
    })?;

    let merge = workspace.merge(&handles).await?;
    if merge.is_clean() {
        for handle in &handles {
            workspace.discard(handle).await?;
        }
    }
    let mut updates = RuntimeContext::new();
    updates.insert(
        "parallel.merge.merged_paths".to_string(),
        json!(merge.merged_paths),
    );
    updates.insert(
        "parallel.merge.conflict_count".to_string(),
        json!(merge.conflicts.len() as u64),
    );

    if !merge.is_clean() {
        let conflict_payload: Vec<Value> = merge
            .conflicts
            .iter()
            .map(|conflict| {
                json!({
                    "path": conflict.path,
                    "branches": conflict.branches,
                    "conflict_body": conflict.conflict_body,
                })
            })
            .collect();
        updates.insert(
            "parallel.merge.conflicts".to_string(),
            Value::Array(conflict_payload.clone()),
        );
        run_log
            .append_merge_conflict(
                &node.id,
                json!({
                    "node_id": node.id,
                    "conflicts": conflict_payload,
                }),
            )
            .await?;
        core.events
            .emit(RuntimeEventKind::Parallel(ParallelEvent::MergeConflict {
                run_id: core.run_id.clone(),
                node_id: node.id.clone(),
                conflicting_paths: merge
                    .conflicts
                    .iter()
                    .map(|conflict| conflict.path.clone())
                    .collect(),
            }));
    }
    Ok(Some(updates))
}

fn parse_join_policy(node: &Node) -> JoinPolicy {
    match node.attrs.get_str("join").unwrap_or("all").trim() {
        "any" => JoinPolicy::Any,
        "quorum" => JoinPolicy::Quorum,
        _ => JoinPolicy::All,
    }
}

fn quorum_target(node: &Node, branch_count: usize) -> usize {
    if let Some(explicit) = node
        .attrs
        .get_i64("quorum_count")
        .filter(|count| *count >= 1)
    {
        return (explicit as usize).min(branch_count).max(1);
    }
    let ratio = node
        .attrs
        .get("quorum_ratio")
        .and_then(|value| match value {
            crate::AttrValue::Float(ratio) => Some(*ratio),
            crate::AttrValue::Integer(ratio) => Some(*ratio as f64),
            _ => None,
        })
        .unwrap_or(0.5)
        .clamp(0.0, 1.0);
    ((branch_count as f64) * ratio).ceil().max(1.0) as usize
}

fn branch_writes_workspace(core: &EngineCore, entry_node: &str, fan_in: &str) -> bool {
    let mut visited = BTreeSet::new();
    let mut queue = VecDeque::from([entry_node]);
    while let Some(node_id) = queue.pop_front() {
        if node_id == fan_in || !visited.insert(node_id) {
            continue;
        }
        let Some(node) = core.graph.nodes.get(node_id) else {
            continue;
        };
        if node
            .attrs
            .values()
            .keys()
            .any(|key| key.starts_with("workspace.write."))
        {
            return true;
        }
        for edge in core.graph.outgoing_edges(node_id) {
            queue.push_back(edge.to.as_str());
        }
    }
    false
}

/// The fan-in shared by every branch. Traversal continues past inner
/// fan-ins so nested fan-outs resolve to the outer join; among common
/// candidates the one nearest the fan-out wins, ties broken lexically.
fn find_matching_fan_in(
    core: &EngineCore,
    node: &Node,
    entries: &[(String, String)],
) -> Result<String, EngineError> {
    let mut common: Option<BTreeSet<String>> = None;
    for (_, entry_node) in entries {
        let mut reached = BTreeSet::new();
        let mut visited = BTreeSet::new();
        let mut queue = VecDeque::from([entry_node.as_str()]);
        while let Some(node_id) = queue.pop_front() {
            if !visited.insert(node_id) {
                continue;
            }
            if let Some(candidate) = core.graph.nodes.get(node_id) {
                if candidate.kind == NodeKind::FanIn {
                    reached.insert(node_id.to_string());
                }
            }
            for edge in core.graph.outgoing_edges(node_id) {
                queue.push_back(edge.to.as_str());
            }
        }
        common = Some(match common {
            None => reached,
            Some(previous) => previous.intersection(&reached).cloned().collect(),
        });
    }
    let common = common.unwrap_or_default();

    // Breadth-first from the fan-out itself; the first common fan-in
    // encountered is the nearest. The queue is seeded in edge order
    // and candidates at equal depth resolve by the ordered set.
    let mut visited = BTreeSet::new();
    let mut frontier: Vec<&str> = entries
        .iter()
        .map(|(_, entry)| entry.as_str())
        .collect();
    while !frontier.is_empty() {
        let mut at_depth: BTreeSet<&str> = BTreeSet::new();
        for node_id in &frontier {
            if common.contains(*node_id) {
                at_depth.insert(*node_id);
            }
        }
        if let Some(found) = at_depth.into_iter().next() {
            return Ok(found.to_string());
        }
        let mut next_frontier = Vec::new();
        for node_id in frontier {
            if !visited.insert(node_id) {
                continue;
            }
            for edge in core.graph.outgoing_edges(node_id) {
                next_frontier.push(edge.to.as_str());
            }
        }
        frontier = next_frontier;
    }

    Err(EngineError::InvalidGraph(format!(
        "fan-out node '{}' has no common downstream fan-in",
        node.id
    )))
}
