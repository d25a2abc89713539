use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use trellis_engine::handlers::{HandlerRegistry, NodeHandler};
use trellis_engine::{
    CHECKPOINT_SAVED, Edge, EngineError, Graph, GraphBuilder, LIFECYCLE_COMPLETED,
    LIFECYCLE_FAILED, LIFECYCLE_STARTED, NODE_COMPLETED, NODE_RETRYING, NodeOutcome, NodeStatus,
    PipelineRunner, RetryBackoffConfig, RunConfig, RunPhase, RuntimeContext, decode_envelope,
    exit_node, linear_graph, start_node, work_node,
};
use trellis_turnlog::{MemoryTurnLog, SharedTurnLog, TurnLog};

fn no_sleep_backoff() -> RetryBackoffConfig {
    RetryBackoffConfig {
        initial_delay_ms: 0,
        backoff_factor: 1.0,
        max_delay_ms: 0,
        jitter: false,
    }
}

async fn event_kinds(log: &SharedTurnLog, lineage_id: &str) -> Vec<String> {
    log.list_turns(&lineage_id.to_string(), None, 1024)
        .await
        .expect("turns should list")
        .iter()
        .map(|turn| decode_envelope(turn).expect("envelope should decode").event_kind)
        .collect()
}

struct ScriptedHandler<F>(F);

#[async_trait]
impl<F> NodeHandler for ScriptedHandler<F>
where
    F: Fn(&trellis_engine::Node, &RuntimeContext) -> NodeOutcome + Send + Sync,
{
    async fn execute(
        &self,
        node: &trellis_engine::Node,
        context: &RuntimeContext,
        _graph: &Graph,
    ) -> Result<NodeOutcome, EngineError> {
        Ok((self.0)(node, context))
    }
}

fn registry_with_work<F>(script: F) -> Arc<HandlerRegistry>
where
    F: Fn(&trellis_engine::Node, &RuntimeContext) -> NodeOutcome + Send + Sync + 'static,
{
    let mut registry = trellis_engine::handlers::core_registry();
    registry.register_kind(
        trellis_engine::NodeKind::Work,
        Arc::new(ScriptedHandler(script)),
    );
    Arc::new(registry)
}

#[tokio::test(flavor = "current_thread")]
async fn linear_run_expected_success_and_exact_turn_sequence() {
    // Five nodes total: start, a, b, c, exit.
    let graph = linear_graph("pipeline", &["a", "b", "c"]);
    let log: SharedTurnLog = Arc::new(MemoryTurnLog::new());

    let result = PipelineRunner
        .run(
            &graph,
            RunConfig {
                log: Some(log.clone()),
                ..RunConfig::default()
            },
        )
        .await
        .expect("run should succeed");

    assert_eq!(result.phase, RunPhase::Completed);
    assert_eq!(
        result.completed_nodes,
        vec!["start", "a", "b", "c", "exit"]
    );

    let lineage_id = result.lineage_id.expect("lineage id should be present");
    let kinds = event_kinds(&log, &lineage_id).await;
    assert_eq!(kinds.first().map(String::as_str), Some(LIFECYCLE_STARTED));

    // Filtered to the completion-relevant kinds, the order is exactly
    // five node-completed/checkpoint pairs then the completed turn.
    let filtered: Vec<&str> = kinds
        .iter()
        .map(String::as_str)
        .filter(|kind| {
            [NODE_COMPLETED, CHECKPOINT_SAVED, LIFECYCLE_COMPLETED].contains(kind)
        })
        .collect();
    let mut expected = Vec::new();
    for _ in 0..5 {
        expected.push(NODE_COMPLETED);
        expected.push(CHECKPOINT_SAVED);
    }
    expected.push(LIFECYCLE_COMPLETED);
    assert_eq!(filtered, expected);
}

#[tokio::test(flavor = "current_thread")]
async fn preferred_label_expected_routes_matching_branch() {
    let graph = GraphBuilder::new("g")
        .node(start_node("start"))
        .node(work_node("gate"))
        .node(work_node("yes"))
        .node(work_node("no"))
        .node(exit_node("exit"))
        .edge("start", "gate")
        .edge_full("gate", "yes", |edge| Edge {
            label: Some("Yes".to_string()),
            ..edge
        })
        .edge_full("gate", "no", |edge| Edge {
            label: Some("No".to_string()),
            ..edge
        })
        .edge("yes", "exit")
        .edge("no", "exit")
        .build();

    let registry = registry_with_work(|node, _context| {
        if node.id == "gate" {
            let mut outcome = NodeOutcome::success();
            outcome.preferred_label = Some("No".to_string());
            return outcome;
        }
        NodeOutcome::success()
    });

    let result = PipelineRunner
        .run(
            &graph,
            RunConfig {
                registry,
                ..RunConfig::default()
            },
        )
        .await
        .expect("run should succeed");

    assert_eq!(result.phase, RunPhase::Completed);
    assert!(result.completed_nodes.iter().any(|node| node == "no"));
    assert!(!result.completed_nodes.iter().any(|node| node == "yes"));
}

#[tokio::test(flavor = "current_thread")]
async fn retry_twice_then_success_expected_counter_and_retrying_turns() {
    let mut work = work_node("work");
    work.max_retries = Some(2);
    let graph = GraphBuilder::new("g")
        .node(start_node("start"))
        .node(work)
        .node(exit_node("exit"))
        .edge("start", "work")
        .edge("work", "exit")
        .build();

    let calls = Arc::new(AtomicUsize::new(0));
    let handler_calls = calls.clone();
    let registry = registry_with_work(move |node, _context| {
        if node.id == "work" {
            let attempt = handler_calls.fetch_add(1, Ordering::SeqCst);
            if attempt < 2 {
                return NodeOutcome::failure("not yet");
            }
        }
        NodeOutcome::success()
    });

    let log: SharedTurnLog = Arc::new(MemoryTurnLog::new());
    let result = PipelineRunner
        .run(
            &graph,
            RunConfig {
                registry,
                log: Some(log.clone()),
                retry_backoff: Some(no_sleep_backoff()),
                ..RunConfig::default()
            },
        )
        .await
        .expect("run should succeed");

    assert_eq!(result.phase, RunPhase::Completed);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(
        result.node_outcomes.get("work").map(|outcome| outcome.status),
        Some(NodeStatus::Success)
    );

    let lineage_id = result.lineage_id.expect("lineage id should be present");
    let kinds = event_kinds(&log, &lineage_id).await;
    let retrying = kinds.iter().filter(|kind| *kind == NODE_RETRYING).count();
    assert_eq!(retrying, 2);

    let checkpoint = trellis_engine::latest_checkpoint(&log, &lineage_id)
        .await
        .expect("checkpoint should load")
        .expect("checkpoint should exist");
    assert_eq!(checkpoint.state.retry_counters.get("work"), Some(&2));
}

#[tokio::test(flavor = "current_thread")]
async fn retry_bound_expected_at_most_n_plus_one_executions() {
    let mut work = work_node("work");
    work.max_retries = Some(3);
    // Success is the only way out of `work`; exhausted retries leave
    // no eligible edge and the failure chain has no targets.
    let graph = GraphBuilder::new("g")
        .node(start_node("start"))
        .node(work)
        .node(exit_node("exit"))
        .edge("start", "work")
        .edge_full("work", "exit", |edge| Edge {
            condition: Some("outcome=success".to_string()),
            ..edge
        })
        .build();

    let calls = Arc::new(AtomicUsize::new(0));
    let handler_calls = calls.clone();
    let registry = registry_with_work(move |node, _context| {
        if node.id == "work" {
            handler_calls.fetch_add(1, Ordering::SeqCst);
            return NodeOutcome::retry("always busy");
        }
        NodeOutcome::success()
    });

    let result = PipelineRunner
        .run(
            &graph,
            RunConfig {
                registry,
                retry_backoff: Some(no_sleep_backoff()),
                ..RunConfig::default()
            },
        )
        .await
        .expect("run should finish");

    assert_eq!(result.phase, RunPhase::Failed);
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[tokio::test(flavor = "current_thread")]
async fn allow_partial_expected_exhaustion_coerced_to_partial_success() {
    let mut work = work_node("work");
    work.max_retries = Some(1);
    work.allow_partial = true;
    let graph = GraphBuilder::new("g")
        .node(start_node("start"))
        .node(work)
        .node(exit_node("exit"))
        .edge("start", "work")
        .edge("work", "exit")
        .build();

    let registry = registry_with_work(|node, _context| {
        if node.id == "work" {
            return NodeOutcome::failure("still broken");
        }
        NodeOutcome::success()
    });

    let result = PipelineRunner
        .run(
            &graph,
            RunConfig {
                registry,
                retry_backoff: Some(no_sleep_backoff()),
                ..RunConfig::default()
            },
        )
        .await
        .expect("run should succeed");

    assert_eq!(result.phase, RunPhase::Completed);
    assert_eq!(
        result.node_outcomes.get("work").map(|outcome| outcome.status),
        Some(NodeStatus::PartialSuccess)
    );
}

#[tokio::test(flavor = "current_thread")]
async fn goal_gate_failure_expected_reroute_to_retry_target_before_exit() {
    let mut gate = work_node("gate");
    gate.goal_gate = true;
    gate.retry_target = Some("fix".to_string());
    let graph = GraphBuilder::new("g")
        .node(start_node("start"))
        .node(gate)
        .node(work_node("fix"))
        .node(exit_node("exit"))
        .edge("start", "gate")
        .edge("gate", "exit")
        .edge_full("gate", "fix", |edge| Edge {
            condition: Some("outcome=fail".to_string()),
            ..edge
        })
        .edge("fix", "gate")
        .build();

    let gate_calls = Arc::new(AtomicUsize::new(0));
    let handler_calls = gate_calls.clone();
    let registry = registry_with_work(move |node, _context| {
        if node.id == "gate" && handler_calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return NodeOutcome::failure("goal not met");
        }
        NodeOutcome::success()
    });

    let result = PipelineRunner
        .run(
            &graph,
            RunConfig {
                registry,
                retry_backoff: Some(no_sleep_backoff()),
                ..RunConfig::default()
            },
        )
        .await
        .expect("run should succeed");

    assert_eq!(result.phase, RunPhase::Completed);
    assert!(result.completed_nodes.iter().any(|node| node == "fix"));
}

#[tokio::test(flavor = "current_thread")]
async fn goal_gate_unsatisfied_without_target_expected_failed_run_naming_gate() {
    let mut gate = work_node("gate");
    gate.goal_gate = true;
    gate.max_retries = Some(0);
    gate.allow_partial = false;
    let graph = GraphBuilder::new("g")
        .node(start_node("start"))
        .node(gate)
        .node(exit_node("exit"))
        .edge("start", "gate")
        .edge("gate", "exit")
        .build();

    let registry = registry_with_work(|node, _context| {
        if node.id == "gate" {
            // The unconditional edge still routes to exit; the gate
            // check there is what stops the run.
            NodeOutcome::failure("quality bar missed")
        } else {
            NodeOutcome::success()
        }
    });

    let log: SharedTurnLog = Arc::new(MemoryTurnLog::new());
    let result = PipelineRunner
        .run(
            &graph,
            RunConfig {
                registry,
                log: Some(log.clone()),
                retry_backoff: Some(no_sleep_backoff()),
                ..RunConfig::default()
            },
        )
        .await
        .expect("run should finish");

    assert_eq!(result.phase, RunPhase::Failed);
    let reason = result.failure_reason.expect("failure reason expected");
    assert!(reason.contains("gate"), "reason was: {reason}");

    let lineage_id = result.lineage_id.expect("lineage id should be present");
    let kinds = event_kinds(&log, &lineage_id).await;
    assert_eq!(kinds.last().map(String::as_str), Some(LIFECYCLE_FAILED));
}

#[tokio::test(flavor = "current_thread")]
async fn goal_gate_invariant_expected_never_completed_with_failed_gate() {
    // No retry target anywhere: a failing gate must fail the run.
    let mut gate = work_node("gate");
    gate.goal_gate = true;
    let graph = GraphBuilder::new("g")
        .node(start_node("start"))
        .node(gate)
        .node(exit_node("exit"))
        .edge("start", "gate")
        .edge("gate", "exit")
        .build();

    let registry = registry_with_work(|node, _context| {
        if node.id == "gate" {
            NodeOutcome::failure("never good enough")
        } else {
            NodeOutcome::success()
        }
    });

    let result = PipelineRunner
        .run(
            &graph,
            RunConfig {
                registry,
                retry_backoff: Some(no_sleep_backoff()),
                ..RunConfig::default()
            },
        )
        .await
        .expect("run should finish");

    assert_ne!(result.phase, RunPhase::Completed);
}

#[tokio::test(flavor = "current_thread")]
async fn node_fail_with_fail_condition_edge_expected_explicit_route_taken() {
    let graph = GraphBuilder::new("g")
        .node(start_node("start"))
        .node(work_node("risky"))
        .node(work_node("recover"))
        .node(exit_node("exit"))
        .edge("start", "risky")
        .edge("risky", "exit")
        .edge_full("risky", "recover", |edge| Edge {
            condition: Some("outcome=fail".to_string()),
            ..edge
        })
        .edge("recover", "exit")
        .build();

    let risky_calls = Arc::new(AtomicUsize::new(0));
    let handler_calls = risky_calls.clone();
    let registry = registry_with_work(move |node, _context| {
        if node.id == "risky" && handler_calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return NodeOutcome::failure("flaked");
        }
        NodeOutcome::success()
    });

    let result = PipelineRunner
        .run(
            &graph,
            RunConfig {
                registry,
                retry_backoff: Some(no_sleep_backoff()),
                ..RunConfig::default()
            },
        )
        .await
        .expect("run should succeed");

    assert_eq!(result.phase, RunPhase::Completed);
    assert!(result.completed_nodes.iter().any(|node| node == "recover"));
}

#[tokio::test(flavor = "current_thread")]
async fn context_updates_expected_visible_to_downstream_nodes() {
    let graph = linear_graph("g", &["producer", "consumer"]);
    let seen = Arc::new(std::sync::Mutex::new(None));
    let seen_in_handler = seen.clone();
    let registry = registry_with_work(move |node, context| {
        if node.id == "producer" {
            return NodeOutcome::success().with_update("producer.value", json!("made-it"));
        }
        if node.id == "consumer" {
            *seen_in_handler.lock().expect("mutex should lock") =
                context.get("producer.value").cloned();
        }
        NodeOutcome::success()
    });

    let result = PipelineRunner
        .run(
            &graph,
            RunConfig {
                registry,
                ..RunConfig::default()
            },
        )
        .await
        .expect("run should succeed");

    assert_eq!(result.phase, RunPhase::Completed);
    assert_eq!(
        seen.lock().expect("mutex should lock").clone(),
        Some(json!("made-it"))
    );
    assert_eq!(result.context.get("producer.value"), Some(&json!("made-it")));
}
