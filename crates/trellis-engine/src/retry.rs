use crate::{Graph, Node, NodeOutcome, NodeStatus};
use serde::{Deserialize, Serialize};

/// Named backoff policies selectable per node via the `backoff`
/// field. Each applies deterministic jitter unless disabled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffPolicy {
    Standard,
    Aggressive,
    Linear,
    Patient,
}

impl BackoffPolicy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "standard" => Some(Self::Standard),
            "aggressive" => Some(Self::Aggressive),
            "linear" => Some(Self::Linear),
            "patient" => Some(Self::Patient),
            _ => None,
        }
    }

    pub fn config(self) -> RetryBackoffConfig {
        let (initial_delay_ms, backoff_factor) = match self {
            Self::Standard => (200, 2.0),
            Self::Aggressive => (500, 2.0),
            Self::Linear => (500, 1.0),
            Self::Patient => (2_000, 3.0),
        };
        RetryBackoffConfig {
            initial_delay_ms,
            backoff_factor,
            max_delay_ms: 60_000,
            jitter: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RetryBackoffConfig {
    pub initial_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetryBackoffConfig {
    fn default() -> Self {
        BackoffPolicy::Standard.config()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: RetryBackoffConfig,
}

/// Node `max_retries` wins; `default_max_retry` on the graph is the
/// fallback; zero retries otherwise. `override_backoff` (from
/// `RunConfig`) replaces the node's named policy, which tests use to
/// zero out sleeps.
pub fn build_retry_policy(
    node: &Node,
    graph: &Graph,
    override_backoff: Option<RetryBackoffConfig>,
) -> RetryPolicy {
    let max_retries = node
        .max_retries
        .map(i64::from)
        .or_else(|| graph.attrs.get_i64("default_max_retry"))
        .unwrap_or(0)
        .max(0) as u32;

    let backoff = override_backoff.unwrap_or_else(|| {
        node.backoff
            .as_deref()
            .and_then(BackoffPolicy::parse)
            .unwrap_or(BackoffPolicy::Standard)
            .config()
    });

    RetryPolicy {
        max_attempts: max_retries + 1,
        backoff,
    }
}

/// RETRY and FAIL share one accounting path; SUCCESS and
/// PARTIAL_SUCCESS never re-execute.
pub fn should_retry_outcome(outcome: &NodeOutcome) -> bool {
    matches!(outcome.status, NodeStatus::Retry | NodeStatus::Fail)
}

/// Exhaustion: `allow_partial` coerces to PARTIAL_SUCCESS, otherwise
/// the failing outcome stands and failure routing decides.
pub fn finalize_retry_exhausted(node: &Node, last: NodeOutcome) -> NodeOutcome {
    if node.allow_partial {
        return NodeOutcome {
            status: NodeStatus::PartialSuccess,
            notes: Some("retries exhausted, partial accepted".to_string()),
            ..last
        };
    }
    NodeOutcome {
        status: NodeStatus::Fail,
        failure_reason: last
            .failure_reason
            .clone()
            .or_else(|| Some("max retries exceeded".to_string())),
        ..last
    }
}

pub fn delay_for_attempt_ms(attempt: u32, config: &RetryBackoffConfig, jitter_seed: u64) -> u64 {
    let exp = (attempt.saturating_sub(1)) as i32;
    let base = (config.initial_delay_ms as f64) * config.backoff_factor.powi(exp);
    let mut delay = base.min(config.max_delay_ms as f64);
    if config.jitter {
        delay *= jitter_factor(attempt, jitter_seed);
    }
    delay.round().max(0.0) as u64
}

// Seeded xorshift keeps jitter reproducible for a given run id.
fn jitter_factor(attempt: u32, jitter_seed: u64) -> f64 {
    let mut x = jitter_seed ^ ((attempt as u64) << 32) ^ 0x9E3779B97F4A7C15;
    x ^= x >> 12;
    x ^= x << 25;
    x ^= x >> 27;
    let r = x.wrapping_mul(0x2545F4914F6CDD1D);
    let unit = (r as f64) / (u64::MAX as f64);
    0.5 + unit
}

pub fn jitter_seed_for_run(run_id: &str) -> u64 {
    let hash = blake3::hash(run_id.as_bytes());
    u64::from_le_bytes(hash.as_bytes()[..8].try_into().unwrap_or_default())
}
