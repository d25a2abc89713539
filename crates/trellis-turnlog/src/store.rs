use crate::types::{
    AppendTurnRequest, Lineage, LineageId, LineageSummary, StoredTurn, StoredTurnRef, TurnId,
};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum TurnLogError {
    #[error("resource not found: {resource} ({id})")]
    NotFound { resource: &'static str, id: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("backend failure: {0}")]
    Backend(String),
}

pub type TurnLogResult<T> = Result<T, TurnLogError>;

pub type SharedTurnLog = Arc<dyn TurnLog>;

/// Abstract append-only, forkable event/checkpoint store. The engine's
/// sole persistence path; backends may be in-process or remote.
#[async_trait::async_trait]
pub trait TurnLog: Send + Sync {
    /// Without a base turn, opens a fresh lineage. With one, forks the
    /// owning lineage at that turn: history up to the base is shared,
    /// not copied.
    async fn create_lineage(&self, base_turn_id: Option<TurnId>) -> TurnLogResult<Lineage>;

    /// Appends one turn at the lineage head. Appends with a previously
    /// seen `(lineage, idempotency_key)` pair return the stored turn
    /// instead of duplicating it.
    async fn append_turn(&self, request: AppendTurnRequest) -> TurnLogResult<StoredTurn>;

    /// Alias for `create_lineage(Some(turn_id))`.
    async fn fork_lineage(&self, from_turn_id: TurnId) -> TurnLogResult<Lineage>;

    async fn get_head(&self, lineage_id: &LineageId) -> TurnLogResult<StoredTurnRef>;

    /// Turns in append order, oldest first. `before_turn_id` pages
    /// backwards from (exclusive of) the given turn.
    async fn list_turns(
        &self,
        lineage_id: &LineageId,
        before_turn_id: Option<&TurnId>,
        limit: usize,
    ) -> TurnLogResult<Vec<StoredTurn>>;

    async fn list_lineages(&self) -> TurnLogResult<Vec<LineageSummary>>;
}
