//! Append-only, forkable turn log for pipeline executions.
//!
//! A lineage is one execution's ordered history; forking a lineage at a
//! historical turn shares everything up to that turn without copying.

pub mod fs;
pub mod memory;
pub mod store;
pub mod types;

pub use fs::FsTurnLog;
pub use memory::MemoryTurnLog;
pub use store::{SharedTurnLog, TurnLog, TurnLogError, TurnLogResult};
pub use types::{
    AppendTurnRequest, BlobHash, Lineage, LineageId, LineageSummary, StoredTurn, StoredTurnRef,
    TurnCorrelation, TurnEnvelope, TurnId, pipeline_idempotency_key,
};
