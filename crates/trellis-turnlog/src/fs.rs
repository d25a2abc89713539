use crate::memory::{LogState, MemoryTurnLog};
use crate::store::{TurnLog, TurnLogError, TurnLogResult};
use crate::types::{
    AppendTurnRequest, Lineage, LineageId, LineageSummary, StoredTurn, StoredTurnRef, TurnId,
};
use std::fs;
use std::path::{Path, PathBuf};

const STATE_FILE_NAME: &str = "turnlog-state.json";

/// File-backed log: the in-memory tree persisted as JSON after every
/// mutation, written via tmp file + rename so a crash never leaves a
/// torn state file.
#[derive(Clone, Debug)]
pub struct FsTurnLog {
    state_file: PathBuf,
    inner: MemoryTurnLog,
}

impl FsTurnLog {
    pub fn new<P: AsRef<Path>>(root: P) -> TurnLogResult<Self> {
        fs::create_dir_all(root.as_ref())
            .map_err(|err| TurnLogError::Backend(format!("create log root failed: {err}")))?;
        let state_file = root.as_ref().join(STATE_FILE_NAME);
        let state = if state_file.exists() {
            let raw = fs::read(&state_file)
                .map_err(|err| TurnLogError::Backend(format!("read state file failed: {err}")))?;
            serde_json::from_slice::<LogState>(&raw)
                .map_err(|err| TurnLogError::Serialization(err.to_string()))?
        } else {
            LogState::default()
        };

        Ok(Self {
            state_file,
            inner: MemoryTurnLog::from_state(state),
        })
    }

    fn persist(&self) -> TurnLogResult<()> {
        let snapshot = self.inner.snapshot();
        let raw = serde_json::to_vec_pretty(&snapshot)
            .map_err(|err| TurnLogError::Serialization(err.to_string()))?;
        let tmp = self.state_file.with_extension("json.tmp");
        fs::write(&tmp, raw)
            .map_err(|err| TurnLogError::Backend(format!("write state file failed: {err}")))?;
        fs::rename(&tmp, &self.state_file)
            .map_err(|err| TurnLogError::Backend(format!("rename state file failed: {err}")))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl TurnLog for FsTurnLog {
    async fn create_lineage(&self, base_turn_id: Option<TurnId>) -> TurnLogResult<Lineage> {
        let created = self.inner.create_lineage(base_turn_id).await?;
        self.persist()?;
        Ok(created)
    }

    async fn append_turn(&self, request: AppendTurnRequest) -> TurnLogResult<StoredTurn> {
        let turn = self.inner.append_turn(request).await?;
        self.persist()?;
        Ok(turn)
    }

    async fn fork_lineage(&self, from_turn_id: TurnId) -> TurnLogResult<Lineage> {
        let lineage = self.inner.fork_lineage(from_turn_id).await?;
        self.persist()?;
        Ok(lineage)
    }

    async fn get_head(&self, lineage_id: &LineageId) -> TurnLogResult<StoredTurnRef> {
        self.inner.get_head(lineage_id).await
    }

    async fn list_turns(
        &self,
        lineage_id: &LineageId,
        before_turn_id: Option<&TurnId>,
        limit: usize,
    ) -> TurnLogResult<Vec<StoredTurn>> {
        self.inner
            .list_turns(lineage_id, before_turn_id, limit)
            .await
    }

    async fn list_lineages(&self) -> TurnLogResult<Vec<LineageSummary>> {
        self.inner.list_lineages().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test(flavor = "current_thread")]
    async fn reopen_expected_state_survives_restart() {
        let root = TempDir::new().expect("temp dir should create");
        let lineage_id;
        {
            let log = FsTurnLog::new(root.path()).expect("log should initialize");
            let lineage = log
                .create_lineage(None)
                .await
                .expect("lineage should be created");
            lineage_id = lineage.lineage_id.clone();
            log.append_turn(AppendTurnRequest {
                lineage_id: lineage.lineage_id,
                parent_turn_id: None,
                type_id: "trellis.turn".to_string(),
                type_version: 1,
                payload: b"persisted".to_vec(),
                idempotency_key: "k1".to_string(),
            })
            .await
            .expect("append should succeed");
        }

        let reopened = FsTurnLog::new(root.path()).expect("log should reopen");
        let turns = reopened
            .list_turns(&lineage_id, None, 16)
            .await
            .expect("turns should list");
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].payload, b"persisted");
    }
}
