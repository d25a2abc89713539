use crate::store::{TurnLog, TurnLogError, TurnLogResult};
use crate::types::{
    AppendTurnRequest, BlobHash, Lineage, LineageId, LineageSummary, ROOT_TURN_ID, StoredTurn,
    StoredTurnRef, TurnId,
};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Turns form one shared tree keyed by parent pointers; each lineage is
/// a head pointer into that tree, so forking costs one map insert.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub(crate) struct LogState {
    pub next_lineage_id: u64,
    pub next_turn_id: u64,
    pub lineages: BTreeMap<LineageId, LineageState>,
    pub turns: BTreeMap<TurnId, StoredTurn>,
    pub idempotency: BTreeMap<String, TurnId>,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub(crate) struct LineageState {
    pub head_turn_id: TurnId,
    pub head_depth: u32,
    pub forked_from: Option<TurnId>,
}

impl Default for LineageState {
    fn default() -> Self {
        Self {
            head_turn_id: ROOT_TURN_ID.to_string(),
            head_depth: 0,
            forked_from: None,
        }
    }
}

impl LogState {
    fn allocate_lineage_id(&mut self) -> LineageId {
        if self.next_lineage_id == 0 {
            self.next_lineage_id = 1;
        }
        let id = self.next_lineage_id;
        self.next_lineage_id += 1;
        id.to_string()
    }

    fn allocate_turn_id(&mut self) -> TurnId {
        if self.next_turn_id == 0 {
            self.next_turn_id = 1;
        }
        let id = self.next_turn_id;
        self.next_turn_id += 1;
        id.to_string()
    }

    fn turn_depth(&self, turn_id: &str) -> Option<u32> {
        self.turns.get(turn_id).map(|turn| turn.depth)
    }

    fn lineage_has_turn(&self, lineage: &LineageState, turn_id: &str) -> bool {
        if turn_id == ROOT_TURN_ID {
            return true;
        }
        let mut cursor = lineage.head_turn_id.as_str();
        while cursor != ROOT_TURN_ID {
            if cursor == turn_id {
                return true;
            }
            let Some(turn) = self.turns.get(cursor) else {
                return false;
            };
            cursor = turn.parent_turn_id.as_str();
        }
        false
    }

    fn content_hash(payload: &[u8]) -> BlobHash {
        blake3::hash(payload).to_hex().to_string()
    }
}

#[derive(Clone, Debug, Default)]
pub struct MemoryTurnLog {
    inner: Arc<Mutex<LogState>>,
}

impl MemoryTurnLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_state(state: LogState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    pub(crate) fn snapshot(&self) -> LogState {
        self.inner.lock().expect("turn log mutex poisoned").clone()
    }
}

#[async_trait::async_trait]
impl TurnLog for MemoryTurnLog {
    async fn create_lineage(&self, base_turn_id: Option<TurnId>) -> TurnLogResult<Lineage> {
        let mut state = self
            .inner
            .lock()
            .map_err(|_| TurnLogError::Backend("turn log mutex poisoned".to_string()))?;

        let (head_turn_id, head_depth, forked_from) = match base_turn_id {
            Some(turn_id) if turn_id != ROOT_TURN_ID => {
                let Some(depth) = state.turn_depth(&turn_id) else {
                    return Err(TurnLogError::NotFound {
                        resource: "turn",
                        id: turn_id,
                    });
                };
                (turn_id.clone(), depth, Some(turn_id))
            }
            _ => (ROOT_TURN_ID.to_string(), 0, None),
        };

        let lineage_id = state.allocate_lineage_id();
        state.lineages.insert(
            lineage_id.clone(),
            LineageState {
                head_turn_id: head_turn_id.clone(),
                head_depth,
                forked_from,
            },
        );

        Ok(Lineage {
            lineage_id,
            head_turn_id,
            head_depth,
        })
    }

    async fn append_turn(&self, request: AppendTurnRequest) -> TurnLogResult<StoredTurn> {
        let mut state = self
            .inner
            .lock()
            .map_err(|_| TurnLogError::Backend("turn log mutex poisoned".to_string()))?;

        let lineage_snapshot = state
            .lineages
            .get(&request.lineage_id)
            .cloned()
            .ok_or_else(|| TurnLogError::NotFound {
                resource: "lineage",
                id: request.lineage_id.clone(),
            })?;

        let key = if request.idempotency_key.is_empty() {
            None
        } else {
            Some(format!("{}|{}", request.lineage_id, request.idempotency_key))
        };

        if let Some(existing_key) = &key {
            if let Some(turn_id) = state.idempotency.get(existing_key) {
                if let Some(turn) = state.turns.get(turn_id) {
                    return Ok(turn.clone());
                }
            }
        }

        let parent_turn_id = request
            .parent_turn_id
            .clone()
            .unwrap_or_else(|| lineage_snapshot.head_turn_id.clone());
        let parent_depth = if parent_turn_id == ROOT_TURN_ID {
            0
        } else {
            state
                .turn_depth(&parent_turn_id)
                .ok_or_else(|| TurnLogError::NotFound {
                    resource: "turn",
                    id: parent_turn_id.clone(),
                })?
        };

        let turn_id = state.allocate_turn_id();
        let mut turn = StoredTurn {
            lineage_id: request.lineage_id.clone(),
            turn_id: turn_id.clone(),
            parent_turn_id,
            depth: parent_depth + 1,
            type_id: request.type_id,
            type_version: request.type_version,
            payload: request.payload,
            idempotency_key: Some(request.idempotency_key).filter(|value| !value.is_empty()),
            content_hash: None,
        };
        turn.content_hash = Some(LogState::content_hash(&turn.payload));

        state.turns.insert(turn_id.clone(), turn.clone());
        if let Some(existing_key) = key {
            state.idempotency.insert(existing_key, turn_id.clone());
        }
        if let Some(lineage) = state.lineages.get_mut(&request.lineage_id) {
            lineage.head_turn_id = turn_id;
            lineage.head_depth = turn.depth;
        }

        Ok(turn)
    }

    async fn fork_lineage(&self, from_turn_id: TurnId) -> TurnLogResult<Lineage> {
        self.create_lineage(Some(from_turn_id)).await
    }

    async fn get_head(&self, lineage_id: &LineageId) -> TurnLogResult<StoredTurnRef> {
        let state = self
            .inner
            .lock()
            .map_err(|_| TurnLogError::Backend("turn log mutex poisoned".to_string()))?;
        let lineage = state
            .lineages
            .get(lineage_id)
            .ok_or_else(|| TurnLogError::NotFound {
                resource: "lineage",
                id: lineage_id.clone(),
            })?;
        Ok(StoredTurnRef {
            lineage_id: lineage_id.clone(),
            turn_id: lineage.head_turn_id.clone(),
            depth: lineage.head_depth,
        })
    }

    async fn list_turns(
        &self,
        lineage_id: &LineageId,
        before_turn_id: Option<&TurnId>,
        limit: usize,
    ) -> TurnLogResult<Vec<StoredTurn>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let state = self
            .inner
            .lock()
            .map_err(|_| TurnLogError::Backend("turn log mutex poisoned".to_string()))?;
        let lineage = state
            .lineages
            .get(lineage_id)
            .ok_or_else(|| TurnLogError::NotFound {
                resource: "lineage",
                id: lineage_id.clone(),
            })?;

        let mut cursor = if let Some(before) = before_turn_id {
            if before == ROOT_TURN_ID {
                return Ok(Vec::new());
            }
            if !state.lineage_has_turn(lineage, before) {
                return Err(TurnLogError::InvalidInput(format!(
                    "turn {} is not reachable from lineage {} head",
                    before, lineage_id
                )));
            }
            let turn = state
                .turns
                .get(before)
                .ok_or_else(|| TurnLogError::NotFound {
                    resource: "turn",
                    id: before.clone(),
                })?;
            turn.parent_turn_id.clone()
        } else {
            lineage.head_turn_id.clone()
        };

        let mut turns = Vec::new();
        while cursor != ROOT_TURN_ID && turns.len() < limit {
            let turn = state
                .turns
                .get(&cursor)
                .ok_or_else(|| TurnLogError::NotFound {
                    resource: "turn",
                    id: cursor.clone(),
                })?;
            turns.push(turn.clone());
            cursor = turn.parent_turn_id.clone();
        }
        turns.reverse();
        Ok(turns)
    }

    async fn list_lineages(&self) -> TurnLogResult<Vec<LineageSummary>> {
        let state = self
            .inner
            .lock()
            .map_err(|_| TurnLogError::Backend("turn log mutex poisoned".to_string()))?;
        Ok(state
            .lineages
            .iter()
            .map(|(lineage_id, lineage)| LineageSummary {
                lineage_id: lineage_id.clone(),
                head_turn_id: lineage.head_turn_id.clone(),
                head_depth: lineage.head_depth,
                head_type_id: state
                    .turns
                    .get(&lineage.head_turn_id)
                    .map(|turn| turn.type_id.clone()),
                forked_from: lineage.forked_from.clone(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(lineage_id: &str, key: &str, payload: &[u8]) -> AppendTurnRequest {
        AppendTurnRequest {
            lineage_id: lineage_id.to_string(),
            parent_turn_id: None,
            type_id: "trellis.turn".to_string(),
            type_version: 1,
            payload: payload.to_vec(),
            idempotency_key: key.to_string(),
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn append_turn_same_idempotency_key_expected_single_turn() {
        let log = MemoryTurnLog::new();
        let lineage = log
            .create_lineage(None)
            .await
            .expect("lineage should be created");

        let first = log
            .append_turn(request(&lineage.lineage_id, "k1", b"hello"))
            .await
            .expect("append should succeed");
        let second = log
            .append_turn(request(&lineage.lineage_id, "k1", b"hello"))
            .await
            .expect("idempotent append should succeed");

        assert_eq!(first.turn_id, second.turn_id);
        let turns = log
            .list_turns(&lineage.lineage_id, None, 16)
            .await
            .expect("turns should list");
        assert_eq!(turns.len(), 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn append_turn_expected_content_hash_and_depth() {
        let log = MemoryTurnLog::new();
        let lineage = log
            .create_lineage(None)
            .await
            .expect("lineage should be created");

        let first = log
            .append_turn(request(&lineage.lineage_id, "k1", b"a"))
            .await
            .expect("append should succeed");
        let second = log
            .append_turn(request(&lineage.lineage_id, "k2", b"b"))
            .await
            .expect("append should succeed");

        assert_eq!(first.depth, 1);
        assert_eq!(second.depth, 2);
        assert_eq!(second.parent_turn_id, first.turn_id);
        assert_eq!(
            first.content_hash.as_deref(),
            Some(blake3::hash(b"a").to_hex().to_string().as_str())
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn fork_lineage_expected_shared_history_until_fork_point() {
        let log = MemoryTurnLog::new();
        let original = log
            .create_lineage(None)
            .await
            .expect("lineage should be created");
        let base = log
            .append_turn(request(&original.lineage_id, "k1", b"shared"))
            .await
            .expect("append should succeed");
        log.append_turn(request(&original.lineage_id, "k2", b"original-only"))
            .await
            .expect("append should succeed");

        let fork = log
            .fork_lineage(base.turn_id.clone())
            .await
            .expect("fork should succeed");
        assert_eq!(fork.head_turn_id, base.turn_id);

        let forked_turns = log
            .list_turns(&fork.lineage_id, None, 16)
            .await
            .expect("turns should list");
        assert_eq!(forked_turns.len(), 1);
        assert_eq!(forked_turns[0].turn_id, base.turn_id);
    }
}
