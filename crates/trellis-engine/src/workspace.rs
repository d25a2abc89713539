use crate::EngineError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

pub type WorkspaceHandle = String;
pub type RevisionId = String;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeConflict {
    pub path: String,
    pub branches: Vec<String>,
    /// Marker-formatted body carrying every branch's version of the
    /// path, for a downstream human or automated resolver.
    pub conflict_body: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeResult {
    pub merged_paths: Vec<String>,
    pub conflicts: Vec<MergeConflict>,
}

impl MergeResult {
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty()
    }
}

/// Adapter over the shared mutable external resource (typically a
/// version-controlled working tree). The engine only ever calls these
/// abstract operations; branch isolation and fan-in merging are built
/// on them.
#[async_trait::async_trait]
pub trait WorkspaceDriver: Send + Sync {
    /// Isolated copy of the target's current state, keyed by
    /// `{lineage_id}/{branch_id}`.
    async fn create_isolated_copy(&self, branch_key: &str) -> Result<WorkspaceHandle, EngineError>;

    async fn write(
        &self,
        handle: &WorkspaceHandle,
        path: &str,
        contents: &[u8],
    ) -> Result<(), EngineError>;

    async fn read(
        &self,
        handle: &WorkspaceHandle,
        path: &str,
    ) -> Result<Option<Vec<u8>>, EngineError>;

    async fn changed_paths(&self, handle: &WorkspaceHandle) -> Result<Vec<String>, EngineError>;

    async fn commit(
        &self,
        handle: &WorkspaceHandle,
        changed_paths: &[String],
        message: &str,
    ) -> Result<RevisionId, EngineError>;

    /// Merges the listed isolated copies back into the shared target.
    /// Conflicts are data, not errors: the result always reports the
    /// exact conflicting paths.
    async fn merge(&self, handles: &[WorkspaceHandle]) -> Result<MergeResult, EngineError>;

    async fn discard(&self, handle: &WorkspaceHandle) -> Result<(), EngineError>;

    async fn snapshot(&self) -> Result<RevisionId, EngineError>;

    async fn restore(&self, revision: &RevisionId) -> Result<(), EngineError>;
}

pub type SharedWorkspaceDriver = Arc<dyn WorkspaceDriver>;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct WorkspaceState {
    target: BTreeMap<String, Vec<u8>>,
    copies: BTreeMap<WorkspaceHandle, IsolatedCopy>,
    revisions: BTreeMap<RevisionId, BTreeMap<String, Vec<u8>>>,
    next_revision: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct IsolatedCopy {
    base: BTreeMap<String, Vec<u8>>,
    files: BTreeMap<String, Vec<u8>>,
    commits: Vec<String>,
}

/// In-memory reference driver: a path→blob map with revision
/// snapshots. Conflict detection is base-relative — a path counts as
/// changed when it differs from the copy's base image.
#[derive(Clone, Default)]
pub struct MemoryWorkspace {
    inner: Arc<Mutex<WorkspaceState>>,
}

impl MemoryWorkspace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, path: &str, contents: &[u8]) {
        let mut state = self.inner.lock().expect("workspace mutex poisoned");
        state.target.insert(path.to_string(), contents.to_vec());
    }

    pub fn target_file(&self, path: &str) -> Option<Vec<u8>> {
        let state = self.inner.lock().expect("workspace mutex poisoned");
        state.target.get(path).cloned()
    }

    pub fn target_paths(&self) -> Vec<String> {
        let state = self.inner.lock().expect("workspace mutex poisoned");
        state.target.keys().cloned().collect()
    }

    pub fn live_copies(&self) -> Vec<WorkspaceHandle> {
        let state = self.inner.lock().expect("workspace mutex poisoned");
        state.copies.keys().cloned().collect()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, WorkspaceState>, EngineError> {
        self.inner
            .lock()
            .map_err(|_| EngineError::Workspace("workspace mutex poisoned".to_string()))
    }
}

#[async_trait::async_trait]
impl WorkspaceDriver for MemoryWorkspace {
    async fn create_isolated_copy(&self, branch_key: &str) -> Result<WorkspaceHandle, EngineError> {
        let mut state = self.lock()?;
        if state.copies.contains_key(branch_key) {
            return Err(EngineError::Workspace(format!(
                "isolated copy '{branch_key}' already exists"
            )));
        }
        let base = state.target.clone();
        state.copies.insert(
            branch_key.to_string(),
            IsolatedCopy {
                files: base.clone(),
                base,
                commits: Vec::new(),
            },
        );
        Ok(branch_key.to_string())
    }

    async fn write(
        &self,
        handle: &WorkspaceHandle,
        path: &str,
        contents: &[u8],
    ) -> Result<(), EngineError> {
        let mut state = self.lock()?;
        let copy = state.copies.get_mut(handle).ok_or_else(|| {
            EngineError::Workspace(format!("unknown isolated copy '{handle}'"))
        })?;
        copy.files.insert(path.to_string(), contents.to_vec());
        Ok(())
    }

    async fn read(
        &self,
        handle: &WorkspaceHandle,
        path: &str,
    ) -> Result<Option<Vec<u8>>, EngineError> {
        let state = self.lock()?;
        let copy = state.copies.get(handle).ok_or_else(|| {
            EngineError::Workspace(format!("unknown isolated copy '{handle}'"))
        })?;
        Ok(copy.files.get(path).cloned())
    }

    async fn changed_paths(&self, handle: &WorkspaceHandle) -> Result<Vec<String>, EngineError> {
        let state = self.lock()?;
        let copy = state.copies.get(handle).ok_or_else(|| {
            EngineError::Workspace(format!("unknown isolated copy '{handle}'"))
        })?;
        Ok(changed_against_base(copy))
    }

    async fn commit(
        &self,
        handle: &WorkspaceHandle,
        changed_paths: &[String],
        message: &str,
    ) -> Result<RevisionId, EngineError> {
        let mut state = self.lock()?;
        let revision = allocate_revision(&mut state);
        let copy = state.copies.get_mut(handle).ok_or_else(|| {
            EngineError::Workspace(format!("unknown isolated copy '{handle}'"))
        })?;
        copy.commits
            .push(format!("{revision}: {message} ({} paths)", changed_paths.len()));
        Ok(revision)
    }

    async fn merge(&self, handles: &[WorkspaceHandle]) -> Result<MergeResult, EngineError> {
        let mut state = self.lock()?;

        // path -> per-branch proposed contents, branch order preserved.
        let mut proposals: BTreeMap<String, Vec<(String, Vec<u8>)>> = BTreeMap::new();
        for handle in handles {
            let copy = state.copies.get(handle).ok_or_else(|| {
                EngineError::Workspace(format!("unknown isolated copy '{handle}'"))
            })?;
            for path in changed_against_base(copy) {
                let contents = copy.files.get(&path).cloned().unwrap_or_default();
                proposals
                    .entry(path)
                    .or_default()
                    .push((handle.clone(), contents));
            }
        }

        let mut result = MergeResult::default();
        for (path, entries) in proposals {
            let distinct: BTreeSet<&Vec<u8>> = entries.iter().map(|(_, contents)| contents).collect();
            if distinct.len() <= 1 {
                let (_, contents) = &entries[0];
                state.target.insert(path.clone(), contents.clone());
                result.merged_paths.push(path);
            } else {
                result.conflicts.push(MergeConflict {
                    branches: entries.iter().map(|(branch, _)| branch.clone()).collect(),
                    conflict_body: render_conflict_markers(&path, &entries),
                    path,
                });
            }
        }

        Ok(result)
    }

    async fn discard(&self, handle: &WorkspaceHandle) -> Result<(), EngineError> {
        let mut state = self.lock()?;
        state.copies.remove(handle);
        Ok(())
    }

    async fn snapshot(&self) -> Result<RevisionId, EngineError> {
        let mut state = self.lock()?;
        let revision = allocate_revision(&mut state);
        let image = state.target.clone();
        state.revisions.insert(revision.clone(), image);
        Ok(revision)
    }

    async fn restore(&self, revision: &RevisionId) -> Result<(), EngineError> {
        let mut state = self.lock()?;
        let image = state.revisions.get(revision).cloned().ok_or_else(|| {
            EngineError::Workspace(format!("unknown revision '{revision}'"))
        })?;
        state.target = image;
        Ok(())
    }
}

fn allocate_revision(state: &mut WorkspaceState) -> RevisionId {
    state.next_revision += 1;
    format!("rev-{}", state.next_revision)
}

fn changed_against_base(copy: &IsolatedCopy) -> Vec<String> {
    copy.files
        .iter()
        .filter(|(path, contents)| copy.base.get(*path) != Some(contents))
        .map(|(path, _)| path.clone())
        .collect()
}

fn render_conflict_markers(path: &str, entries: &[(String, Vec<u8>)]) -> String {
    let mut body = format!("conflict at {path}\n");
    for (branch, contents) in entries {
        body.push_str(&format!("<<<<<<< {branch}\n"));
        body.push_str(&String::from_utf8_lossy(contents));
        if !contents.ends_with(b"\n") {
            body.push('\n');
        }
        body.push_str(">>>>>>>\n");
    }
    body
}
