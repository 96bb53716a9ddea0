//! Versioned snapshot log: append-only JSONL history of actor state.
//!
//! Each save appends a `VersionedSnapshot<T>` line and the latest line is the
//! current state. The version counter is read from disk once per log and then
//! kept in memory. Once the file holds twice the retained number of versions
//! it is rewritten with only the newest ones.

use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::ProcessResult;
use crate::types::ActorId;

use super::{StateBackend, StateMap};

/// Versions kept after compaction unless configured otherwise.
pub const DEFAULT_RETAINED_VERSIONS: usize = 16;

/// A snapshot with version metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VersionedSnapshot<T> {
    /// Monotonically increasing, starting at 1.
    pub version: u64,
    pub timestamp: DateTime<Utc>,
    pub snapshot: T,
}

#[derive(Debug, Clone, Copy)]
struct Cursor {
    last_version: u64,
    lines: usize,
}

/// Append-only versioned log stored as one JSONL file.
pub struct SnapshotLog<T> {
    path: PathBuf,
    retain: usize,
    /// `None` until the file has been scanned. Also serializes writers.
    cursor: Mutex<Option<Cursor>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> SnapshotLog<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            retain: DEFAULT_RETAINED_VERSIONS,
            cursor: Mutex::new(None),
            _marker: PhantomData,
        }
    }

    /// Builder: keep at least `retain` versions (minimum 1) when compacting.
    pub fn with_retained_versions(mut self, retain: usize) -> Self {
        self.retain = retain.max(1);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a snapshot. Returns its version number.
    pub async fn save(&self, snapshot: &T) -> ProcessResult<u64> {
        let mut guard = self.cursor.lock().await;
        // Left as `None` on error so the next save rescans the file.
        let mut cursor = match guard.take() {
            Some(cursor) => cursor,
            None => self.scan().await?,
        };

        let version = cursor.last_version + 1;
        let versioned = VersionedSnapshot {
            version,
            timestamp: Utc::now(),
            snapshot,
        };
        let mut line = serde_json::to_string(&versioned)?;
        line.push('\n');

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        cursor.last_version = version;
        cursor.lines += 1;
        if cursor.lines >= self.retain * 2 {
            cursor.lines = self.compact().await?;
        }
        *guard = Some(cursor);
        Ok(version)
    }

    pub async fn load_latest(&self) -> ProcessResult<Option<VersionedSnapshot<T>>> {
        Ok(self.read_all().await?.pop())
    }

    async fn scan(&self) -> ProcessResult<Cursor> {
        let entries = self.read_all().await?;
        Ok(Cursor {
            last_version: entries.last().map_or(0, |e| e.version),
            lines: entries.len(),
        })
    }

    // Rewrite the file with the newest `retain` entries; returns how many remain.
    async fn compact(&self) -> ProcessResult<usize> {
        let mut entries = self.read_all().await?;
        let stale = entries.len().saturating_sub(self.retain);
        entries.drain(..stale);

        let mut content = String::new();
        for entry in &entries {
            content.push_str(&serde_json::to_string(entry)?);
            content.push('\n');
        }
        let tmp = self.path.with_extension("jsonl.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(entries.len())
    }

    async fn read_all(&self) -> ProcessResult<Vec<VersionedSnapshot<T>>> {
        if !tokio::fs::try_exists(&self.path).await? {
            return Ok(Vec::new());
        }

        let content = tokio::fs::read_to_string(&self.path).await?;
        let mut entries = Vec::new();
        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            entries.push(serde_json::from_str(trimmed)?);
        }
        Ok(entries)
    }
}

/// [`StateBackend`] keeping one snapshot log per actor under a directory.
pub struct SnapshotStateBackend {
    root: PathBuf,
    retain: usize,
    logs: DashMap<ActorId, Arc<SnapshotLog<StateMap>>>,
}

impl SnapshotStateBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            retain: DEFAULT_RETAINED_VERSIONS,
            logs: DashMap::new(),
        }
    }

    /// Builder: versions each actor's log keeps when compacted.
    pub fn with_retained_versions(mut self, retain: usize) -> Self {
        self.retain = retain.max(1);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Snapshot log of one actor, opened once per backend.
    pub fn log(&self, actor: &ActorId) -> Arc<SnapshotLog<StateMap>> {
        self.logs
            .entry(actor.clone())
            .or_insert_with(|| {
                let path = self.root.join(format!("{}.jsonl", file_stem(actor)));
                Arc::new(SnapshotLog::new(path).with_retained_versions(self.retain))
            })
            .clone()
    }
}

// Actor ids become file names; keep path separators out of them.
fn file_stem(actor: &ActorId) -> String {
    let mut stem = String::with_capacity(actor.as_str().len());
    for c in actor.as_str().chars() {
        match c {
            '%' => stem.push_str("%25"),
            '/' => stem.push_str("%2F"),
            '\\' => stem.push_str("%5C"),
            other => stem.push(other),
        }
    }
    stem
}

#[async_trait]
impl StateBackend for SnapshotStateBackend {
    async fn load(&self, actor: &ActorId) -> ProcessResult<Option<StateMap>> {
        Ok(self.log(actor).load_latest().await?.map(|v| v.snapshot))
    }

    async fn persist(&self, actor: &ActorId, state: &StateMap) -> ProcessResult<()> {
        self.log(actor).save(state).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProcessError;
    use crate::state::{ActorState, ActorStateManager, STEP_ACTIVATED_STATE};
    use serde_json::json;

    async fn line_count(path: &Path) -> usize {
        tokio::fs::read_to_string(path).await.unwrap().lines().count()
    }

    #[tokio::test]
    async fn save_and_load_latest() {
        let dir = tempfile::tempdir().unwrap();
        let log: SnapshotLog<String> = SnapshotLog::new(dir.path().join("s.jsonl"));

        assert!(log.load_latest().await.unwrap().is_none());
        assert_eq!(log.save(&"a".to_string()).await.unwrap(), 1);
        assert_eq!(log.save(&"b".to_string()).await.unwrap(), 2);

        let latest = log.load_latest().await.unwrap().unwrap();
        assert_eq!(latest.version, 2);
        assert_eq!(latest.snapshot, "b");
    }

    #[tokio::test]
    async fn reopened_log_continues_numbering() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("n.jsonl");
        let first: SnapshotLog<u32> = SnapshotLog::new(&path);
        first.save(&1).await.unwrap();
        first.save(&2).await.unwrap();

        let second: SnapshotLog<u32> = SnapshotLog::new(&path);
        assert_eq!(second.save(&3).await.unwrap(), 3);
        assert_eq!(line_count(&path).await, 3);
    }

    #[tokio::test]
    async fn compaction_bounds_file_and_keeps_latest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.jsonl");
        let log: SnapshotLog<u32> = SnapshotLog::new(&path).with_retained_versions(2);

        for n in 1..=10 {
            assert_eq!(log.save(&n).await.unwrap(), u64::from(n));
            assert!(line_count(&path).await < 4);
        }

        let latest = log.load_latest().await.unwrap().unwrap();
        assert_eq!(latest.version, 10);
        assert_eq!(latest.snapshot, 10);
        assert!(!tokio::fs::try_exists(path.with_extension("jsonl.tmp"))
            .await
            .unwrap());

        // numbering survives compaction and reopening
        let reopened: SnapshotLog<u32> = SnapshotLog::new(&path).with_retained_versions(2);
        assert_eq!(reopened.save(&11).await.unwrap(), 11);
    }

    #[tokio::test]
    async fn corrupt_line_is_serialization_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.jsonl");
        tokio::fs::write(&path, "not json\n").await.unwrap();
        let log: SnapshotLog<u32> = SnapshotLog::new(path);
        assert!(matches!(
            log.load_latest().await.unwrap_err(),
            ProcessError::Serialization(_)
        ));
        assert!(matches!(
            log.save(&1).await.unwrap_err(),
            ProcessError::Serialization(_)
        ));
    }

    #[tokio::test]
    async fn backend_persists_per_actor() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(SnapshotStateBackend::new(dir.path().join("state")));
        let actor = ActorId::new("kitchen.cook");

        let state = ActorState::new(actor.clone(), backend.clone());
        state.set_state(STEP_ACTIVATED_STATE, json!(true)).await.unwrap();
        state.save_state().await.unwrap();

        let reloaded = ActorState::new(actor.clone(), backend.clone());
        assert_eq!(
            reloaded.try_get_state(STEP_ACTIVATED_STATE).await.unwrap(),
            Some(json!(true))
        );
        assert!(backend.log(&actor).path().ends_with("kitchen.cook.jsonl"));
        assert!(Arc::ptr_eq(&backend.log(&actor), &backend.log(&actor)));
        assert!(backend
            .load(&ActorId::new("kitchen.cut"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn backend_applies_retention_to_every_actor() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SnapshotStateBackend::new(dir.path()).with_retained_versions(1);
        let actor = ActorId::new("p.counter");
        for n in 0..5 {
            let mut state = StateMap::new();
            state.insert("n".into(), json!(n));
            backend.persist(&actor, &state).await.unwrap();
        }
        assert!(line_count(backend.log(&actor).path()).await < 2);
        let latest = backend.load(&actor).await.unwrap().unwrap();
        assert_eq!(latest["n"], json!(4));
    }

    #[test]
    fn file_stem_escapes_separators() {
        assert_eq!(file_stem(&ActorId::new("a/b")), "a%2Fb");
        assert_eq!(file_stem(&ActorId::new("a%2Fb")), "a%252Fb");
    }
}
