//! Per-actor key/value state.
//!
//! Actors stage entries through an [`ActorStateManager`] and make them durable
//! with [`ActorStateManager::save_state`]. Entries not yet saved are lost if the
//! runtime goes away.

#[cfg(feature = "native")]
pub mod snapshot;

#[cfg(feature = "native")]
pub use snapshot::{
    SnapshotLog, SnapshotStateBackend, VersionedSnapshot, DEFAULT_RETAINED_VERSIONS,
};

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::ProcessResult;
use crate::types::ActorId;

/// Serialized [`ProcessInfo`](crate::info::ProcessInfo) of a process actor.
pub const PROCESS_INFO_STATE: &str = "ProcessInfoState";
/// Actor id of the owning process, or null for a root process.
pub const STEP_PARENT_PROCESS_ID: &str = "StepParentProcessId";
/// `true` once a step actor has been activated.
pub const STEP_ACTIVATED_STATE: &str = "StepActivatedState";
/// Serialized [`StepInfo`](crate::info::StepInfo) of a step actor, including its user state.
pub const STEP_INFO_STATE: &str = "StepInfoState";

pub type StateMap = BTreeMap<String, Value>;

/// Key/value state of one actor.
#[async_trait]
pub trait ActorStateManager: Send + Sync {
    /// Stage `value` under `key` unless the key is present. Returns whether it was added.
    async fn try_add_state(&self, key: &str, value: Value) -> ProcessResult<bool>;

    async fn set_state(&self, key: &str, value: Value) -> ProcessResult<()>;

    async fn try_get_state(&self, key: &str) -> ProcessResult<Option<Value>>;

    /// Make staged entries durable.
    async fn save_state(&self) -> ProcessResult<()>;
}

pub async fn get_typed<T: DeserializeOwned>(
    state: &dyn ActorStateManager,
    key: &str,
) -> ProcessResult<Option<T>> {
    match state.try_get_state(key).await? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

pub async fn set_typed<T: Serialize + ?Sized>(
    state: &dyn ActorStateManager,
    key: &str,
    value: &T,
) -> ProcessResult<()> {
    state.set_state(key, serde_json::to_value(value)?).await
}

pub async fn try_add_typed<T: Serialize + ?Sized>(
    state: &dyn ActorStateManager,
    key: &str,
    value: &T,
) -> ProcessResult<bool> {
    state.try_add_state(key, serde_json::to_value(value)?).await
}

/// Durable storage behind [`ActorState`].
#[async_trait]
pub trait StateBackend: Send + Sync {
    async fn load(&self, actor: &ActorId) -> ProcessResult<Option<StateMap>>;

    async fn persist(&self, actor: &ActorId, state: &StateMap) -> ProcessResult<()>;
}

/// [`ActorStateManager`] that loads from a backend on first access.
pub struct ActorState {
    actor: ActorId,
    backend: Arc<dyn StateBackend>,
    entries: Mutex<Option<StateMap>>,
}

impl ActorState {
    pub fn new(actor: ActorId, backend: Arc<dyn StateBackend>) -> Self {
        Self {
            actor,
            backend,
            entries: Mutex::new(None),
        }
    }

    pub fn actor(&self) -> &ActorId {
        &self.actor
    }

    async fn with_entries<R>(&self, f: impl FnOnce(&mut StateMap) -> R) -> ProcessResult<R> {
        let mut guard = self.entries.lock().await;
        if guard.is_none() {
            let loaded = self.backend.load(&self.actor).await?.unwrap_or_default();
            *guard = Some(loaded);
        }
        let entries = guard.get_or_insert_with(StateMap::new);
        Ok(f(entries))
    }
}

#[async_trait]
impl ActorStateManager for ActorState {
    async fn try_add_state(&self, key: &str, value: Value) -> ProcessResult<bool> {
        self.with_entries(|entries| {
            if entries.contains_key(key) {
                false
            } else {
                entries.insert(key.to_string(), value);
                true
            }
        })
        .await
    }

    async fn set_state(&self, key: &str, value: Value) -> ProcessResult<()> {
        self.with_entries(|entries| {
            entries.insert(key.to_string(), value);
        })
        .await
    }

    async fn try_get_state(&self, key: &str) -> ProcessResult<Option<Value>> {
        self.with_entries(|entries| entries.get(key).cloned()).await
    }

    async fn save_state(&self) -> ProcessResult<()> {
        let guard = self.entries.lock().await;
        match guard.as_ref() {
            Some(entries) => self.backend.persist(&self.actor, entries).await,
            None => Ok(()),
        }
    }
}

/// Backend that keeps saved state in memory for the life of the runtime.
#[derive(Default)]
pub struct MemoryStateBackend {
    saved: DashMap<ActorId, StateMap>,
}

impl MemoryStateBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last saved state of `actor`.
    pub fn saved(&self, actor: &ActorId) -> Option<StateMap> {
        self.saved.get(actor).map(|entry| entry.value().clone())
    }
}

#[async_trait]
impl StateBackend for MemoryStateBackend {
    async fn load(&self, actor: &ActorId) -> ProcessResult<Option<StateMap>> {
        Ok(self.saved(actor))
    }

    async fn persist(&self, actor: &ActorId, state: &StateMap) -> ProcessResult<()> {
        self.saved.insert(actor.clone(), state.clone());
        Ok(())
    }
}
