use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::buffer::{Buffer, BufferArena};
use crate::config::ProcessConfig;
use crate::error::{ProcessError, ProcessResult};
use crate::function::StepRegistry;
use crate::log::ProcessLogger;
use crate::process::ProcessActor;
use crate::state::{ActorState, ActorStateManager, MemoryStateBackend, StateBackend};
use crate::step::StepActor;
use crate::types::{ActorId, KernelProcessEvent, ProcessEvent, ProcessMessage};

use super::{ActorKind, StepCall, StepHandle, StepReply, StepRuntime};

#[derive(Clone)]
enum LocalActor {
    Step(Arc<StepActor>),
    Process(Arc<ProcessActor>),
}

impl LocalActor {
    fn kind(&self) -> ActorKind {
        match self {
            LocalActor::Step(_) => ActorKind::Step,
            LocalActor::Process(_) => ActorKind::Process,
        }
    }
}

/// [`StepRuntime`] that hosts every actor in the current process.
///
/// Each instance owns its own actors, mailboxes and state cache, so two
/// runtimes never observe each other's messages.
pub struct LocalRuntime {
    actors: DashMap<ActorId, LocalActor>,
    messages: BufferArena<ProcessMessage>,
    external_events: BufferArena<KernelProcessEvent>,
    events: BufferArena<ProcessEvent>,
    backend: Arc<dyn StateBackend>,
    states: DashMap<ActorId, Arc<ActorState>>,
    config: ProcessConfig,
    logger: ProcessLogger,
    registry: StepRegistry,
}

impl LocalRuntime {
    /// Runtime with default settings, in-memory state and a `tracing` logger.
    pub fn new(registry: StepRegistry) -> Self {
        let config = ProcessConfig::default();
        Self {
            actors: DashMap::new(),
            messages: BufferArena::new(),
            external_events: BufferArena::new(),
            events: BufferArena::new(),
            backend: Arc::new(MemoryStateBackend::new()),
            states: DashMap::new(),
            logger: ProcessLogger::tracing(config.log_level),
            config,
            registry,
        }
    }

    /// Replace the settings. The logger's level follows `config.log_level`.
    pub fn with_config(mut self, config: ProcessConfig) -> ProcessResult<Self> {
        config.validate()?;
        self.logger.set_level(config.log_level);
        self.config = config;
        Ok(self)
    }

    /// Builder: replace the logger. Its level is kept as given.
    pub fn with_logger(mut self, logger: ProcessLogger) -> Self {
        self.logger = logger;
        self
    }

    /// Builder: persist actor state through `backend`.
    pub fn with_state_backend(mut self, backend: Arc<dyn StateBackend>) -> Self {
        self.backend = backend;
        self
    }

    /// Wrap as the shared handle processes are driven through.
    pub fn into_shared(self) -> Arc<dyn StepRuntime> {
        Arc::new(self)
    }

    /// Number of actors created so far.
    pub fn actor_count(&self) -> usize {
        self.actors.len()
    }

    /// Ids of every actor, sorted.
    pub fn actor_ids(&self) -> Vec<ActorId> {
        let mut ids: Vec<ActorId> = self.actors.iter().map(|a| a.key().clone()).collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl StepRuntime for LocalRuntime {
    async fn create_child(&self, id: ActorId, kind: ActorKind) -> ProcessResult<StepHandle> {
        let actor = self
            .actors
            .entry(id.clone())
            .or_insert_with(|| match kind {
                ActorKind::Step => LocalActor::Step(Arc::new(StepActor::new(id.clone()))),
                ActorKind::Process => {
                    LocalActor::Process(Arc::new(ProcessActor::new(id.clone())))
                }
            })
            .clone();

        if actor.kind() != kind {
            return Err(ProcessError::Initialization(format!(
                "actor {id} already exists as a {:?}",
                actor.kind()
            )));
        }
        Ok(StepHandle::new(id, kind))
    }

    async fn call(&self, handle: &StepHandle, call: StepCall) -> ProcessResult<StepReply> {
        // Clone out so no map shard stays locked while the actor runs.
        let actor = self
            .actors
            .get(&handle.id)
            .map(|a| a.value().clone())
            .ok_or_else(|| ProcessError::ActorNotFound(handle.id.to_string()))?;

        match actor {
            LocalActor::Step(step) => step.handle(call, self).await,
            LocalActor::Process(process) => process.handle(call, self).await,
        }
    }

    fn state(&self, actor: &ActorId) -> Arc<dyn ActorStateManager> {
        self.states
            .entry(actor.clone())
            .or_insert_with(|| Arc::new(ActorState::new(actor.clone(), self.backend.clone())))
            .clone()
    }

    fn message_buffer(&self, actor: &ActorId) -> Arc<dyn Buffer<ProcessMessage>> {
        self.messages.mailbox(actor)
    }

    fn external_event_buffer(&self, actor: &ActorId) -> Arc<dyn Buffer<KernelProcessEvent>> {
        self.external_events.mailbox(actor)
    }

    fn event_buffer(&self, actor: &ActorId) -> Arc<dyn Buffer<ProcessEvent>> {
        self.events.mailbox(actor)
    }

    fn config(&self) -> &ProcessConfig {
        &self.config
    }

    fn logger(&self) -> &ProcessLogger {
        &self.logger
    }

    fn step_registry(&self) -> &StepRegistry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn create_child_is_idempotent_per_kind() {
        let runtime = LocalRuntime::new(StepRegistry::new());
        let id = ActorId::new("p.cut");

        let first = runtime.create_child(id.clone(), ActorKind::Step).await.unwrap();
        let second = runtime.create_child(id.clone(), ActorKind::Step).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(runtime.actor_count(), 1);

        let err = runtime
            .create_child(id, ActorKind::Process)
            .await
            .unwrap_err();
        assert!(err.is_initialization());
    }

    #[tokio::test]
    async fn call_to_unknown_actor() {
        let runtime = LocalRuntime::new(StepRegistry::new());
        let handle = StepHandle::new(ActorId::new("ghost"), ActorKind::Step);
        let err = runtime
            .call(&handle, StepCall::ActivateStep)
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::ActorNotFound(ref id) if id == "ghost"));
    }

    #[tokio::test]
    async fn buffers_are_per_actor_and_shared_per_runtime() {
        let runtime = LocalRuntime::new(StepRegistry::new());
        let id = ActorId::new("p");
        runtime
            .external_event_buffer(&id)
            .enqueue(KernelProcessEvent::new("Start", json!(null)))
            .await
            .unwrap();

        let drained = runtime.external_event_buffer(&id).dequeue_all().await.unwrap();
        assert_eq!(drained.len(), 1);
        assert!(runtime
            .external_event_buffer(&ActorId::new("q"))
            .dequeue_all()
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn state_manager_is_cached_per_actor() {
        let runtime = LocalRuntime::new(StepRegistry::new());
        let id = ActorId::new("p");
        runtime.state(&id).set_state("k", json!(1)).await.unwrap();
        assert_eq!(
            runtime.state(&id).try_get_state("k").await.unwrap(),
            Some(json!(1))
        );
    }

    #[test]
    fn with_config_validates() {
        let bad = ProcessConfig::default().with_max_supersteps(0);
        assert!(LocalRuntime::new(StepRegistry::new()).with_config(bad).is_err());

        let runtime = LocalRuntime::new(StepRegistry::new())
            .with_config(ProcessConfig::default().with_max_supersteps(5))
            .unwrap();
        assert_eq!(runtime.config().max_supersteps, 5);
    }
}
