//! Step actor: one step's logic plus its inbox.
//!
//! Lifecycle: `initialize` binds a [`StepInfo`], `activate` runs first-use
//! setup, then the owning process drives `prepare` (drain the mailbox) and
//! `process` (invoke functions, publish events) once per superstep.

use std::collections::{HashMap, VecDeque};

use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::error::{ProcessError, ProcessResult};
use crate::function::{FunctionMetadata, KernelArguments, KernelProcessStepContext, StepBehavior};
use crate::info::{on_error_event, on_result_event, StepInfo, StepNode};
use crate::runtime::{StepCall, StepReply, StepRuntime};
use crate::state::{
    get_typed, set_typed, try_add_typed, STEP_ACTIVATED_STATE, STEP_INFO_STATE,
    STEP_PARENT_PROCESS_ID,
};
use crate::types::{ActorId, KernelProcessEvent, ProcessEvent, ProcessMessage};

const SOURCE: &str = "step";

/// Actor hosting one step.
pub struct StepActor {
    id: ActorId,
    core: Mutex<StepCore>,
}

#[derive(Default)]
struct StepCore {
    info: Option<StepInfo>,
    parent: Option<ActorId>,
    behavior: Option<Box<dyn StepBehavior>>,
    activated: bool,
    functions: HashMap<String, FunctionMetadata>,
    /// Arguments bound so far, per function.
    pending_inputs: HashMap<String, KernelArguments>,
    incoming: VecDeque<ProcessMessage>,
}

// Outcome of delivering one message to its function.
enum Delivery {
    Waiting,
    Completed {
        events: Vec<KernelProcessEvent>,
        result: Option<Value>,
    },
    Failed(ProcessError),
}

impl StepActor {
    pub fn new(id: ActorId) -> Self {
        Self {
            id,
            core: Mutex::new(StepCore::default()),
        }
    }

    pub fn id(&self) -> &ActorId {
        &self.id
    }

    pub async fn handle(&self, call: StepCall, rt: &dyn StepRuntime) -> ProcessResult<StepReply> {
        let mut core = self.core.lock().await;
        match call {
            StepCall::InitializeStep {
                info,
                parent_process_id,
            } => {
                self.initialize(&mut core, info, parent_process_id, rt)
                    .await?;
                Ok(StepReply::Done)
            }
            StepCall::ActivateStep => {
                self.activate(&mut core, rt).await?;
                Ok(StepReply::Done)
            }
            StepCall::PrepareIncomingMessages => {
                let count = self.prepare(&mut core, rt).await?;
                Ok(StepReply::Count { count })
            }
            StepCall::ProcessIncomingMessages => {
                self.process(&mut core, rt).await?;
                Ok(StepReply::Done)
            }
            StepCall::GetStepInfo => Ok(StepReply::Info {
                node: StepNode::Step(self.current_info(&core)?),
            }),
            other => Err(ProcessError::UnsupportedCall {
                actor: self.id.to_string(),
                call: other.name().to_string(),
            }),
        }
    }

    async fn initialize(
        &self,
        core: &mut StepCore,
        mut info: StepInfo,
        parent: Option<ActorId>,
        rt: &dyn StepRuntime,
    ) -> ProcessResult<()> {
        if core.info.is_some() {
            return Ok(());
        }
        if info.state.name.is_empty() {
            return Err(ProcessError::MissingName {
                id: info.state.id.clone(),
            });
        }
        if info.id().is_none() {
            return Err(ProcessError::MissingStepId {
                name: info.state.name.clone(),
            });
        }
        let behavior = rt.step_registry().create(&info.step_type)?;

        let state = rt.state(&self.id);
        // A checkpoint from an earlier run wins over the descriptor's seed state.
        if let Some(saved) = get_typed::<StepInfo>(state.as_ref(), STEP_INFO_STATE).await? {
            if saved.state.state.is_some() {
                info.state.state = saved.state.state;
            }
        }
        set_typed(state.as_ref(), STEP_INFO_STATE, &info).await?;
        set_typed(state.as_ref(), STEP_PARENT_PROCESS_ID, &parent).await?;
        try_add_typed(state.as_ref(), STEP_ACTIVATED_STATE, &false).await?;
        state.save_state().await?;

        rt.logger().debug(
            SOURCE,
            &self.id,
            &format!("initialized step '{}' ({})", info.state.name, info.step_type),
        );
        core.info = Some(info);
        core.parent = parent;
        core.behavior = Some(behavior);
        Ok(())
    }

    async fn activate(&self, core: &mut StepCore, rt: &dyn StepRuntime) -> ProcessResult<()> {
        if core.activated {
            return Ok(());
        }
        if core.info.is_none() {
            self.rehydrate(core, rt).await?;
        }

        let user_state = core.info.as_ref().and_then(|i| i.state.state.clone());
        let behavior = core
            .behavior
            .as_mut()
            .ok_or_else(|| ProcessError::NotInitialized(self.id.to_string()))?;
        behavior.activate(user_state).await?;

        core.functions = behavior
            .functions()
            .into_iter()
            .map(|f| (f.name.clone(), f))
            .collect();
        core.pending_inputs = core
            .functions
            .keys()
            .map(|name| (name.clone(), KernelArguments::new()))
            .collect();

        let state = rt.state(&self.id);
        set_typed(state.as_ref(), STEP_ACTIVATED_STATE, &true).await?;
        state.save_state().await?;
        core.activated = true;
        Ok(())
    }

    // Rebuild an actor whose descriptor only survives in saved state.
    async fn rehydrate(&self, core: &mut StepCore, rt: &dyn StepRuntime) -> ProcessResult<()> {
        let state = rt.state(&self.id);
        let info = get_typed::<StepInfo>(state.as_ref(), STEP_INFO_STATE)
            .await?
            .ok_or_else(|| ProcessError::NotInitialized(self.id.to_string()))?;
        let parent = get_typed::<Option<ActorId>>(state.as_ref(), STEP_PARENT_PROCESS_ID)
            .await?
            .flatten();
        self.initialize(core, info, parent, rt).await
    }

    async fn prepare(&self, core: &mut StepCore, rt: &dyn StepRuntime) -> ProcessResult<usize> {
        self.activate(core, rt).await?;
        let drained = rt.message_buffer(&self.id).dequeue_all().await?;
        let count = drained.len();
        core.incoming.extend(drained);
        Ok(count)
    }

    async fn process(&self, core: &mut StepCore, rt: &dyn StepRuntime) -> ProcessResult<()> {
        self.activate(core, rt).await?;
        let messages = std::mem::take(&mut core.incoming);
        if messages.is_empty() {
            return Ok(());
        }

        let (namespace, local_id) = {
            let info = core
                .info
                .as_ref()
                .ok_or_else(|| ProcessError::NotInitialized(self.id.to_string()))?;
            (info.namespace(), info.id().unwrap_or_default().to_string())
        };
        let outbox = rt.event_buffer(&self.id);

        for message in messages {
            let function = message.function_name.clone();
            match Self::deliver(core, message, &local_id).await {
                Delivery::Waiting => {}
                Delivery::Completed { events, result } => {
                    for event in events {
                        outbox
                            .enqueue(ProcessEvent::new(namespace.clone(), local_id.as_str(), event))
                            .await?;
                    }
                    let on_result = KernelProcessEvent::new(
                        on_result_event(&function),
                        result.unwrap_or(Value::Null),
                    );
                    outbox
                        .enqueue(ProcessEvent::new(namespace.clone(), local_id.as_str(), on_result))
                        .await?;
                }
                Delivery::Failed(err) => {
                    rt.logger().error(
                        SOURCE,
                        &self.id,
                        &format!("function '{function}' failed: {err}"),
                    );
                    let on_error = KernelProcessEvent::new(
                        on_error_event(&function),
                        json!({ "error": err.to_string() }),
                    );
                    outbox
                        .enqueue(
                            ProcessEvent::new(namespace.clone(), local_id.as_str(), on_error)
                                .with_error(true),
                        )
                        .await?;
                }
            }
        }

        self.checkpoint(core, rt).await
    }

    // Bind the message's values and invoke once every parameter is present.
    async fn deliver(core: &mut StepCore, message: ProcessMessage, local_id: &str) -> Delivery {
        let name = message.function_name;
        let Some(metadata) = core.functions.get(&name) else {
            return Delivery::Failed(ProcessError::FunctionNotFound {
                step: local_id.to_string(),
                function: name,
            });
        };
        let parameters = metadata.parameters.clone();

        let pending = core.pending_inputs.entry(name.clone()).or_default();
        if message.values.is_empty() && parameters.len() == 1 {
            if let Some(data) = message.target_event_data {
                pending.insert(parameters[0].clone(), data);
            }
        }
        for (key, value) in message.values {
            pending.insert(key, value);
        }
        if !parameters.iter().all(|p| pending.contains(p)) {
            return Delivery::Waiting;
        }
        let args = std::mem::take(pending);

        let Some(behavior) = core.behavior.as_mut() else {
            return Delivery::Failed(ProcessError::NotInitialized(local_id.to_string()));
        };
        let mut ctx = KernelProcessStepContext::new(local_id);
        match behavior.invoke(&name, args, &mut ctx).await {
            Ok(result) => Delivery::Completed {
                events: ctx.take_events(),
                result,
            },
            Err(err) => Delivery::Failed(err),
        }
    }

    // Persist the behavior's user state alongside the descriptor.
    async fn checkpoint(&self, core: &mut StepCore, rt: &dyn StepRuntime) -> ProcessResult<()> {
        let snapshot = match core.behavior.as_ref() {
            Some(behavior) => behavior.snapshot_state()?,
            None => None,
        };
        let (Some(snapshot), Some(info)) = (snapshot, core.info.as_mut()) else {
            return Ok(());
        };
        info.state.state = Some(snapshot);

        let state = rt.state(&self.id);
        set_typed(state.as_ref(), STEP_INFO_STATE, &*info).await?;
        state.save_state().await
    }

    fn current_info(&self, core: &StepCore) -> ProcessResult<StepInfo> {
        let mut info = core
            .info
            .clone()
            .ok_or_else(|| ProcessError::NotInitialized(self.id.to_string()))?;
        if let Some(behavior) = core.behavior.as_ref() {
            if let Some(snapshot) = behavior.snapshot_state()? {
                info.state.state = Some(snapshot);
            }
        }
        Ok(info)
    }

    pub async fn parent(&self) -> Option<ActorId> {
        self.core.lock().await.parent.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::{StepRegistry, SyncFunction};
    use crate::runtime::{ActorKind, LocalRuntime, StepHandle};
    use crate::types::{KernelProcessEdge, KernelProcessFunctionTarget, ProcessMessageFactory};

    fn registry() -> StepRegistry {
        let mut registry = StepRegistry::new();
        registry
            .register_functions(
                "Mixer",
                [
                    SyncFunction::new("mix", &["a", "b"], |args, _ctx| {
                        let a: i64 = args.get("a")?;
                        let b: i64 = args.get("b")?;
                        Ok(Some(json!(a + b)))
                    })
                    .arc(),
                    SyncFunction::new("double", &["n"], |args, ctx| {
                        let n: i64 = args.get("n")?;
                        ctx.emit_event("Doubled", json!(n * 2));
                        Ok(None)
                    })
                    .arc(),
                    SyncFunction::new("fail", &[], |_args, _ctx| {
                        Err(anyhow::anyhow!("burnt").into())
                    })
                    .arc(),
                ],
            )
            .unwrap();
        registry
    }

    async fn mixer(runtime: &LocalRuntime) -> StepHandle {
        let handle = runtime
            .create_child(ActorId::new("p.mixer"), ActorKind::Step)
            .await
            .unwrap();
        runtime
            .call(
                &handle,
                StepCall::InitializeStep {
                    info: StepInfo::new("mixer", "Mixer"),
                    parent_process_id: Some(ActorId::new("p")),
                },
            )
            .await
            .unwrap();
        handle
    }

    async fn send(runtime: &LocalRuntime, handle: &StepHandle, function: &str, param: Option<&str>, data: Value) {
        let mut target = KernelProcessFunctionTarget::new("mixer", function);
        if let Some(param) = param {
            target = target.with_parameter(param);
        }
        let message = ProcessMessageFactory::create_message(&KernelProcessEdge::new("src", target), &data);
        runtime.message_buffer(&handle.id).enqueue(message).await.unwrap();
    }

    async fn superstep(runtime: &LocalRuntime, handle: &StepHandle) -> (usize, Vec<ProcessEvent>) {
        let count = runtime
            .call(handle, StepCall::PrepareIncomingMessages)
            .await
            .unwrap()
            .into_count()
            .unwrap();
        runtime
            .call(handle, StepCall::ProcessIncomingMessages)
            .await
            .unwrap();
        let events = runtime.event_buffer(&handle.id).dequeue_all().await.unwrap();
        (count, events)
    }

    #[tokio::test]
    async fn initialize_persists_and_is_idempotent() {
        let runtime = LocalRuntime::new(registry());
        let handle = mixer(&runtime).await;
        runtime
            .call(
                &handle,
                StepCall::InitializeStep {
                    info: StepInfo::new("other", "Mixer"),
                    parent_process_id: None,
                },
            )
            .await
            .unwrap();

        let node = runtime
            .call(&handle, StepCall::GetStepInfo)
            .await
            .unwrap()
            .into_node()
            .unwrap();
        assert_eq!(node.name(), "mixer");

        let state = runtime.state(&handle.id);
        assert_eq!(
            state.try_get_state(STEP_PARENT_PROCESS_ID).await.unwrap(),
            Some(json!("p"))
        );
        assert_eq!(
            state.try_get_state(STEP_ACTIVATED_STATE).await.unwrap(),
            Some(json!(false))
        );
    }

    #[tokio::test]
    async fn initialize_rejects_missing_id_and_unknown_type() {
        let runtime = LocalRuntime::new(registry());
        let handle = runtime
            .create_child(ActorId::new("p.x"), ActorKind::Step)
            .await
            .unwrap();

        let mut info = StepInfo::new("x", "Mixer");
        info.state.id = None;
        let err = runtime
            .call(&handle, StepCall::InitializeStep { info, parent_process_id: None })
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::MissingStepId { .. }));

        let err = runtime
            .call(
                &handle,
                StepCall::InitializeStep {
                    info: StepInfo::new("x", "Ghost"),
                    parent_process_id: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::UnknownStepType(_)));
    }

    #[tokio::test]
    async fn activation_is_lazy_and_recorded() {
        let runtime = LocalRuntime::new(registry());
        let handle = mixer(&runtime).await;
        let (count, events) = superstep(&runtime, &handle).await;
        assert_eq!(count, 0);
        assert!(events.is_empty());
        assert_eq!(
            runtime
                .state(&handle.id)
                .try_get_state(STEP_ACTIVATED_STATE)
                .await
                .unwrap(),
            Some(json!(true))
        );
    }

    #[tokio::test]
    async fn single_parameter_binds_event_data() {
        let runtime = LocalRuntime::new(registry());
        let handle = mixer(&runtime).await;
        send(&runtime, &handle, "double", None, json!(21)).await;

        let (count, events) = superstep(&runtime, &handle).await;
        assert_eq!(count, 1);
        let ids: Vec<String> = events.iter().map(|e| e.id()).collect();
        assert_eq!(ids, vec!["mixer_mixer.Doubled", "mixer_mixer.double.OnResult"]);
        assert_eq!(events[0].data(), &json!(42));
        assert_eq!(events[1].source_id, "mixer");
    }

    #[tokio::test]
    async fn parameters_accumulate_across_messages() {
        let runtime = LocalRuntime::new(registry());
        let handle = mixer(&runtime).await;

        send(&runtime, &handle, "mix", Some("a"), json!(2)).await;
        let (_, events) = superstep(&runtime, &handle).await;
        assert!(events.is_empty());

        send(&runtime, &handle, "mix", Some("b"), json!(3)).await;
        let (_, events) = superstep(&runtime, &handle).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data(), &json!(5));

        // bindings reset after the call
        send(&runtime, &handle, "mix", Some("b"), json!(1)).await;
        let (_, events) = superstep(&runtime, &handle).await;
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn failure_publishes_on_error_and_continues() {
        let runtime = LocalRuntime::new(registry());
        let handle = mixer(&runtime).await;
        send(&runtime, &handle, "fail", None, json!(null)).await;
        send(&runtime, &handle, "nope", None, json!(null)).await;
        send(&runtime, &handle, "double", None, json!(1)).await;

        let (count, events) = superstep(&runtime, &handle).await;
        assert_eq!(count, 3);
        assert_eq!(events.len(), 4);
        assert_eq!(events[0].id(), "mixer_mixer.fail.OnError");
        assert!(events[0].is_error);
        assert_eq!(events[0].data()["error"], "burnt");
        assert_eq!(events[1].id(), "mixer_mixer.nope.OnError");
        assert_eq!(events[3].id(), "mixer_mixer.double.OnResult");
        assert!(!events[3].is_error);
    }

    #[tokio::test]
    async fn unsupported_call() {
        let runtime = LocalRuntime::new(registry());
        let handle = mixer(&runtime).await;
        let err = runtime
            .call(&handle, StepCall::RunProcess { event: None, keep_alive: false })
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::UnsupportedCall { .. }));
    }

    #[tokio::test]
    async fn uninitialized_actor_rehydrates_from_saved_state() {
        let backend = std::sync::Arc::new(crate::state::MemoryStateBackend::new());
        let first = LocalRuntime::new(registry()).with_state_backend(backend.clone());
        mixer(&first).await;

        // a fresh runtime over the same store has never seen InitializeStep
        let second = LocalRuntime::new(registry()).with_state_backend(backend);
        let handle = second
            .create_child(ActorId::new("p.mixer"), ActorKind::Step)
            .await
            .unwrap();
        second.call(&handle, StepCall::ActivateStep).await.unwrap();

        let node = second
            .call(&handle, StepCall::GetStepInfo)
            .await
            .unwrap()
            .into_node()
            .unwrap();
        assert_eq!(node.id(), Some("mixer"));
    }

    #[tokio::test]
    async fn activate_without_descriptor_is_not_initialized() {
        let runtime = LocalRuntime::new(registry());
        let handle = runtime
            .create_child(ActorId::new("p.ghost"), ActorKind::Step)
            .await
            .unwrap();
        let err = runtime
            .call(&handle, StepCall::ActivateStep)
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::NotInitialized(_)));
    }
}
