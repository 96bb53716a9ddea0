//! Process actor and the superstep loop.
//!
//! A superstep drains external input, lets every child drain its mailbox
//! (prepare), runs every child that received work (process), then routes what
//! the children published. Events published in superstep N are therefore
//! handled in superstep N+1. The loop stops when no child received work, when
//! a message reaches the end sentinel, or at `max_supersteps`.

pub mod context;

pub use context::KernelProcessContext;

use std::collections::VecDeque;

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{Mutex, RwLock};

use crate::error::{ProcessError, ProcessResult};
use crate::info::{EdgeMap, ProcessInfo, StepNode};
use crate::log::{LogEntry, LogLevel};
use crate::runtime::{ActorKind, StepCall, StepHandle, StepReply, StepRuntime};
use crate::state::{set_typed, PROCESS_INFO_STATE, STEP_PARENT_PROCESS_ID};
use crate::types::{
    ActorId, EventNamespace, KernelProcessEdge, KernelProcessEvent, KernelProcessEventVisibility,
    ProcessEvent, ProcessMessageFactory,
};

const SOURCE: &str = "process";

/// Why a run stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// A superstep found no work.
    #[default]
    Quiescent,
    /// A message was routed to the end sentinel.
    EndSentinel,
    /// `max_supersteps` was reached.
    SuperstepLimit,
    /// The run was stopped from outside.
    Cancelled,
}

/// What one run of the loop did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub supersteps: u32,
    pub messages_routed: usize,
    pub outcome: RunOutcome,
}

impl RunSummary {
    pub fn cancelled() -> Self {
        Self {
            outcome: RunOutcome::Cancelled,
            ..Self::default()
        }
    }
}

#[derive(Clone)]
struct ChildStep {
    handle: StepHandle,
    local_id: String,
    /// Edges that route what this child publishes.
    edges: EdgeMap,
}

struct ProcessCore {
    info: ProcessInfo,
    parent: Option<ActorId>,
    namespace: EventNamespace,
    input_edges: EdgeMap,
    children: Vec<ChildStep>,
}

// Snapshot of the graph a run works against.
struct RunPlan {
    namespace: EventNamespace,
    input_edges: EdgeMap,
    children: Vec<ChildStep>,
}

/// Actor hosting one process, at the root or nested as a step of another.
pub struct ProcessActor {
    id: ActorId,
    core: RwLock<Option<ProcessCore>>,
    /// Input events received as a step, waiting for the process phase.
    incoming: Mutex<VecDeque<KernelProcessEvent>>,
    run_lock: Mutex<()>,
}

impl ProcessActor {
    pub fn new(id: ActorId) -> Self {
        Self {
            id,
            core: RwLock::new(None),
            incoming: Mutex::new(VecDeque::new()),
            run_lock: Mutex::new(()),
        }
    }

    pub fn id(&self) -> &ActorId {
        &self.id
    }

    pub async fn handle(&self, call: StepCall, rt: &dyn StepRuntime) -> ProcessResult<StepReply> {
        match call {
            StepCall::InitializeProcess {
                info,
                parent_process_id,
            } => {
                self.initialize(info, parent_process_id, rt).await?;
                Ok(StepReply::Done)
            }
            StepCall::RunProcess { event, keep_alive } => {
                let summary = self.run(rt, event, keep_alive).await?;
                Ok(StepReply::Summary { summary })
            }
            // A nested process has nothing to set up on first use.
            StepCall::ActivateStep => Ok(StepReply::Done),
            StepCall::PrepareIncomingMessages => {
                let count = self.prepare(rt).await?;
                Ok(StepReply::Count { count })
            }
            StepCall::ProcessIncomingMessages => {
                self.process(rt).await?;
                Ok(StepReply::Done)
            }
            StepCall::GetStepInfo => Ok(StepReply::Info {
                node: StepNode::Process(self.current_info(rt).await?),
            }),
            other @ StepCall::InitializeStep { .. } => Err(ProcessError::UnsupportedCall {
                actor: self.id.to_string(),
                call: other.name().to_string(),
            }),
        }
    }

    async fn initialize(
        &self,
        mut info: ProcessInfo,
        parent: Option<ActorId>,
        rt: &dyn StepRuntime,
    ) -> ProcessResult<()> {
        let mut guard = self.core.write().await;
        if guard.is_some() {
            return Ok(());
        }
        // Nested graphs were checked as part of their root.
        if parent.is_none() {
            info.assign_missing_ids();
            info.validate()?;
        }

        let mut children = Vec::with_capacity(info.steps.len());
        for node in &info.steps {
            let local_id = node.id().ok_or_else(|| ProcessError::MissingStepId {
                name: node.name().to_string(),
            })?;
            let child_id = self.id.scoped(local_id);
            let (kind, call) = match node {
                StepNode::Step(step) => (
                    ActorKind::Step,
                    StepCall::InitializeStep {
                        info: step.clone(),
                        parent_process_id: Some(self.id.clone()),
                    },
                ),
                StepNode::Process(process) => (
                    ActorKind::Process,
                    StepCall::InitializeProcess {
                        info: process.clone(),
                        parent_process_id: Some(self.id.clone()),
                    },
                ),
            };
            let handle = rt.create_child(child_id, kind).await?;
            rt.call(&handle, call).await?;

            children.push(ChildStep {
                handle,
                local_id: local_id.to_string(),
                edges: node
                    .outgoing_edges()
                    .map(|(key, edges)| (key.clone(), edges.clone()))
                    .collect(),
            });
        }

        let state = rt.state(&self.id);
        set_typed(state.as_ref(), PROCESS_INFO_STATE, &info).await?;
        set_typed(state.as_ref(), STEP_PARENT_PROCESS_ID, &parent).await?;
        state.save_state().await?;

        rt.logger().info(
            SOURCE,
            &self.id,
            &format!(
                "initialized process '{}' with {} steps",
                info.name(),
                children.len()
            ),
        );

        let input_edges = info
            .edges
            .iter()
            .filter(|(key, _)| info.is_input_event(key))
            .map(|(key, edges)| (key.clone(), edges.clone()))
            .collect();
        *guard = Some(ProcessCore {
            namespace: info.namespace(),
            info,
            parent,
            input_edges,
            children,
        });
        Ok(())
    }

    async fn plan(&self) -> ProcessResult<RunPlan> {
        let guard = self.core.read().await;
        let core = guard
            .as_ref()
            .ok_or_else(|| ProcessError::NotInitialized(self.id.to_string()))?;
        Ok(RunPlan {
            namespace: core.namespace.clone(),
            input_edges: core.input_edges.clone(),
            children: core.children.clone(),
        })
    }

    /// Drive the superstep loop until it stops.
    async fn run(
        &self,
        rt: &dyn StepRuntime,
        event: Option<KernelProcessEvent>,
        keep_alive: bool,
    ) -> ProcessResult<RunSummary> {
        let _running = self
            .run_lock
            .try_lock()
            .map_err(|_| ProcessError::AlreadyRunning(self.id.to_string()))?;
        let plan = self.plan().await?;

        // A cancelled or failed run can leave END messages behind; they belong to it.
        let end_mailbox = rt.message_buffer(&self.id.end_sentinel());
        let stale = end_mailbox.dequeue_all().await?.len();
        if stale > 0 {
            rt.logger().debug(
                SOURCE,
                &self.id,
                &format!("discarded {stale} end messages from an earlier run"),
            );
        }

        if let Some(event) = event {
            rt.external_event_buffer(&self.id).enqueue(event).await?;
        }

        let config = rt.config();
        let mut summary = RunSummary::default();

        loop {
            // END takes precedence over the limit when both arrive in the last superstep.
            if !end_mailbox.dequeue_all().await?.is_empty() {
                summary.outcome = RunOutcome::EndSentinel;
                break;
            }
            if summary.supersteps >= config.max_supersteps {
                rt.logger().warn(
                    SOURCE,
                    &self.id,
                    &format!("stopped at superstep limit {}", config.max_supersteps),
                );
                summary.outcome = RunOutcome::SuperstepLimit;
                break;
            }

            for event in rt.external_event_buffer(&self.id).dequeue_all().await? {
                match plan.input_edges.get(&event.id) {
                    Some(edges) => {
                        summary.messages_routed +=
                            self.deliver(rt, &plan, edges, &event.data).await?;
                    }
                    None => rt.logger().trace(
                        SOURCE,
                        &self.id,
                        &format!("no edges for input event '{}'", event.id),
                    ),
                }
            }

            let replies = try_join_all(
                plan.children
                    .iter()
                    .map(|child| rt.call(&child.handle, StepCall::PrepareIncomingMessages)),
            )
            .await?;
            let prepared = replies
                .into_iter()
                .map(StepReply::into_count)
                .sum::<ProcessResult<usize>>()?;

            if prepared == 0 {
                if keep_alive {
                    tokio::time::sleep(config.keep_alive_poll_interval()).await;
                    continue;
                }
                summary.supersteps += 1;
                summary.outcome = RunOutcome::Quiescent;
                break;
            }

            summary.supersteps += 1;
            try_join_all(
                plan.children
                    .iter()
                    .map(|child| rt.call(&child.handle, StepCall::ProcessIncomingMessages)),
            )
            .await?;

            let mut routed = 0;
            for child in &plan.children {
                for event in rt.event_buffer(&child.handle.id).dequeue_all().await? {
                    routed += self.route(rt, &plan, child, event).await?;
                }
            }
            summary.messages_routed += routed;

            rt.logger().log(
                &LogEntry::new(
                    LogLevel::Debug,
                    SOURCE,
                    format!(
                        "superstep {}: {prepared} messages processed, {routed} routed",
                        summary.supersteps
                    ),
                )
                .with_actor(&self.id)
                .with_payload(json!({
                    "superstep": summary.supersteps,
                    "processed": prepared,
                    "routed": routed,
                })),
            );
        }

        let mut finished = LogEntry::new(
            LogLevel::Info,
            SOURCE,
            format!(
                "run finished after {} supersteps ({:?})",
                summary.supersteps, summary.outcome
            ),
        )
        .with_actor(&self.id);
        if let Ok(payload) = serde_json::to_value(summary) {
            finished = finished.with_payload(payload);
        }
        rt.logger().log(&finished);
        Ok(summary)
    }

    // Route one published event along its source's edges; forward it upward if public.
    async fn route(
        &self,
        rt: &dyn StepRuntime,
        plan: &RunPlan,
        child: &ChildStep,
        event: ProcessEvent,
    ) -> ProcessResult<usize> {
        let key = event.id();
        let routed = match child.edges.get(&key) {
            Some(edges) => self.deliver(rt, plan, edges, event.data()).await?,
            None => {
                rt.logger()
                    .trace(SOURCE, &self.id, &format!("no edges for event '{key}'"));
                0
            }
        };

        if event.visibility() == KernelProcessEventVisibility::Public {
            let forwarded = ProcessEvent::new(
                plan.namespace.clone(),
                self.id.local_id(),
                event
                    .inner
                    .with_visibility(KernelProcessEventVisibility::Internal),
            )
            .with_error(event.is_error);
            rt.event_buffer(&self.id).enqueue(forwarded).await?;
        }
        Ok(routed)
    }

    async fn deliver(
        &self,
        rt: &dyn StepRuntime,
        plan: &RunPlan,
        edges: &[KernelProcessEdge],
        data: &serde_json::Value,
    ) -> ProcessResult<usize> {
        for edge in edges {
            let message = ProcessMessageFactory::create_message(edge, data);
            let target = &edge.output_target;
            if target.is_end() {
                rt.message_buffer(&self.id.end_sentinel())
                    .enqueue(message)
                    .await?;
                continue;
            }
            let child = plan
                .children
                .iter()
                .find(|c| c.local_id == target.step_id)
                .ok_or_else(|| {
                    ProcessError::Routing(format!(
                        "process {} has no step '{}'",
                        self.id, target.step_id
                    ))
                })?;
            rt.message_buffer(&child.handle.id).enqueue(message).await?;
        }
        Ok(edges.len())
    }

    // As a step: turn routed messages into this process's input events.
    async fn prepare(&self, rt: &dyn StepRuntime) -> ProcessResult<usize> {
        let messages = rt.message_buffer(&self.id).dequeue_all().await?;
        let count = messages.len();
        let mut incoming = self.incoming.lock().await;
        for message in messages {
            let id = message.target_event_id.ok_or_else(|| {
                ProcessError::Routing(format!(
                    "message from '{}' into process {} has no target event",
                    message.source_id, self.id
                ))
            })?;
            incoming.push_back(KernelProcessEvent::new(
                id,
                message.target_event_data.unwrap_or_default(),
            ));
        }
        Ok(count)
    }

    async fn process(&self, rt: &dyn StepRuntime) -> ProcessResult<()> {
        let events = std::mem::take(&mut *self.incoming.lock().await);
        if events.is_empty() {
            return Ok(());
        }
        let external = rt.external_event_buffer(&self.id);
        for event in events {
            external.enqueue(event).await?;
        }
        self.run(rt, None, false).await?;
        Ok(())
    }

    async fn current_info(&self, rt: &dyn StepRuntime) -> ProcessResult<ProcessInfo> {
        let (mut info, handles) = {
            let guard = self.core.read().await;
            let core = guard
                .as_ref()
                .ok_or_else(|| ProcessError::NotInitialized(self.id.to_string()))?;
            let handles: Vec<StepHandle> =
                core.children.iter().map(|c| c.handle.clone()).collect();
            (core.info.clone(), handles)
        };

        let replies = try_join_all(
            handles
                .iter()
                .map(|handle| rt.call(handle, StepCall::GetStepInfo)),
        )
        .await?;
        info.steps = replies
            .into_iter()
            .map(StepReply::into_node)
            .collect::<ProcessResult<Vec<_>>>()?;
        Ok(info)
    }

    pub async fn parent(&self) -> Option<ActorId> {
        self.core
            .read()
            .await
            .as_ref()
            .and_then(|core| core.parent.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::{StepRegistry, SyncFunction};
    use crate::info::StepInfo;
    use crate::runtime::LocalRuntime;
    use crate::types::{KernelProcessFunctionTarget, ProcessMessage};
    use serde_json::json;
    use std::collections::HashMap;

    fn registry() -> StepRegistry {
        let mut registry = StepRegistry::new();
        registry
            .register_functions(
                "Noop",
                [SyncFunction::new("run", &[], |_args, _ctx| Ok(None)).arc()],
            )
            .unwrap();
        registry
    }

    async fn nested(runtime: &LocalRuntime) -> StepHandle {
        let handle = runtime
            .create_child(ActorId::new("root.inner"), ActorKind::Process)
            .await
            .unwrap();
        let info = ProcessInfo::new("Inner")
            .with_id("inner")
            .with_step(StepInfo::new("s", "Noop"))
            .on_input_event("Start", KernelProcessFunctionTarget::new("s", "run"));
        runtime
            .call(
                &handle,
                StepCall::InitializeProcess {
                    info,
                    parent_process_id: Some(ActorId::new("root")),
                },
            )
            .await
            .unwrap();
        handle
    }

    #[test]
    fn cancelled_summary() {
        let summary = RunSummary::cancelled();
        assert_eq!(summary.outcome, RunOutcome::Cancelled);
        assert_eq!(summary.supersteps, 0);
    }

    #[tokio::test]
    async fn uninitialized_process_reports_not_initialized() {
        let runtime = LocalRuntime::new(registry());
        let handle = runtime
            .create_child(ActorId::new("p"), ActorKind::Process)
            .await
            .unwrap();
        let err = runtime
            .call(&handle, StepCall::RunProcess { event: None, keep_alive: false })
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::NotInitialized(_)));
    }

    #[tokio::test]
    async fn nested_process_records_parent() {
        let runtime = LocalRuntime::new(registry());
        nested(&runtime).await;
        let state = runtime.state(&ActorId::new("root.inner"));
        assert_eq!(
            state.try_get_state(STEP_PARENT_PROCESS_ID).await.unwrap(),
            Some(json!("root"))
        );
        assert!(state
            .try_get_state(PROCESS_INFO_STATE)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn as_step_turns_messages_into_input_events() {
        let runtime = LocalRuntime::new(registry());
        let handle = nested(&runtime).await;

        let edge = KernelProcessEdge::new(
            "outer",
            KernelProcessFunctionTarget::process_input("inner", "Start"),
        );
        runtime
            .message_buffer(&handle.id)
            .enqueue(ProcessMessageFactory::create_message(&edge, &json!(1)))
            .await
            .unwrap();

        let count = runtime
            .call(&handle, StepCall::PrepareIncomingMessages)
            .await
            .unwrap()
            .into_count()
            .unwrap();
        assert_eq!(count, 1);
        runtime
            .call(&handle, StepCall::ProcessIncomingMessages)
            .await
            .unwrap();

        let node = runtime
            .call(&handle, StepCall::GetStepInfo)
            .await
            .unwrap()
            .into_node()
            .unwrap();
        assert!(node.is_process());
        assert_eq!(node.id(), Some("inner"));
    }

    #[tokio::test]
    async fn message_without_target_event_is_a_routing_error() {
        let runtime = LocalRuntime::new(registry());
        let handle = nested(&runtime).await;
        runtime
            .message_buffer(&handle.id)
            .enqueue(ProcessMessage {
                source_id: "outer".into(),
                destination_id: "inner".into(),
                function_name: "run".into(),
                values: HashMap::new(),
                target_event_id: None,
                target_event_data: None,
            })
            .await
            .unwrap();

        let err = runtime
            .call(&handle, StepCall::PrepareIncomingMessages)
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Routing(_)));
    }

    #[tokio::test]
    async fn leftover_end_messages_do_not_stop_a_new_run() {
        let runtime = LocalRuntime::new(registry());
        let handle = nested(&runtime).await;
        let edge = KernelProcessEdge::new("s", KernelProcessFunctionTarget::end());
        runtime
            .message_buffer(&handle.id.end_sentinel())
            .enqueue(ProcessMessageFactory::create_message(&edge, &json!(null)))
            .await
            .unwrap();

        let summary = runtime
            .call(
                &handle,
                StepCall::RunProcess {
                    event: Some(KernelProcessEvent::new("Start", json!(null))),
                    keep_alive: false,
                },
            )
            .await
            .unwrap()
            .into_summary()
            .unwrap();
        assert_eq!(summary.outcome, RunOutcome::Quiescent);
        assert_eq!(summary.supersteps, 2);
        assert_eq!(summary.messages_routed, 1);
    }

    #[tokio::test]
    async fn initialize_step_is_unsupported() {
        let runtime = LocalRuntime::new(registry());
        let handle = nested(&runtime).await;
        let err = runtime
            .call(
                &handle,
                StepCall::InitializeStep {
                    info: StepInfo::new("s", "Noop"),
                    parent_process_id: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::UnsupportedCall { .. }));
    }
}
