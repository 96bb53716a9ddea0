//! Runtime seam between the superstep algorithm and where actors live.
//!
//! Step and process actors never hold each other directly. They address peers
//! by [`StepHandle`] and talk through a [`StepRuntime`], which owns the actors,
//! their mailboxes and their state. [`LocalRuntime`] hosts everything in the
//! current process; a distributed host implements the same trait.

pub mod local;

pub use local::LocalRuntime;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::buffer::Buffer;
use crate::config::ProcessConfig;
use crate::error::{ProcessError, ProcessResult};
use crate::function::StepRegistry;
use crate::info::{ProcessInfo, StepInfo, StepNode};
use crate::log::ProcessLogger;
use crate::process::RunSummary;
use crate::state::ActorStateManager;
use crate::types::{ActorId, KernelProcessEvent, ProcessEvent, ProcessMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorKind {
    Step,
    Process,
}

/// Address of an actor plus what kind of actor sits there.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepHandle {
    pub id: ActorId,
    pub kind: ActorKind,
}

impl StepHandle {
    pub fn new(id: ActorId, kind: ActorKind) -> Self {
        Self { id, kind }
    }
}

/// Requests an actor accepts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "call", rename_all = "snake_case")]
pub enum StepCall {
    InitializeStep {
        info: StepInfo,
        parent_process_id: Option<ActorId>,
    },
    InitializeProcess {
        info: ProcessInfo,
        parent_process_id: Option<ActorId>,
    },
    ActivateStep,
    PrepareIncomingMessages,
    ProcessIncomingMessages,
    GetStepInfo,
    RunProcess {
        event: Option<KernelProcessEvent>,
        keep_alive: bool,
    },
}

impl StepCall {
    pub fn name(&self) -> &'static str {
        match self {
            StepCall::InitializeStep { .. } => "initialize_step",
            StepCall::InitializeProcess { .. } => "initialize_process",
            StepCall::ActivateStep => "activate_step",
            StepCall::PrepareIncomingMessages => "prepare_incoming_messages",
            StepCall::ProcessIncomingMessages => "process_incoming_messages",
            StepCall::GetStepInfo => "get_step_info",
            StepCall::RunProcess { .. } => "run_process",
        }
    }
}

/// Replies to [`StepCall`]s.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum StepReply {
    Done,
    Count { count: usize },
    Info { node: StepNode },
    Summary { summary: RunSummary },
}

impl StepReply {
    fn unexpected(self, expected: &str) -> ProcessError {
        ProcessError::State(format!("expected {expected} reply, got {self:?}"))
    }

    pub fn into_count(self) -> ProcessResult<usize> {
        match self {
            StepReply::Count { count } => Ok(count),
            other => Err(other.unexpected("count")),
        }
    }

    pub fn into_node(self) -> ProcessResult<StepNode> {
        match self {
            StepReply::Info { node } => Ok(node),
            other => Err(other.unexpected("info")),
        }
    }

    pub fn into_summary(self) -> ProcessResult<RunSummary> {
        match self {
            StepReply::Summary { summary } => Ok(summary),
            other => Err(other.unexpected("summary")),
        }
    }
}

/// Capabilities the superstep algorithm needs from its host.
#[async_trait]
pub trait StepRuntime: Send + Sync {
    /// Create the actor at `id` if absent. Creating an existing actor of the
    /// same kind returns its handle.
    async fn create_child(&self, id: ActorId, kind: ActorKind) -> ProcessResult<StepHandle>;

    /// Deliver one call to an actor and await its reply.
    async fn call(&self, handle: &StepHandle, call: StepCall) -> ProcessResult<StepReply>;

    fn state(&self, actor: &ActorId) -> Arc<dyn ActorStateManager>;

    /// Messages routed to `actor`.
    fn message_buffer(&self, actor: &ActorId) -> Arc<dyn Buffer<ProcessMessage>>;

    /// External events waiting for process `actor`.
    fn external_event_buffer(&self, actor: &ActorId) -> Arc<dyn Buffer<KernelProcessEvent>>;

    /// Events published by `actor`.
    fn event_buffer(&self, actor: &ActorId) -> Arc<dyn Buffer<ProcessEvent>>;

    fn config(&self) -> &ProcessConfig;

    fn logger(&self) -> &ProcessLogger;

    fn step_registry(&self) -> &StepRegistry;
}
