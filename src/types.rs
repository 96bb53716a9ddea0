use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reserved destination id that ends the enclosing process's superstep loop.
pub const END_PROCESS_ID: &str = "END";

/// Version stamped on freshly built step and process states.
pub const DEFAULT_STATE_VERSION: &str = "v1";

// ─── Actor Addressing ───────────────────────────────────────────────────────

/// Address of a step or process actor within a runtime.
///
/// Children of a process are addressed as `{processActorId}.{localId}`, so two
/// sibling sub-processes may both contain a step with the same local id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(String);

impl ActorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Address of a child actor owned by this one.
    pub fn scoped(&self, local_id: &str) -> ActorId {
        ActorId(format!("{}.{}", self.0, local_id))
    }

    /// Mailbox that receives end-sentinel messages for this process.
    pub fn end_sentinel(&self) -> ActorId {
        ActorId(format!("{END_PROCESS_ID}.{}", self.0))
    }

    /// Last segment of the address (the id local to the parent scope).
    pub fn local_id(&self) -> &str {
        self.0.rsplit('.').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ActorId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ActorId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

// ─── Events ─────────────────────────────────────────────────────────────────

/// Whether an event stays inside its process or also leaves it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelProcessEventVisibility {
    /// Routed only to siblings inside the publishing process.
    #[default]
    Internal,
    /// Also forwarded to the enclosing scope (parent process or host).
    Public,
}

/// An event produced by step logic or injected by an external caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelProcessEvent {
    pub id: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub visibility: KernelProcessEventVisibility,
}

impl KernelProcessEvent {
    pub fn new(id: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            data,
            visibility: KernelProcessEventVisibility::Internal,
        }
    }

    pub fn public(id: impl Into<String>, data: Value) -> Self {
        Self::new(id, data).with_visibility(KernelProcessEventVisibility::Public)
    }

    pub fn with_visibility(mut self, visibility: KernelProcessEventVisibility) -> Self {
        self.visibility = visibility;
        self
    }

    pub fn is_public(&self) -> bool {
        self.visibility == KernelProcessEventVisibility::Public
    }
}

/// Namespace that scopes the events of one step or process.
///
/// Rendered as `{name}_{id}` with `%`, `_` and `.` percent-escaped in both
/// parts, so distinct (name, id) pairs never render to the same namespace and
/// the first `.` of a scoped event id always ends the namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventNamespace(String);

impl EventNamespace {
    pub fn new(name: &str, id: &str) -> Self {
        Self(format!("{}_{}", escape_segment(name), escape_segment(id)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Routable id of `event_id` published inside this namespace.
    pub fn scope(&self, event_id: &str) -> String {
        format!("{}.{}", self.0, event_id)
    }
}

impl fmt::Display for EventNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn escape_segment(segment: &str) -> Cow<'_, str> {
    if !segment.contains(['%', '_', '.']) {
        return Cow::Borrowed(segment);
    }
    let mut escaped = String::with_capacity(segment.len() + 8);
    for c in segment.chars() {
        match c {
            '%' => escaped.push_str("%25"),
            '_' => escaped.push_str("%5F"),
            '.' => escaped.push_str("%2E"),
            other => escaped.push(other),
        }
    }
    Cow::Owned(escaped)
}

/// A published event scoped to the namespace of its publisher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessEvent {
    pub namespace: EventNamespace,
    /// Local id of the step or process that published the event.
    pub source_id: String,
    pub inner: KernelProcessEvent,
    #[serde(default)]
    pub is_error: bool,
}

impl ProcessEvent {
    pub fn new(
        namespace: EventNamespace,
        source_id: impl Into<String>,
        inner: KernelProcessEvent,
    ) -> Self {
        Self {
            namespace,
            source_id: source_id.into(),
            inner,
            is_error: false,
        }
    }

    pub fn with_error(mut self, is_error: bool) -> Self {
        self.is_error = is_error;
        self
    }

    /// Routable id: `{namespace}.{inner.id}`.
    pub fn id(&self) -> String {
        self.namespace.scope(&self.inner.id)
    }

    pub fn data(&self) -> &Value {
        &self.inner.data
    }

    pub fn visibility(&self) -> KernelProcessEventVisibility {
        self.inner.visibility
    }
}

// ─── Edges & Messages ───────────────────────────────────────────────────────

/// Destination of an edge: a step function and how the event data binds to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelProcessFunctionTarget {
    pub step_id: String,
    pub function_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter_name: Option<String>,
    /// Input event to raise when the destination is a nested process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_event_id: Option<String>,
}

impl KernelProcessFunctionTarget {
    pub fn new(step_id: impl Into<String>, function_name: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            function_name: function_name.into(),
            parameter_name: None,
            target_event_id: None,
        }
    }

    /// Target that ends the enclosing process.
    pub fn end() -> Self {
        Self::new(END_PROCESS_ID, END_PROCESS_ID)
    }

    /// Target that raises `event_id` as an input event of a nested process.
    pub fn process_input(process_id: impl Into<String>, event_id: impl Into<String>) -> Self {
        let event_id = event_id.into();
        Self {
            step_id: process_id.into(),
            function_name: event_id.clone(),
            parameter_name: None,
            target_event_id: Some(event_id),
        }
    }

    pub fn with_parameter(mut self, parameter_name: impl Into<String>) -> Self {
        self.parameter_name = Some(parameter_name.into());
        self
    }

    pub fn is_end(&self) -> bool {
        self.step_id == END_PROCESS_ID
    }
}

/// Static routing rule from a published event to one destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelProcessEdge {
    pub source_step_id: String,
    pub output_target: KernelProcessFunctionTarget,
}

impl KernelProcessEdge {
    pub fn new(source_step_id: impl Into<String>, output_target: KernelProcessFunctionTarget) -> Self {
        Self {
            source_step_id: source_step_id.into(),
            output_target,
        }
    }
}

/// A message routed to one step function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessMessage {
    pub source_id: String,
    pub destination_id: String,
    pub function_name: String,
    #[serde(default)]
    pub values: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_event_data: Option<Value>,
}

/// Builds messages from edges.
pub struct ProcessMessageFactory;

impl ProcessMessageFactory {
    /// Create the message an edge delivers for a published event payload.
    pub fn create_message(edge: &KernelProcessEdge, data: &Value) -> ProcessMessage {
        let target = &edge.output_target;
        let mut values = HashMap::new();
        if let Some(parameter) = &target.parameter_name {
            values.insert(parameter.clone(), data.clone());
        }

        ProcessMessage {
            source_id: edge.source_step_id.clone(),
            destination_id: target.step_id.clone(),
            function_name: target.function_name.clone(),
            values,
            target_event_id: target.target_event_id.clone(),
            target_event_data: Some(data.clone()),
        }
    }
}

// ─── Step & Process State ───────────────────────────────────────────────────

/// Identity and user state of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelProcessStepState {
    pub name: String,
    #[serde(default)]
    pub id: Option<String>,
    pub version: String,
    /// Opaque user state restored on activation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
}

impl KernelProcessStepState {
    pub fn new(name: impl Into<String>, id: Option<String>) -> Self {
        Self {
            name: name.into(),
            id,
            version: DEFAULT_STATE_VERSION.to_string(),
            state: None,
        }
    }

    pub fn with_state(mut self, state: Value) -> Self {
        self.state = Some(state);
        self
    }
}

/// Identity of one process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelProcessState {
    pub name: String,
    #[serde(default)]
    pub id: Option<String>,
    pub version: String,
}

impl KernelProcessState {
    pub fn new(name: impl Into<String>, id: Option<String>) -> Self {
        Self {
            name: name.into(),
            id,
            version: DEFAULT_STATE_VERSION.to_string(),
        }
    }
}
