//! Graph descriptors: what steps a process holds and how their events route.
//!
//! ```rust
//! use sk_process::info::{ProcessInfo, StepInfo};
//! use sk_process::types::KernelProcessFunctionTarget;
//!
//! let process = ProcessInfo::new("Kitchen")
//!     .with_id("kitchen")
//!     .with_step(
//!         StepInfo::new("cut", "Cut")
//!             .on_function_result("cut", KernelProcessFunctionTarget::new("cook", "cook")),
//!     )
//!     .with_step(StepInfo::new("cook", "Cook"))
//!     .on_input_event("Start", KernelProcessFunctionTarget::new("cut", "cut"));
//!
//! assert!(process.validate().is_ok());
//! assert_eq!(process.edges["Start"][0].output_target.step_id, "cut");
//! ```

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ProcessError, ProcessResult};
use crate::types::{
    EventNamespace, KernelProcessEdge, KernelProcessFunctionTarget, KernelProcessState,
    KernelProcessStepState, END_PROCESS_ID,
};

/// Edges keyed by the event id that triggers them.
pub type EdgeMap = HashMap<String, Vec<KernelProcessEdge>>;

/// Event id a step publishes with a function's return value.
pub fn on_result_event(function_name: &str) -> String {
    format!("{function_name}.OnResult")
}

/// Event id a step publishes when a function fails.
pub fn on_error_event(function_name: &str) -> String {
    format!("{function_name}.OnError")
}

// Move edges scoped to `old` under `new`, pointing their source at `new_id`.
fn rekey_edges(edges: EdgeMap, old: &EventNamespace, new: &EventNamespace, new_id: &str) -> EdgeMap {
    let prefix = old.scope("");
    edges
        .into_iter()
        .map(|(key, list)| match key.strip_prefix(&prefix) {
            Some(event_id) => {
                let list = list
                    .into_iter()
                    .map(|mut edge| {
                        edge.source_step_id = new_id.to_string();
                        edge
                    })
                    .collect();
                (new.scope(event_id), list)
            }
            None => (key, list),
        })
        .collect()
}

// ─── Step ───────────────────────────────────────────────────────────────────

/// Descriptor of one step: its state, its factory key, and its outgoing edges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepInfo {
    pub state: KernelProcessStepState,
    /// Key of the factory in the [`crate::function::StepRegistry`].
    pub step_type: String,
    #[serde(default)]
    pub edges: EdgeMap,
}

impl StepInfo {
    /// Step whose id equals its name.
    pub fn new(name: impl Into<String>, step_type: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            state: KernelProcessStepState::new(name.clone(), Some(name)),
            step_type: step_type.into(),
            edges: EdgeMap::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        let id = id.into();
        let old = self.namespace();
        self.state.id = Some(id.clone());
        let new = self.namespace();
        self.edges = rekey_edges(std::mem::take(&mut self.edges), &old, &new, &id);
        self
    }

    /// Initial user state handed to the step on activation.
    pub fn with_state(mut self, state: Value) -> Self {
        self.state.state = Some(state);
        self
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    pub fn id(&self) -> Option<&str> {
        self.state.id.as_deref()
    }

    pub fn namespace(&self) -> EventNamespace {
        EventNamespace::new(&self.state.name, self.id().unwrap_or_default())
    }

    /// Route this step's `event_id` to `target`.
    pub fn on_event(mut self, event_id: &str, target: KernelProcessFunctionTarget) -> Self {
        let source = self.id().unwrap_or_default().to_string();
        self.edges
            .entry(self.namespace().scope(event_id))
            .or_default()
            .push(KernelProcessEdge::new(source, target));
        self
    }

    /// Route the return value of `function_name` to `target`.
    pub fn on_function_result(self, function_name: &str, target: KernelProcessFunctionTarget) -> Self {
        self.on_event(&on_result_event(function_name), target)
    }

    /// Route failures of `function_name` to `target`.
    pub fn on_function_error(self, function_name: &str, target: KernelProcessFunctionTarget) -> Self {
        self.on_event(&on_error_event(function_name), target)
    }
}

// ─── Process ────────────────────────────────────────────────────────────────

/// Descriptor of a process: its state, its children, and its edges.
///
/// `edges` holds two kinds of entries. Input edges are keyed by a bare event id
/// and fan external events into the children. Output edges are keyed by an id
/// scoped to this process's namespace and route events this process forwards
/// to its parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub state: KernelProcessState,
    #[serde(default)]
    pub steps: Vec<StepNode>,
    #[serde(default)]
    pub edges: EdgeMap,
}

impl ProcessInfo {
    /// Process without an id; one is generated at initialization.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            state: KernelProcessState::new(name, None),
            steps: Vec::new(),
            edges: EdgeMap::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.set_id(id.into());
        self
    }

    fn set_id(&mut self, id: String) {
        let old = self.namespace();
        self.state.id = Some(id.clone());
        let new = self.namespace();
        self.edges = rekey_edges(std::mem::take(&mut self.edges), &old, &new, &id);
    }

    pub fn with_step(mut self, step: impl Into<StepNode>) -> Self {
        self.steps.push(step.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    pub fn id(&self) -> Option<&str> {
        self.state.id.as_deref()
    }

    pub fn namespace(&self) -> EventNamespace {
        EventNamespace::new(&self.state.name, self.id().unwrap_or_default())
    }

    /// Fan the external event `event_id` into `target`.
    pub fn on_input_event(mut self, event_id: &str, target: KernelProcessFunctionTarget) -> Self {
        let source = self.id().unwrap_or_default().to_string();
        self.edges
            .entry(event_id.to_string())
            .or_default()
            .push(KernelProcessEdge::new(source, target));
        self
    }

    /// Route `event_id`, forwarded by this process into its parent, to `target`.
    pub fn on_event(mut self, event_id: &str, target: KernelProcessFunctionTarget) -> Self {
        let source = self.id().unwrap_or_default().to_string();
        self.edges
            .entry(self.namespace().scope(event_id))
            .or_default()
            .push(KernelProcessEdge::new(source, target));
        self
    }

    /// Whether `key` names an input edge rather than an output edge.
    pub fn is_input_event(&self, key: &str) -> bool {
        !key.starts_with(&self.namespace().scope(""))
    }

    /// Child by local id.
    pub fn step(&self, id: &str) -> Option<&StepNode> {
        self.steps.iter().find(|s| s.id() == Some(id))
    }

    /// Give this process and every nested process without an id a fresh one.
    pub fn assign_missing_ids(&mut self) {
        if self.state.id.is_none() {
            self.set_id(uuid::Uuid::new_v4().to_string());
        }
        for node in &mut self.steps {
            if let StepNode::Process(process) = node {
                process.assign_missing_ids();
            }
        }
    }

    /// Check the graph before any actor is created.
    ///
    /// Rejects missing names or ids, empty processes, ids that are not unique
    /// within their scope or that contain `.`, edges to unknown targets, edges
    /// into a nested process without an input event, and a nested process
    /// that reuses the id of one of its ancestors. Event cycles between steps
    /// are allowed.
    pub fn validate(&self) -> ProcessResult<()> {
        self.validate_scoped(&mut Vec::new())
    }

    fn validate_scoped(&self, ancestors: &mut Vec<String>) -> ProcessResult<()> {
        if self.state.name.is_empty() {
            return Err(ProcessError::MissingName {
                id: self.state.id.clone(),
            });
        }
        let id = self.id().ok_or_else(|| {
            ProcessError::Initialization(format!("process '{}' has no id", self.state.name))
        })?;
        if ancestors.iter().any(|a| a == id) {
            return Err(ProcessError::NestingCycle { id: id.to_string() });
        }
        if self.steps.is_empty() {
            return Err(ProcessError::EmptyProcess {
                process: self.state.name.clone(),
            });
        }

        let mut children: HashMap<&str, &StepNode> = HashMap::new();
        for node in &self.steps {
            if node.name().is_empty() {
                return Err(ProcessError::MissingName {
                    id: node.id().map(str::to_string),
                });
            }
            let child_id = node.id().ok_or_else(|| ProcessError::MissingStepId {
                name: node.name().to_string(),
            })?;
            check_local_id(child_id)?;
            if children.insert(child_id, node).is_some() {
                return Err(ProcessError::DuplicateStepId {
                    process: self.state.name.clone(),
                    id: child_id.to_string(),
                });
            }
        }

        let input_edges = self
            .edges
            .iter()
            .filter(|(key, _)| self.is_input_event(key))
            .flat_map(|(_, list)| list);
        check_targets(input_edges, &children)?;

        for node in &self.steps {
            let outgoing = node.outgoing_edges().flat_map(|(_, list)| list);
            check_targets(outgoing, &children)?;
        }

        ancestors.push(id.to_string());
        for node in &self.steps {
            if let StepNode::Process(process) = node {
                process.validate_scoped(ancestors)?;
            }
        }
        ancestors.pop();
        Ok(())
    }

    /// Persisted dict form.
    pub fn to_value(&self) -> ProcessResult<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_value(value: Value) -> ProcessResult<Self> {
        Ok(serde_json::from_value(value)?)
    }
}

fn check_local_id(id: &str) -> ProcessResult<()> {
    let reason = if id.is_empty() {
        "id is empty"
    } else if id.contains('.') {
        "id may not contain '.'"
    } else if id == END_PROCESS_ID {
        "id is reserved for the end sentinel"
    } else {
        return Ok(());
    };
    Err(ProcessError::InvalidId {
        id: id.to_string(),
        reason: reason.to_string(),
    })
}

fn check_targets<'a>(
    edges: impl Iterator<Item = &'a KernelProcessEdge>,
    children: &HashMap<&str, &StepNode>,
) -> ProcessResult<()> {
    for edge in edges {
        let target = &edge.output_target;
        if target.is_end() {
            continue;
        }
        match children.get(target.step_id.as_str()) {
            None => {
                return Err(ProcessError::UnknownEdgeTarget {
                    source_step: edge.source_step_id.clone(),
                    target: target.step_id.clone(),
                })
            }
            Some(StepNode::Process(_)) if target.target_event_id.is_none() => {
                return Err(ProcessError::Initialization(format!(
                    "edge from '{}' into process '{}' has no target event",
                    edge.source_step_id, target.step_id
                )))
            }
            Some(_) => {}
        }
    }
    Ok(())
}

// ─── Nodes ──────────────────────────────────────────────────────────────────

/// A child of a process: a plain step or a nested process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepNode {
    Step(StepInfo),
    Process(ProcessInfo),
}

impl StepNode {
    pub fn name(&self) -> &str {
        match self {
            StepNode::Step(step) => step.name(),
            StepNode::Process(process) => process.name(),
        }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            StepNode::Step(step) => step.id(),
            StepNode::Process(process) => process.id(),
        }
    }

    pub fn namespace(&self) -> EventNamespace {
        match self {
            StepNode::Step(step) => step.namespace(),
            StepNode::Process(process) => process.namespace(),
        }
    }

    pub fn edges(&self) -> &EdgeMap {
        match self {
            StepNode::Step(step) => &step.edges,
            StepNode::Process(process) => &process.edges,
        }
    }

    /// Edges routed in the parent scope when this node publishes.
    pub fn outgoing_edges(&self) -> impl Iterator<Item = (&String, &Vec<KernelProcessEdge>)> {
        let input_of = match self {
            StepNode::Process(process) => Some(process),
            StepNode::Step(_) => None,
        };
        self.edges()
            .iter()
            .filter(move |(key, _)| input_of.map_or(true, |p| !p.is_input_event(key)))
    }

    pub fn is_process(&self) -> bool {
        matches!(self, StepNode::Process(_))
    }
}

impl From<StepInfo> for StepNode {
    fn from(step: StepInfo) -> Self {
        StepNode::Step(step)
    }
}

impl From<ProcessInfo> for StepNode {
    fn from(process: ProcessInfo) -> Self {
        StepNode::Process(process)
    }
}
