//! Step logic: how a step declares its functions and how the runtime calls them.
//!
//! Typed steps implement [`KernelProcessStep`] with a [`StepFunction`] enum, so
//! a function name is resolved exactly once at the boundary and the step's own
//! `match` is exhaustive. Plugin-style steps assemble named
//! [`KernelFunction`]s into a [`FunctionStep`]. Both are driven by the runtime
//! through the object-safe [`StepBehavior`].

pub mod registry;

pub use registry::{FunctionStep, KernelFunction, StepFactory, StepRegistry, SyncFunction};

use std::collections::HashMap;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ProcessError, ProcessResult};
use crate::types::{KernelProcessEvent, KernelProcessEventVisibility};

/// Named argument values bound for one invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KernelArguments(HashMap<String, Value>);

impl KernelArguments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.0.insert(name.into(), value);
    }

    pub fn with(mut self, name: impl Into<String>, value: Value) -> Self {
        self.insert(name, value);
        self
    }

    pub fn value(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// Deserialize argument `name` into `T`.
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> ProcessResult<T> {
        let value = self.0.get(name).ok_or_else(|| ProcessError::InvalidArgument {
            name: name.to_string(),
            message: "missing".into(),
        })?;
        T::deserialize(value).map_err(|e| ProcessError::InvalidArgument {
            name: name.to_string(),
            message: e.to_string(),
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> HashMap<String, Value> {
        self.0
    }
}

impl From<HashMap<String, Value>> for KernelArguments {
    fn from(values: HashMap<String, Value>) -> Self {
        Self(values)
    }
}

/// Name and declared parameters of one step function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionMetadata {
    pub name: String,
    #[serde(default)]
    pub parameters: Vec<String>,
}

impl FunctionMetadata {
    pub fn new(name: impl Into<String>, parameters: &[&str]) -> Self {
        Self {
            name: name.into(),
            parameters: parameters.iter().map(|p| p.to_string()).collect(),
        }
    }
}

/// Handle a running function uses to publish events.
///
/// Events are collected during the call and published by the step actor once
/// the call returns, ahead of the function's own `OnResult` event.
#[derive(Debug)]
pub struct KernelProcessStepContext {
    step_id: String,
    events: Vec<KernelProcessEvent>,
}

impl KernelProcessStepContext {
    pub fn new(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            events: Vec::new(),
        }
    }

    /// Local id of the step being invoked.
    pub fn step_id(&self) -> &str {
        &self.step_id
    }

    pub fn emit_event(&mut self, id: impl Into<String>, data: Value) {
        self.emit(KernelProcessEvent::new(id, data));
    }

    pub fn emit_public_event(&mut self, id: impl Into<String>, data: Value) {
        self.emit(
            KernelProcessEvent::new(id, data).with_visibility(KernelProcessEventVisibility::Public),
        );
    }

    pub fn emit(&mut self, event: KernelProcessEvent) {
        self.events.push(event);
    }

    pub fn take_events(&mut self) -> Vec<KernelProcessEvent> {
        std::mem::take(&mut self.events)
    }
}

/// Closed set of functions a typed step exposes.
pub trait StepFunction: Sized + Copy + Send + Sync + 'static {
    fn all() -> &'static [Self];

    fn name(&self) -> &'static str;

    fn parameters(&self) -> &'static [&'static str] {
        &[]
    }

    fn from_name(name: &str) -> Option<Self> {
        Self::all().iter().copied().find(|f| f.name() == name)
    }

    fn metadata(&self) -> FunctionMetadata {
        FunctionMetadata::new(self.name(), self.parameters())
    }
}

/// A step implemented against a typed function enum.
#[async_trait]
pub trait KernelProcessStep: Send + Sync + 'static {
    type Function: StepFunction;

    /// Called once before the first invocation, with any persisted user state.
    async fn activate(&mut self, _state: Option<Value>) -> ProcessResult<()> {
        Ok(())
    }

    /// User state to checkpoint after each processing phase.
    fn snapshot_state(&self) -> ProcessResult<Option<Value>> {
        Ok(None)
    }

    async fn invoke(
        &mut self,
        function: Self::Function,
        args: KernelArguments,
        ctx: &mut KernelProcessStepContext,
    ) -> ProcessResult<Option<Value>>;
}

/// Object-safe view of a step's logic, as seen by the step actor.
#[async_trait]
pub trait StepBehavior: Send + Sync {
    fn functions(&self) -> Vec<FunctionMetadata>;

    async fn activate(&mut self, state: Option<Value>) -> ProcessResult<()>;

    fn snapshot_state(&self) -> ProcessResult<Option<Value>>;

    async fn invoke(
        &mut self,
        function_name: &str,
        args: KernelArguments,
        ctx: &mut KernelProcessStepContext,
    ) -> ProcessResult<Option<Value>>;
}

/// Adapts a [`KernelProcessStep`] to [`StepBehavior`].
pub struct TypedStep<S> {
    inner: S,
}

impl<S: KernelProcessStep> TypedStep<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: KernelProcessStep> StepBehavior for TypedStep<S> {
    fn functions(&self) -> Vec<FunctionMetadata> {
        S::Function::all().iter().map(|f| f.metadata()).collect()
    }

    async fn activate(&mut self, state: Option<Value>) -> ProcessResult<()> {
        self.inner.activate(state).await
    }

    fn snapshot_state(&self) -> ProcessResult<Option<Value>> {
        self.inner.snapshot_state()
    }

    async fn invoke(
        &mut self,
        function_name: &str,
        args: KernelArguments,
        ctx: &mut KernelProcessStepContext,
    ) -> ProcessResult<Option<Value>> {
        let function =
            S::Function::from_name(function_name).ok_or_else(|| ProcessError::FunctionNotFound {
                step: ctx.step_id().to_string(),
                function: function_name.to_string(),
            })?;
        self.inner.invoke(function, args, ctx).await
    }
}
