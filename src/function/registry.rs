use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{ProcessError, ProcessResult};

use super::{
    FunctionMetadata, KernelArguments, KernelProcessStep, KernelProcessStepContext, StepBehavior,
    TypedStep,
};

/// A named function usable as part of a [`FunctionStep`].
#[async_trait]
pub trait KernelFunction: Send + Sync {
    fn name(&self) -> &str;

    /// Parameters that must all be bound before the function runs.
    fn parameters(&self) -> Vec<String> {
        Vec::new()
    }

    async fn invoke(
        &self,
        args: KernelArguments,
        ctx: &mut KernelProcessStepContext,
    ) -> ProcessResult<Option<Value>>;
}

/// [`KernelFunction`] backed by a synchronous closure.
pub struct SyncFunction<F> {
    name: String,
    parameters: Vec<String>,
    func: F,
}

impl<F> SyncFunction<F>
where
    F: Fn(&KernelArguments, &mut KernelProcessStepContext) -> ProcessResult<Option<Value>>
        + Send
        + Sync
        + 'static,
{
    pub fn new(name: impl Into<String>, parameters: &[&str], func: F) -> Self {
        Self {
            name: name.into(),
            parameters: parameters.iter().map(|p| p.to_string()).collect(),
            func,
        }
    }

    pub fn arc(self) -> Arc<dyn KernelFunction> {
        Arc::new(self)
    }
}

#[async_trait]
impl<F> KernelFunction for SyncFunction<F>
where
    F: Fn(&KernelArguments, &mut KernelProcessStepContext) -> ProcessResult<Option<Value>>
        + Send
        + Sync
        + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn parameters(&self) -> Vec<String> {
        self.parameters.clone()
    }

    async fn invoke(
        &self,
        args: KernelArguments,
        ctx: &mut KernelProcessStepContext,
    ) -> ProcessResult<Option<Value>> {
        (self.func)(&args, ctx)
    }
}

/// A stateless step assembled from named functions.
#[derive(Clone, Default)]
pub struct FunctionStep {
    functions: Vec<Arc<dyn KernelFunction>>,
}

impl FunctionStep {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_functions(
        functions: impl IntoIterator<Item = Arc<dyn KernelFunction>>,
    ) -> ProcessResult<Self> {
        let mut step = Self::new();
        for function in functions {
            step.register(function)?;
        }
        Ok(step)
    }

    /// Add a function. Names must be unique within the step.
    pub fn register(&mut self, function: Arc<dyn KernelFunction>) -> ProcessResult<()> {
        if self.get(function.name()).is_some() {
            return Err(ProcessError::Initialization(format!(
                "function '{}' registered twice",
                function.name()
            )));
        }
        self.functions.push(function);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn KernelFunction>> {
        self.functions.iter().find(|f| f.name() == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.functions.iter().map(|f| f.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

#[async_trait]
impl StepBehavior for FunctionStep {
    fn functions(&self) -> Vec<FunctionMetadata> {
        self.functions
            .iter()
            .map(|f| FunctionMetadata {
                name: f.name().to_string(),
                parameters: f.parameters(),
            })
            .collect()
    }

    async fn activate(&mut self, _state: Option<Value>) -> ProcessResult<()> {
        Ok(())
    }

    fn snapshot_state(&self) -> ProcessResult<Option<Value>> {
        Ok(None)
    }

    async fn invoke(
        &mut self,
        function_name: &str,
        args: KernelArguments,
        ctx: &mut KernelProcessStepContext,
    ) -> ProcessResult<Option<Value>> {
        let function = self
            .get(function_name)
            .cloned()
            .ok_or_else(|| ProcessError::FunctionNotFound {
                step: ctx.step_id().to_string(),
                function: function_name.to_string(),
            })?;
        function.invoke(args, ctx).await
    }
}

/// Builds a fresh behavior for every step actor of one type.
pub type StepFactory = Arc<dyn Fn() -> Box<dyn StepBehavior> + Send + Sync>;

/// Step factories keyed by the `step_type` named in a
/// [`StepInfo`](crate::info::StepInfo).
#[derive(Clone, Default)]
pub struct StepRegistry {
    factories: HashMap<String, StepFactory>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed step. `factory` runs once per step actor.
    pub fn register_step<S, F>(&mut self, step_type: impl Into<String>, factory: F)
    where
        S: KernelProcessStep,
        F: Fn() -> S + Send + Sync + 'static,
    {
        self.factories.insert(
            step_type.into(),
            Arc::new(move || Box::new(TypedStep::new(factory())) as Box<dyn StepBehavior>),
        );
    }

    /// Register a step built from named functions shared by every instance.
    pub fn register_functions(
        &mut self,
        step_type: impl Into<String>,
        functions: impl IntoIterator<Item = Arc<dyn KernelFunction>>,
    ) -> ProcessResult<()> {
        let step = FunctionStep::from_functions(functions)?;
        self.factories.insert(
            step_type.into(),
            Arc::new(move || Box::new(step.clone()) as Box<dyn StepBehavior>),
        );
        Ok(())
    }

    /// Register a step type built by a caller-supplied factory, one instance per actor.
    pub fn register_factory(&mut self, step_type: impl Into<String>, factory: StepFactory) {
        self.factories.insert(step_type.into(), factory);
    }

    pub fn create(&self, step_type: &str) -> ProcessResult<Box<dyn StepBehavior>> {
        self.factories
            .get(step_type)
            .map(|factory| factory())
            .ok_or_else(|| ProcessError::UnknownStepType(step_type.to_string()))
    }

    pub fn contains(&self, step_type: &str) -> bool {
        self.factories.contains_key(step_type)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}
