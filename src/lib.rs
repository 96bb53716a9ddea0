//! # sk-process
//!
//! Superstep process runtime: steps connected by event edges, executed in
//! lock-step rounds, with nested processes and persisted actor state.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use serde_json::{json, Value};
//! use sk_process::prelude::*;
//!
//! #[derive(Clone, Copy)]
//! enum CutFunction {
//!     Cut,
//! }
//!
//! impl StepFunction for CutFunction {
//!     fn all() -> &'static [Self] {
//!         &[CutFunction::Cut]
//!     }
//!     fn name(&self) -> &'static str {
//!         "cut"
//!     }
//!     fn parameters(&self) -> &'static [&'static str] {
//!         &["food"]
//!     }
//! }
//!
//! struct Cut;
//!
//! #[async_trait]
//! impl KernelProcessStep for Cut {
//!     type Function = CutFunction;
//!
//!     async fn invoke(
//!         &mut self,
//!         _function: CutFunction,
//!         args: KernelArguments,
//!         ctx: &mut KernelProcessStepContext,
//!     ) -> ProcessResult<Option<Value>> {
//!         let mut food: Vec<String> = args.get("food")?;
//!         food.push(format!("{}_chopped", food[0]));
//!         ctx.emit_event("ChoppingReady", json!(food));
//!         Ok(None)
//!     }
//! }
//!
//! # async fn example() -> ProcessResult<()> {
//! let mut registry = StepRegistry::new();
//! registry.register_step("Cut", || Cut);
//!
//! let info = ProcessInfo::new("Kitchen")
//!     .with_step(StepInfo::new("cut", "Cut"))
//!     .on_input_event("StartCut", KernelProcessFunctionTarget::new("cut", "cut"));
//!
//! let runtime = LocalRuntime::new(registry).into_shared();
//! let process = KernelProcessContext::initialize_process(runtime, info).await?;
//! let summary = process
//!     .run_once(KernelProcessEvent::new("StartCut", json!(["Potato"])))
//!     .await?;
//! assert_eq!(summary.outcome, RunOutcome::Quiescent);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`types`] | Events, edges, messages, namespaces, step and process state |
//! | [`info`] | `StepInfo` / `ProcessInfo` graph descriptors and validation |
//! | [`function`] | Typed step functions, `FunctionStep` plugins, `StepRegistry` |
//! | [`step`] | Step actor: initialize, activate, prepare, process |
//! | [`process`] | Process actor, superstep loop, `KernelProcessContext` host handle |
//! | [`runtime`] | `StepRuntime` capability trait and the in-process `LocalRuntime` |
//! | [`buffer`] | Per-actor FIFO mailboxes with drain-all semantics |
//! | [`state`] | Actor key/value state with in-memory and JSONL snapshot backends |
//! | [`config`] | `ProcessConfig` loop settings |
//! | [`log`] | Structured process log with `tracing` and in-memory sinks |
//! | [`error`] | `ProcessError` with thiserror |

pub mod buffer;
pub mod config;
pub mod error;
pub mod function;
pub mod info;
pub mod log;
pub mod process;
pub mod runtime;
pub mod state;
pub mod step;
pub mod types;

pub use error::{ProcessError, ProcessResult};

/// Common imports for defining steps and driving processes.
pub mod prelude {
    pub use crate::config::ProcessConfig;
    pub use crate::error::{ProcessError, ProcessResult};
    pub use crate::function::{
        FunctionStep, KernelArguments, KernelFunction, KernelProcessStep,
        KernelProcessStepContext, StepFunction, StepRegistry, SyncFunction,
    };
    pub use crate::info::{ProcessInfo, StepInfo, StepNode};
    pub use crate::process::{KernelProcessContext, RunOutcome, RunSummary};
    pub use crate::runtime::{LocalRuntime, StepRuntime};
    pub use crate::types::{
        KernelProcessEvent, KernelProcessEventVisibility, KernelProcessFunctionTarget,
        ProcessEvent,
    };
}
