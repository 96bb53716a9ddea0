use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::error::{ProcessError, ProcessResult};
use crate::info::{ProcessInfo, StepNode};
use crate::runtime::{ActorKind, StepCall, StepHandle, StepRuntime};
use crate::types::{ActorId, KernelProcessEvent, ProcessEvent};

use super::RunSummary;

const SOURCE: &str = "context";

type RunReceiver = oneshot::Receiver<ProcessResult<RunSummary>>;

/// A spawned run. The task reports its result over a oneshot channel; a
/// dropped sender means the task was aborted.
struct RunningTask {
    join: JoinHandle<()>,
    /// Present for `start`; `run_once` holds its own receiver.
    result: Option<RunReceiver>,
}

impl RunningTask {
    fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

/// Host-side handle to a root process.
///
/// ```rust,no_run
/// use sk_process::function::StepRegistry;
/// use sk_process::info::ProcessInfo;
/// use sk_process::process::KernelProcessContext;
/// use sk_process::runtime::LocalRuntime;
/// use sk_process::types::KernelProcessEvent;
///
/// # async fn example(info: ProcessInfo, registry: StepRegistry) -> sk_process::error::ProcessResult<()> {
/// let runtime = LocalRuntime::new(registry).into_shared();
/// let process = KernelProcessContext::initialize_process(runtime, info).await?;
///
/// let summary = process
///     .run_once(KernelProcessEvent::new("Start", serde_json::json!(["Potato"])))
///     .await?;
/// println!("finished after {} supersteps", summary.supersteps);
/// # Ok(())
/// # }
/// ```
pub struct KernelProcessContext {
    runtime: Arc<dyn StepRuntime>,
    handle: StepHandle,
    task: Mutex<Option<RunningTask>>,
}

impl KernelProcessContext {
    /// Validate `info`, create every actor it describes and bind it as a root process.
    pub async fn initialize_process(
        runtime: Arc<dyn StepRuntime>,
        mut info: ProcessInfo,
    ) -> ProcessResult<Self> {
        info.assign_missing_ids();
        info.validate()?;
        let id = info.id().map(ActorId::new).ok_or_else(|| {
            ProcessError::Initialization(format!("process '{}' has no id", info.name()))
        })?;

        let handle = runtime.create_child(id, ActorKind::Process).await?;
        runtime
            .call(
                &handle,
                StepCall::InitializeProcess {
                    info,
                    parent_process_id: None,
                },
            )
            .await?;

        Ok(Self {
            runtime,
            handle,
            task: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &ActorId {
        &self.handle.id
    }

    pub fn runtime(&self) -> &Arc<dyn StepRuntime> {
        &self.runtime
    }

    fn spawn_run(
        &self,
        event: Option<KernelProcessEvent>,
        keep_alive: bool,
    ) -> (JoinHandle<()>, RunReceiver) {
        let runtime = self.runtime.clone();
        let handle = self.handle.clone();
        let (tx, rx) = oneshot::channel();
        let join = tokio::spawn(async move {
            let run = async {
                runtime
                    .call(&handle, StepCall::RunProcess { event, keep_alive })
                    .await?
                    .into_summary()
            };
            let result = AssertUnwindSafe(run).catch_unwind().await.unwrap_or_else(|_| {
                Err(ProcessError::Task(format!("run of process {} panicked", handle.id)))
            });
            // The receiver is gone when nobody waits for this run.
            let _ = tx.send(result);
        });
        (join, rx)
    }

    /// Send one event and drive the loop until it stops.
    ///
    /// A concurrent [`stop`](Self::stop) ends the run with
    /// [`RunOutcome::Cancelled`](super::RunOutcome::Cancelled).
    pub async fn run_once(&self, event: KernelProcessEvent) -> ProcessResult<RunSummary> {
        let result = {
            let mut slot = self.task.lock().await;
            if slot.as_ref().is_some_and(|t| !t.is_finished()) {
                return Err(ProcessError::AlreadyRunning(self.handle.id.to_string()));
            }
            let (join, result) = self.spawn_run(Some(event), false);
            *slot = Some(RunningTask { join, result: None });
            result
        };

        match result.await {
            Ok(result) => result,
            Err(_) => Ok(RunSummary::cancelled()),
        }
    }

    /// Run the loop as a background task. With `keep_alive` the loop keeps
    /// waiting for input after it goes idle, until [`stop`](Self::stop).
    pub async fn start(&self, keep_alive: bool) -> ProcessResult<()> {
        let mut slot = self.task.lock().await;
        if slot.as_ref().is_some_and(|t| !t.is_finished()) {
            return Err(ProcessError::AlreadyRunning(self.handle.id.to_string()));
        }
        let (join, result) = self.spawn_run(None, keep_alive);
        *slot = Some(RunningTask {
            join,
            result: Some(result),
        });
        self.runtime.logger().debug(
            SOURCE,
            &self.handle.id,
            &format!("started (keep_alive={keep_alive})"),
        );
        Ok(())
    }

    /// Cancel the running task and wait for it. Returns at once when nothing
    /// was started. A task that already failed reports its error here.
    pub async fn stop(&self) -> ProcessResult<()> {
        let Some(task) = self.task.lock().await.take() else {
            return Ok(());
        };
        task.join.abort();
        // Resolves once the run's future is dropped, which releases the process.
        if let Err(e) = task.join.await {
            if !e.is_cancelled() {
                return Err(ProcessError::Task(e.to_string()));
            }
        }
        self.runtime
            .logger()
            .debug(SOURCE, &self.handle.id, "stopped");
        match task.result.map(|mut rx| rx.try_recv()) {
            Some(Ok(Err(e))) => Err(e),
            _ => Ok(()),
        }
    }

    /// Wait for a run begun with [`start`](Self::start) to finish on its own.
    /// A keep-alive run only finishes through [`stop`](Self::stop).
    pub async fn join(&self) -> ProcessResult<RunSummary> {
        let (join, result) = {
            let mut slot = self.task.lock().await;
            match slot.take() {
                Some(RunningTask {
                    join,
                    result: Some(result),
                }) => (join, result),
                other => {
                    *slot = other;
                    return Err(ProcessError::Task("no started run to join".into()));
                }
            }
        };
        if let Err(e) = join.await {
            if !e.is_cancelled() {
                return Err(ProcessError::Task(e.to_string()));
            }
        }
        match result.await {
            Ok(result) => result,
            Err(_) => Ok(RunSummary::cancelled()),
        }
    }

    /// Queue an external event without driving the loop.
    pub async fn send_message(&self, event: KernelProcessEvent) -> ProcessResult<()> {
        self.runtime
            .external_event_buffer(&self.handle.id)
            .enqueue(event)
            .await
    }

    /// The graph with every step's current state.
    pub async fn get_process_info(&self) -> ProcessResult<ProcessInfo> {
        match self
            .runtime
            .call(&self.handle, StepCall::GetStepInfo)
            .await?
            .into_node()?
        {
            StepNode::Process(info) => Ok(info),
            StepNode::Step(step) => Err(ProcessError::State(format!(
                "actor {} reported step '{}' instead of a process",
                self.handle.id,
                step.name()
            ))),
        }
    }

    /// Take the public events that have left this process so far.
    pub async fn drain_public_events(&self) -> ProcessResult<Vec<ProcessEvent>> {
        self.runtime.event_buffer(&self.handle.id).dequeue_all().await
    }
}

impl Drop for KernelProcessContext {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.join.abort();
        }
    }
}
