//! Executor abstraction.
//!
//! An executor is a compute backend that runs task functions. Two protocols
//! are supported:
//! - [`Executor`]: a direct, awaitable `run`
//! - [`JobExecutor`]: submit a job, poll it, receive its result, and
//!   optionally cancel it
//!
//! Both carry `setup`/`teardown` hooks scoped to one task invocation.
//! [`ExecutorHandle::invoke`] drives either protocol and guarantees each hook
//! runs exactly once, with `teardown` running even when `run` fails.

use crate::error::NodeError;
use crate::function::{CallArgs, Streams, TaskFunction};
use crate::node::NodeId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use strata_core::DispatchId;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use ulid::Ulid;

/// Name of the executor registered by [`ExecutorRegistry::with_local`].
pub const LOCAL_EXECUTOR: &str = "local";

/// Context for one task invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskMetadata {
    pub dispatch_id: DispatchId,
    pub node_id: NodeId,
    pub node_name: String,
    pub function: String,
    pub executor: String,
    /// Dependency specs declared by the workflow.
    pub dependencies: Vec<String>,
}

/// Output of a successful task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutput {
    pub output: JsonValue,
    pub stdout: String,
    pub stderr: String,
}

/// A structured task failure, returned instead of raised.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskFailure {
    pub error: NodeError,
    pub stdout: String,
    pub stderr: String,
}

impl TaskFailure {
    /// Creates a failure with no captured output.
    #[must_use]
    pub fn new(error: NodeError) -> Self {
        Self {
            error,
            stdout: String::new(),
            stderr: String::new(),
        }
    }
}

/// A compute backend with a direct, awaitable run.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Prepares the backend for one invocation.
    async fn setup(&self, _metadata: &TaskMetadata) -> Result<(), String> {
        Ok(())
    }

    /// Runs the function, reporting task errors as a [`TaskFailure`].
    async fn run(
        &self,
        function: Arc<dyn TaskFunction>,
        args: CallArgs,
        metadata: &TaskMetadata,
    ) -> Result<TaskOutput, TaskFailure>;

    /// Releases whatever `setup` acquired.
    async fn teardown(&self, _metadata: &TaskMetadata) {}
}

/// Identifier of a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobHandle(Ulid);

impl JobHandle {
    /// Creates a new random handle.
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for JobHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job_{}", self.0)
    }
}

/// Status of a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Returns true once the job will not change status again.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Result of a finished job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobResult {
    pub status: JobStatus,
    pub output: Option<JsonValue>,
    pub error: Option<String>,
    pub stdout: String,
    pub stderr: String,
}

/// A compute backend using the job-handle protocol.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Prepares the backend for one invocation.
    async fn setup(&self, _metadata: &TaskMetadata) -> Result<(), String> {
        Ok(())
    }

    /// Submits the function and returns a handle to its job.
    async fn send(
        &self,
        function: Arc<dyn TaskFunction>,
        args: CallArgs,
        metadata: &TaskMetadata,
    ) -> Result<JobHandle, String>;

    /// Returns the job's current status.
    async fn poll(&self, handle: &JobHandle) -> Result<JobStatus, String>;

    /// Returns the result of a finished job.
    async fn receive(&self, handle: &JobHandle) -> Result<JobResult, String>;

    /// Attempts to cancel the job; returns true if it was cancelled.
    async fn cancel(&self, handle: &JobHandle) -> bool;

    /// Releases whatever `setup` acquired.
    async fn teardown(&self, _metadata: &TaskMetadata) {}
}

/// How a task invocation ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed(TaskOutput),
    Failed(TaskFailure),
    /// The backend cancelled the job before it finished.
    Cancelled { stdout: String, stderr: String },
}

/// An executor registered under a name, with the protocol it supports.
#[derive(Clone)]
pub enum ExecutorHandle {
    Direct(Arc<dyn Executor>),
    Job(Arc<dyn JobExecutor>),
}

impl ExecutorHandle {
    /// Runs one task invocation through the executor's protocol.
    ///
    /// `setup` and `teardown` each run exactly once. A failed `setup` is an
    /// executor configuration failure. For job executors a cancel on `token`
    /// is forwarded to [`JobExecutor::cancel`]; direct runs are never
    /// interrupted.
    pub async fn invoke(
        &self,
        function: Arc<dyn TaskFunction>,
        args: CallArgs,
        metadata: &TaskMetadata,
        token: &CancellationToken,
        poll_interval: Duration,
    ) -> TaskOutcome {
        match self {
            Self::Direct(executor) => {
                let outcome = match executor.setup(metadata).await {
                    Ok(()) => match executor.run(function, args, metadata).await {
                        Ok(output) => TaskOutcome::Completed(output),
                        Err(failure) => TaskOutcome::Failed(failure),
                    },
                    Err(reason) => setup_failed(metadata, reason),
                };
                executor.teardown(metadata).await;
                outcome
            }
            Self::Job(executor) => {
                let outcome = match executor.setup(metadata).await {
                    Ok(()) => {
                        run_job(executor.as_ref(), function, args, metadata, token, poll_interval)
                            .await
                    }
                    Err(reason) => setup_failed(metadata, reason),
                };
                executor.teardown(metadata).await;
                outcome
            }
        }
    }
}

impl fmt::Debug for ExecutorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct(_) => f.write_str("ExecutorHandle::Direct"),
            Self::Job(_) => f.write_str("ExecutorHandle::Job"),
        }
    }
}

fn setup_failed(metadata: &TaskMetadata, reason: String) -> TaskOutcome {
    warn!(
        dispatch_id = %metadata.dispatch_id,
        node_id = %metadata.node_id,
        executor = %metadata.executor,
        %reason,
        "executor setup failed"
    );
    TaskOutcome::Failed(TaskFailure::new(NodeError::ExecutorConfig {
        executor: metadata.executor.clone(),
        reason,
    }))
}

async fn run_job(
    executor: &dyn JobExecutor,
    function: Arc<dyn TaskFunction>,
    args: CallArgs,
    metadata: &TaskMetadata,
    token: &CancellationToken,
    poll_interval: Duration,
) -> TaskOutcome {
    let handle = match executor.send(function, args, metadata).await {
        Ok(handle) => handle,
        Err(reason) => {
            return TaskOutcome::Failed(TaskFailure::new(NodeError::ExecutorConfig {
                executor: metadata.executor.clone(),
                reason: format!("job submission failed: {reason}"),
            }));
        }
    };
    debug!(node_id = %metadata.node_id, job = %handle, "job submitted");

    let mut ticker = tokio::time::interval(poll_interval);
    let mut cancel_sent = false;
    loop {
        tokio::select! {
            () = token.cancelled(), if !cancel_sent => {
                cancel_sent = true;
                if executor.cancel(&handle).await {
                    debug!(node_id = %metadata.node_id, job = %handle, "job cancelled");
                    // Collect the cancelled job so the backend can forget it.
                    return match executor.receive(&handle).await {
                        Ok(JobResult { stdout, stderr, .. }) => {
                            TaskOutcome::Cancelled { stdout, stderr }
                        }
                        Err(_) => TaskOutcome::Cancelled {
                            stdout: String::new(),
                            stderr: String::new(),
                        },
                    };
                }
            }
            _ = ticker.tick() => match executor.poll(&handle).await {
                Ok(status) if status.is_finished() => break,
                Ok(_) => {}
                Err(reason) => {
                    return TaskOutcome::Failed(TaskFailure::new(NodeError::TaskRuntime {
                        message: format!("polling {handle} failed: {reason}"),
                    }));
                }
            },
        }
    }

    match executor.receive(&handle).await {
        Ok(JobResult {
            status: JobStatus::Completed,
            output,
            stdout,
            stderr,
            ..
        }) => TaskOutcome::Completed(TaskOutput {
            output: output.unwrap_or(JsonValue::Null),
            stdout,
            stderr,
        }),
        Ok(JobResult {
            status: JobStatus::Cancelled,
            stdout,
            stderr,
            ..
        }) => TaskOutcome::Cancelled { stdout, stderr },
        Ok(JobResult {
            error,
            stdout,
            stderr,
            ..
        }) => TaskOutcome::Failed(TaskFailure {
            error: NodeError::TaskRuntime {
                message: error.unwrap_or_else(|| "job failed".to_string()),
            },
            stdout,
            stderr,
        }),
        Err(reason) => TaskOutcome::Failed(TaskFailure::new(NodeError::TaskRuntime {
            message: format!("receiving {handle} failed: {reason}"),
        })),
    }
}

/// Executors available to the runner, keyed by name.
///
/// Built once at process start and shared by reference.
#[derive(Debug, Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, ExecutorHandle>,
}

impl ExecutorRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding a [`LocalExecutor`] named `local`.
    #[must_use]
    pub fn with_local(workers: usize) -> Self {
        Self::new().with_direct(LOCAL_EXECUTOR, LocalExecutor::new(workers))
    }

    /// Registers a direct executor.
    #[must_use]
    pub fn with_direct(mut self, name: impl Into<String>, executor: impl Executor + 'static) -> Self {
        self.register(name, ExecutorHandle::Direct(Arc::new(executor)));
        self
    }

    /// Registers a job executor.
    #[must_use]
    pub fn with_job(mut self, name: impl Into<String>, executor: impl JobExecutor + 'static) -> Self {
        self.register(name, ExecutorHandle::Job(Arc::new(executor)));
        self
    }

    /// Registers an executor handle, replacing any previous one with that name.
    pub fn register(&mut self, name: impl Into<String>, handle: ExecutorHandle) {
        self.executors.insert(name.into(), handle);
    }

    /// Looks up an executor.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<ExecutorHandle> {
        self.executors.get(name).cloned()
    }
}

/// Runs task functions on tokio's blocking pool.
///
/// At most `workers` invocations run at once; panics in a task body are
/// reported as task runtime failures.
#[derive(Debug, Clone)]
pub struct LocalExecutor {
    permits: Arc<Semaphore>,
}

impl LocalExecutor {
    /// Creates an executor running at most `workers` tasks at once.
    #[must_use]
    pub fn new(workers: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    async fn run(
        &self,
        function: Arc<dyn TaskFunction>,
        args: CallArgs,
        metadata: &TaskMetadata,
    ) -> Result<TaskOutput, TaskFailure> {
        let _permit = self.permits.acquire().await.map_err(|e| {
            TaskFailure::new(NodeError::ExecutorConfig {
                executor: metadata.executor.clone(),
                reason: e.to_string(),
            })
        })?;
        call_blocking(function, args).await
    }
}

/// Calls a task function on the blocking pool, catching panics.
pub(crate) async fn call_blocking(
    function: Arc<dyn TaskFunction>,
    args: CallArgs,
) -> Result<TaskOutput, TaskFailure> {
    let joined = tokio::task::spawn_blocking(move || {
        let mut streams = Streams::default();
        let result = function.call(&args, &mut streams);
        (result, streams)
    })
    .await;

    match joined {
        Ok((Ok(output), Streams { stdout, stderr })) => Ok(TaskOutput {
            output,
            stdout,
            stderr,
        }),
        Ok((Err(message), Streams { stdout, stderr })) => Err(TaskFailure {
            error: NodeError::TaskRuntime { message },
            stdout,
            stderr,
        }),
        Err(join_error) => {
            let message = if join_error.is_panic() {
                format!("panicked: {}", panic_message(join_error.into_panic()))
            } else {
                "task was aborted".to_string()
            };
            Err(TaskFailure::new(NodeError::TaskRuntime { message }))
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::FunctionRegistry;
    use serde_json::json;
    use std::sync::Mutex;

    fn metadata(executor: &str) -> TaskMetadata {
        TaskMetadata {
            dispatch_id: DispatchId::new(),
            node_id: NodeId::new(0),
            node_name: "node".to_string(),
            function: "f".to_string(),
            executor: executor.to_string(),
            dependencies: Vec::new(),
        }
    }

    fn builtin(name: &str) -> Arc<dyn TaskFunction> {
        FunctionRegistry::with_builtins().get(name).unwrap()
    }

    /// Records hook calls and optionally fails setup.
    #[derive(Default)]
    struct HookExecutor {
        calls: Arc<Mutex<Vec<&'static str>>>,
        fail_setup: bool,
    }

    #[async_trait]
    impl Executor for HookExecutor {
        async fn setup(&self, _metadata: &TaskMetadata) -> Result<(), String> {
            self.calls.lock().unwrap().push("setup");
            if self.fail_setup {
                Err("no credentials".to_string())
            } else {
                Ok(())
            }
        }

        async fn run(
            &self,
            function: Arc<dyn TaskFunction>,
            args: CallArgs,
            _metadata: &TaskMetadata,
        ) -> Result<TaskOutput, TaskFailure> {
            self.calls.lock().unwrap().push("run");
            call_blocking(function, args).await
        }

        async fn teardown(&self, _metadata: &TaskMetadata) {
            self.calls.lock().unwrap().push("teardown");
        }
    }

    #[tokio::test]
    async fn local_executor_runs_function() {
        let handle = ExecutorHandle::Direct(Arc::new(LocalExecutor::new(2)));
        let outcome = handle
            .invoke(
                builtin("add"),
                CallArgs::positional(vec![json!(2), json!(3)]),
                &metadata("local"),
                &CancellationToken::new(),
                Duration::from_millis(5),
            )
            .await;
        assert!(matches!(outcome, TaskOutcome::Completed(TaskOutput { output, .. }) if output == json!(5)));
    }

    #[tokio::test]
    async fn task_error_is_returned_not_raised() {
        let handle = ExecutorHandle::Direct(Arc::new(LocalExecutor::new(1)));
        let outcome = handle
            .invoke(
                builtin("fail"),
                CallArgs::positional(vec![json!("bad input")]),
                &metadata("local"),
                &CancellationToken::new(),
                Duration::from_millis(5),
            )
            .await;
        let TaskOutcome::Failed(failure) = outcome else {
            panic!("expected failure");
        };
        assert_eq!(
            failure.error,
            NodeError::TaskRuntime {
                message: "bad input".to_string()
            }
        );
        assert_eq!(failure.stderr, "bad input\n");
    }

    #[tokio::test]
    async fn panic_becomes_task_failure() {
        let panicking: Arc<dyn TaskFunction> =
            Arc::new(|_: &CallArgs, _: &mut Streams| -> Result<JsonValue, String> {
                panic!("exploded")
            });
        let result = call_blocking(panicking, CallArgs::default()).await;
        let failure = result.unwrap_err();
        assert!(failure.error.to_string().contains("panicked: exploded"));
    }

    #[tokio::test]
    async fn hooks_run_once_around_run() {
        let executor = HookExecutor::default();
        let calls = executor.calls.clone();
        let handle = ExecutorHandle::Direct(Arc::new(executor));
        let outcome = handle
            .invoke(
                builtin("fail"),
                CallArgs::default(),
                &metadata("hooks"),
                &CancellationToken::new(),
                Duration::from_millis(5),
            )
            .await;
        assert!(matches!(outcome, TaskOutcome::Failed(_)));
        assert_eq!(*calls.lock().unwrap(), vec!["setup", "run", "teardown"]);
    }

    #[tokio::test]
    async fn setup_failure_still_tears_down() {
        let executor = HookExecutor {
            fail_setup: true,
            ..HookExecutor::default()
        };
        let calls = executor.calls.clone();
        let handle = ExecutorHandle::Direct(Arc::new(executor));
        let outcome = handle
            .invoke(
                builtin("identity"),
                CallArgs::default(),
                &metadata("hooks"),
                &CancellationToken::new(),
                Duration::from_millis(5),
            )
            .await;
        let TaskOutcome::Failed(failure) = outcome else {
            panic!("expected failure");
        };
        assert!(matches!(failure.error, NodeError::ExecutorConfig { .. }));
        assert_eq!(*calls.lock().unwrap(), vec!["setup", "teardown"]);
    }

    #[test]
    fn registry_lookup() {
        let registry = ExecutorRegistry::with_local(2);
        assert!(matches!(
            registry.get(LOCAL_EXECUTOR),
            Some(ExecutorHandle::Direct(_))
        ));
        assert!(registry.get("gpu").is_none());
    }

    #[test]
    fn job_handle_display() {
        assert!(JobHandle::new().to_string().starts_with("job_"));
    }
}
