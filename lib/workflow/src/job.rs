//! In-process job backend.
//!
//! [`BackgroundJobExecutor`] implements the job-handle protocol on top of
//! spawned tokio tasks: `send` queues a job and returns at once, `poll`
//! reports its status, `receive` hands back the result, and `cancel` aborts
//! jobs that have not finished.

use crate::error::NodeError;
use crate::executor::{
    JobExecutor, JobHandle, JobResult, JobStatus, TaskMetadata, TaskOutput, call_blocking,
};
use crate::function::{CallArgs, TaskFunction};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::AbortHandle;
use tracing::debug;

#[derive(Debug)]
struct Job {
    status: JobStatus,
    result: Option<JobResult>,
    abort: Option<AbortHandle>,
}

/// Runs jobs on background tasks, at most `workers` at a time.
#[derive(Debug, Clone)]
pub struct BackgroundJobExecutor {
    jobs: Arc<Mutex<HashMap<JobHandle, Job>>>,
    permits: Arc<Semaphore>,
}

impl BackgroundJobExecutor {
    /// Creates a backend running at most `workers` jobs at once.
    #[must_use]
    pub fn new(workers: usize) -> Self {
        Self {
            jobs: Arc::new(Mutex::new(HashMap::new())),
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    /// Returns the number of jobs the backend still tracks.
    pub async fn job_count(&self) -> usize {
        self.jobs.lock().await.len()
    }
}

#[async_trait]
impl JobExecutor for BackgroundJobExecutor {
    async fn send(
        &self,
        function: Arc<dyn TaskFunction>,
        args: CallArgs,
        metadata: &TaskMetadata,
    ) -> Result<JobHandle, String> {
        let handle = JobHandle::new();
        self.jobs.lock().await.insert(
            handle,
            Job {
                status: JobStatus::Queued,
                result: None,
                abort: None,
            },
        );

        let jobs = Arc::clone(&self.jobs);
        let permits = Arc::clone(&self.permits);
        let task = tokio::spawn(async move {
            let Ok(_permit) = permits.acquire().await else {
                return;
            };
            if let Some(job) = jobs.lock().await.get_mut(&handle) {
                job.status = JobStatus::Running;
            }

            let result = match call_blocking(function, args).await {
                Ok(TaskOutput {
                    output,
                    stdout,
                    stderr,
                }) => JobResult {
                    status: JobStatus::Completed,
                    output: Some(output),
                    error: None,
                    stdout,
                    stderr,
                },
                Err(failure) => JobResult {
                    status: JobStatus::Failed,
                    output: None,
                    error: Some(match failure.error {
                        NodeError::TaskRuntime { message } => message,
                        other => other.to_string(),
                    }),
                    stdout: failure.stdout,
                    stderr: failure.stderr,
                },
            };

            let mut jobs = jobs.lock().await;
            if let Some(job) = jobs.get_mut(&handle) {
                if job.status != JobStatus::Cancelled {
                    job.status = result.status;
                    job.result = Some(result);
                }
            }
        });

        if let Some(job) = self.jobs.lock().await.get_mut(&handle) {
            job.abort = Some(task.abort_handle());
        }
        debug!(node_id = %metadata.node_id, job = %handle, "background job queued");
        Ok(handle)
    }

    async fn poll(&self, handle: &JobHandle) -> Result<JobStatus, String> {
        self.jobs
            .lock()
            .await
            .get(handle)
            .map(|job| job.status)
            .ok_or_else(|| format!("unknown job {handle}"))
    }

    async fn receive(&self, handle: &JobHandle) -> Result<JobResult, String> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get(handle)
            .ok_or_else(|| format!("unknown job {handle}"))?;
        if !job.status.is_finished() {
            return Err(format!("job {handle} has not finished"));
        }
        let result = job.result.clone().unwrap_or(JobResult {
            status: job.status,
            output: None,
            error: None,
            stdout: String::new(),
            stderr: String::new(),
        });
        jobs.remove(handle);
        Ok(result)
    }

    async fn cancel(&self, handle: &JobHandle) -> bool {
        let mut jobs = self.jobs.lock().await;
        let Some(job) = jobs.get_mut(handle) else {
            return false;
        };
        if job.status.is_finished() {
            return false;
        }
        job.status = JobStatus::Cancelled;
        if let Some(abort) = job.abort.take() {
            abort.abort();
        }
        debug!(job = %handle, "background job cancelled");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ExecutorHandle, TaskOutcome};
    use crate::function::FunctionRegistry;
    use crate::node::NodeId;
    use serde_json::json;
    use std::time::Duration;
    use strata_core::DispatchId;
    use tokio_util::sync::CancellationToken;

    fn metadata() -> TaskMetadata {
        TaskMetadata {
            dispatch_id: DispatchId::new(),
            node_id: NodeId::new(0),
            node_name: "job".to_string(),
            function: "sleep".to_string(),
            executor: "jobs".to_string(),
            dependencies: Vec::new(),
        }
    }

    fn builtin(name: &str) -> Arc<dyn TaskFunction> {
        FunctionRegistry::with_builtins().get(name).unwrap()
    }

    #[tokio::test]
    async fn job_protocol_roundtrip() {
        let executor = BackgroundJobExecutor::new(2);
        let handle = executor
            .send(
                builtin("multiply"),
                CallArgs::positional(vec![json!(5), json!(3)]),
                &metadata(),
            )
            .await
            .unwrap();

        let mut status = executor.poll(&handle).await.unwrap();
        while !status.is_finished() {
            tokio::time::sleep(Duration::from_millis(5)).await;
            status = executor.poll(&handle).await.unwrap();
        }
        let result = executor.receive(&handle).await.unwrap();
        assert_eq!(result.status, JobStatus::Completed);
        assert_eq!(result.output, Some(json!(15)));
        assert_eq!(executor.job_count().await, 0);
    }

    #[tokio::test]
    async fn receive_before_finish_is_an_error() {
        let executor = BackgroundJobExecutor::new(1);
        let args = CallArgs::positional(vec![json!(200)]);
        let handle = executor.send(builtin("sleep"), args, &metadata()).await.unwrap();
        assert!(executor.receive(&handle).await.is_err());
        assert!(executor.cancel(&handle).await);
        assert!(!executor.cancel(&handle).await);
        assert_eq!(executor.poll(&handle).await.unwrap(), JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn token_cancel_reaches_job() {
        let executor = BackgroundJobExecutor::new(1);
        let handle = ExecutorHandle::Job(Arc::new(executor.clone()));
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            canceller.cancel();
        });

        let outcome = handle
            .invoke(
                builtin("sleep"),
                CallArgs::positional(vec![json!(500)]),
                &metadata(),
                &token,
                Duration::from_millis(5),
            )
            .await;
        assert!(matches!(outcome, TaskOutcome::Cancelled { .. }));
        assert_eq!(executor.job_count().await, 0);

        // The aborted task must not bring the entry back.
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(executor.job_count().await, 0);
    }

    #[tokio::test]
    async fn failed_job_reports_error() {
        let handle = ExecutorHandle::Job(Arc::new(BackgroundJobExecutor::new(1)));
        let outcome = handle
            .invoke(
                builtin("fail"),
                CallArgs::positional(vec![json!("nope")]),
                &metadata(),
                &CancellationToken::new(),
                Duration::from_millis(5),
            )
            .await;
        let TaskOutcome::Failed(failure) = outcome else {
            panic!("expected failure");
        };
        assert!(failure.error.to_string().contains("nope"));
        assert_eq!(failure.stderr, "nope\n");
    }
}
