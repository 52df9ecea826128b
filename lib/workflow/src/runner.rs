//! The layer-by-layer workflow scheduler.
//!
//! [`Runner::run_workflow`] walks the topological layers of a dispatch's
//! graph. Nodes of one layer run concurrently on a bounded pool; a layer
//! only starts after the previous one fully resolved. Parameter, lookup and
//! collection nodes are resolved inline in the scheduler's own step. Tasks
//! go to an executor and sublattices recurse into a nested run.
//!
//! The runner owns the [`ExecutionState`] it is given until the dispatch
//! settles. Every node and workflow transition is persisted through the
//! [`StateStore`] and announced through the [`Notifier`].

use crate::cancellation::CancellationRegistry;
use crate::config::RunnerConfig;
use crate::definition::{WorkflowDefinition, WorkflowExecutor, WorkflowInputs};
use crate::error::{DispatchError, GraphError, NodeError};
use crate::execution::{ExecutionState, NodeStatus, NodeUpdate, WorkflowStatus};
use crate::executor::{ExecutorRegistry, TaskFailure, TaskMetadata, TaskOutcome, TaskOutput};
use crate::function::{CallArgs, FunctionRegistry};
use crate::node::{Node, NodeId, NodeKind};
use crate::notify::{NoopNotifier, Notifier, StatusEvent};
use crate::resolve::{call_args, gather, resolve_inline};
use crate::store::{MemoryStore, StateStore};
use crate::sublattice;
use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use rootcause::prelude::{Report, ResultExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use strata_core::DispatchId;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// A task invocation prepared by the scheduler.
#[derive(Debug)]
struct TaskCall {
    args: CallArgs,
    metadata: TaskMetadata,
}

/// Work handed to the layer's worker pool.
#[derive(Debug)]
enum Work {
    Task(TaskCall),
    Sublattice(ExecutionState),
}

/// Executes workflow dispatches.
#[derive(Clone)]
pub struct Runner {
    functions: Arc<FunctionRegistry>,
    executors: Arc<ExecutorRegistry>,
    store: Arc<dyn StateStore>,
    notifier: Arc<dyn Notifier>,
    signals: CancellationRegistry,
    config: RunnerConfig,
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("functions", &self.functions)
            .field("executors", &self.executors)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Runner {
    /// Creates a runner with an in-memory store and no notifications.
    #[must_use]
    pub fn new(functions: FunctionRegistry, executors: ExecutorRegistry) -> Self {
        Self {
            functions: Arc::new(functions),
            executors: Arc::new(executors),
            store: Arc::new(MemoryStore::new()),
            notifier: Arc::new(NoopNotifier),
            signals: CancellationRegistry::new(),
            config: RunnerConfig::default(),
        }
    }

    #[must_use]
    pub fn with_store(mut self, store: impl StateStore + 'static) -> Self {
        self.store = Arc::new(store);
        self
    }

    #[must_use]
    pub fn with_notifier(mut self, notifier: impl Notifier + 'static) -> Self {
        self.notifier = Arc::new(notifier);
        self
    }

    /// Shares an existing set of cancellation signals.
    #[must_use]
    pub fn with_cancellation(mut self, signals: CancellationRegistry) -> Self {
        self.signals = signals;
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    /// The cancellation signals this runner reads.
    #[must_use]
    pub fn signals(&self) -> &CancellationRegistry {
        &self.signals
    }

    /// The store this runner persists to.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    #[must_use]
    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Creates the NEW state of a top-level dispatch.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::InvalidDefinition` if the definition can't be
    /// bound to the inputs or its graph is invalid.
    pub fn prepare(
        &self,
        definition: WorkflowDefinition,
        inputs: WorkflowInputs,
    ) -> Result<ExecutionState, Report<DispatchError>> {
        Ok(ExecutionState::new(DispatchId::new(), definition, inputs)
            .context(DispatchError::InvalidDefinition)?)
    }

    /// Runs a new dispatch to completion and returns its final state.
    ///
    /// # Errors
    ///
    /// Returns an error if the definition is rejected, or if the dispatch was
    /// aborted by an integrity or persistence failure. An aborted dispatch
    /// is still recorded FAILED.
    #[instrument(skip_all, fields(workflow = %definition.name))]
    pub async fn dispatch(
        &self,
        definition: WorkflowDefinition,
        inputs: WorkflowInputs,
    ) -> Result<ExecutionState, Report<DispatchError>> {
        let mut state = self.prepare(definition, inputs)?;
        info!(dispatch_id = %state.dispatch_id, "dispatch created");
        self.store
            .persist(&state)
            .await
            .context(DispatchError::Store {
                dispatch_id: state.dispatch_id.clone(),
            })?;
        let outcome = self.execute(&mut state).await;
        self.signals.release(&state.dispatch_id);
        outcome.map(|()| state)
    }

    /// Runs a state, recording an abort on it if the run fails.
    ///
    /// # Errors
    ///
    /// Returns the report that aborted the dispatch.
    pub async fn execute(&self, state: &mut ExecutionState) -> Result<(), Report<DispatchError>> {
        match self.run_workflow(state).await {
            Ok(()) => Ok(()),
            Err(report) => {
                self.abort(state, &report).await;
                Err(report)
            }
        }
    }

    /// Sets the cancellation signal of a dispatch and everything nested in it.
    pub fn cancel(&self, dispatch_id: &DispatchId) {
        info!(%dispatch_id, "cancellation requested");
        self.signals.cancel(dispatch_id);
    }

    /// Runs a dispatch until it settles.
    ///
    /// Nodes that are already terminal are skipped, so a state reloaded from
    /// the store resumes at its first unfinished layer. A state that is
    /// already settled is returned as is.
    ///
    /// # Errors
    ///
    /// Returns an error for integrity violations (a scheduled node without a
    /// dependency output, an unlayerable graph) and for store failures.
    /// Task and executor failures are recorded on their nodes instead.
    pub fn run_workflow<'a>(
        &'a self,
        state: &'a mut ExecutionState,
    ) -> BoxFuture<'a, Result<(), Report<DispatchError>>> {
        async move {
            let token = match state.dispatch_id.parent() {
                Some(parent) => self.signals.register_nested(&parent, &state.dispatch_id),
                None => self.signals.register(&state.dispatch_id),
            };
            if state.status.is_settled() {
                debug!(dispatch_id = %state.dispatch_id, status = %state.status, "dispatch already settled");
                return Ok(());
            }

            state.initialize_nodes();
            self.set_status(state, WorkflowStatus::Running).await?;

            let layers = state
                .graph
                .topological_layers()
                .context(DispatchError::Graph {
                    dispatch_id: state.dispatch_id.clone(),
                })?;

            for layer in &layers {
                if token.is_cancelled() {
                    break;
                }
                self.run_layer(state, layer, &token).await?;

                let stopped = layer.iter().any(|&node_id| {
                    matches!(
                        state.node_status(node_id),
                        Some(NodeStatus::Failed | NodeStatus::Cancelled)
                    )
                });
                if stopped {
                    break;
                }
            }

            if token.is_cancelled() {
                // RUNNING records here were left by a process that stopped.
                let unfinished: Vec<NodeId> = state
                    .nodes
                    .iter()
                    .filter(|(_, record)| !record.status.is_terminal())
                    .map(|(&node_id, _)| node_id)
                    .collect();
                for node_id in unfinished {
                    self.record(state, node_id, NodeUpdate::cancelled()).await?;
                }
            }

            self.finish(state).await
        }
        .boxed()
    }

    /// Completes a dispatch parked in PENDING_POSTPROCESSING.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::AlreadyTerminal` for a terminal state,
    /// `DispatchError::NotAwaitingPostprocessing` for any other status but
    /// PENDING_POSTPROCESSING, and store errors. An output that can't be
    /// evaluated is not an error: the dispatch ends POSTPROCESSING_FAILED.
    pub async fn postprocess(&self, state: &mut ExecutionState) -> Result<(), Report<DispatchError>> {
        if state.is_terminal() {
            return Err(DispatchError::AlreadyTerminal {
                dispatch_id: state.dispatch_id.clone(),
            }
            .into());
        }
        if state.status != WorkflowStatus::PendingPostprocessing {
            return Err(DispatchError::NotAwaitingPostprocessing {
                dispatch_id: state.dispatch_id.clone(),
                status: state.status,
            }
            .into());
        }
        self.evaluate_output(state).await
    }

    /// Evaluates the workflow output from the node outputs.
    async fn evaluate_output(&self, state: &mut ExecutionState) -> Result<(), Report<DispatchError>> {
        self.set_status(state, WorkflowStatus::Postprocessing).await?;

        let evaluated = state
            .definition
            .output
            .evaluate(&|node_id| state.get_node_output(node_id).cloned());
        match evaluated {
            Ok(result) => {
                state.final_result = Some(result);
                self.set_status(state, WorkflowStatus::Completed).await
            }
            Err(e) => {
                warn!(dispatch_id = %state.dispatch_id, error = %e, "post-processing failed");
                state.error = Some(e.to_string());
                self.set_status(state, WorkflowStatus::PostprocessingFailed).await
            }
        }
    }

    async fn run_layer(
        &self,
        state: &mut ExecutionState,
        layer: &[NodeId],
        token: &CancellationToken,
    ) -> Result<(), Report<DispatchError>> {
        let layer_failed = AtomicBool::new(false);
        let mut work = Vec::new();

        for &node_id in layer {
            if state.node_status(node_id).is_some_and(|status| status.is_terminal()) {
                continue;
            }
            if token.is_cancelled() || layer_failed.load(Ordering::SeqCst) {
                self.record(state, node_id, NodeUpdate::cancelled()).await?;
                continue;
            }

            let Node {
                name,
                kind,
                executor,
                ..
            } = state
                .graph
                .node(node_id)
                .cloned()
                .ok_or(GraphError::NodeNotFound { node_id })
                .context(DispatchError::Graph {
                    dispatch_id: state.dispatch_id.clone(),
                })?;
            let inputs = gather(state, node_id)?;

            match kind {
                NodeKind::Task { function } => {
                    let call = self.task_call(state, node_id, name, function, executor, call_args(inputs));
                    work.push((node_id, Work::Task(call)));
                }
                NodeKind::Sublattice { definition } => {
                    match sublattice::build_nested(state, node_id, &definition, call_args(inputs)) {
                        Ok(nested) => work.push((node_id, Work::Sublattice(nested))),
                        Err(e) => {
                            self.record(state, node_id, NodeUpdate::running()).await?;
                            self.fail_inline(state, node_id, &e).await?;
                            layer_failed.store(true, Ordering::SeqCst);
                        }
                    }
                }
                kind => {
                    self.record(state, node_id, NodeUpdate::running()).await?;
                    match resolve_inline(&kind, inputs) {
                        Ok(value) => self.record(state, node_id, NodeUpdate::completed(value)).await?,
                        Err(e) => {
                            self.fail_inline(state, node_id, &e).await?;
                            layer_failed.store(true, Ordering::SeqCst);
                        }
                    }
                }
            }
        }

        if work.is_empty() {
            return Ok(());
        }

        let permits = Semaphore::new(self.config.max_workers.max(1));
        let (started_tx, mut started_rx) = mpsc::unbounded_channel();
        let mut pending: FuturesUnordered<_> = work
            .into_iter()
            .map(|(node_id, work)| {
                self.run_work(node_id, work, &permits, token, &layer_failed, started_tx.clone())
            })
            .collect();
        drop(started_tx);

        loop {
            tokio::select! {
                biased;
                Some(node_id) = started_rx.recv() => {
                    self.record(state, node_id, NodeUpdate::running()).await?;
                }
                Some(finished) = pending.next() => {
                    // A worker may start and finish within one poll.
                    while let Ok(node_id) = started_rx.try_recv() {
                        self.record(state, node_id, NodeUpdate::running()).await?;
                    }
                    let (node_id, update) = finished?;
                    self.record(state, node_id, update).await?;
                }
                else => break,
            }
        }
        Ok(())
    }

    async fn run_work(
        &self,
        node_id: NodeId,
        work: Work,
        permits: &Semaphore,
        token: &CancellationToken,
        layer_failed: &AtomicBool,
        started: mpsc::UnboundedSender<NodeId>,
    ) -> Result<(NodeId, NodeUpdate), Report<DispatchError>> {
        let Ok(_permit) = permits.acquire().await else {
            return Ok((node_id, NodeUpdate::cancelled()));
        };
        if token.is_cancelled() || layer_failed.load(Ordering::SeqCst) {
            return Ok((node_id, NodeUpdate::cancelled()));
        }
        let _ = started.send(node_id);

        let update = match work {
            Work::Task(call) => self.execute_task(call, token).await,
            Work::Sublattice(nested) => self.execute_sublattice(nested).await?,
        };
        if update.status == Some(NodeStatus::Failed) {
            layer_failed.store(true, Ordering::SeqCst);
        }
        Ok((node_id, update))
    }

    fn task_call(
        &self,
        state: &ExecutionState,
        node_id: NodeId,
        node_name: String,
        function: String,
        executor: Option<String>,
        args: CallArgs,
    ) -> TaskCall {
        let metadata = &state.definition.metadata;
        let executor = executor
            .or_else(|| metadata.executor.clone())
            .unwrap_or_else(|| self.config.default_executor.clone());
        TaskCall {
            args,
            metadata: TaskMetadata {
                dispatch_id: state.dispatch_id.clone(),
                node_id,
                node_name,
                function,
                executor,
                dependencies: metadata.dependencies.clone(),
            },
        }
    }

    async fn execute_task(&self, call: TaskCall, token: &CancellationToken) -> NodeUpdate {
        let TaskCall { args, metadata } = call;
        let Some(handle) = self.executors.get(&metadata.executor) else {
            return task_failed(
                &metadata,
                NodeError::ExecutorConfig {
                    executor: metadata.executor.clone(),
                    reason: "not registered".to_string(),
                },
            );
        };
        let Some(function) = self.functions.get(&metadata.function) else {
            return task_failed(
                &metadata,
                NodeError::FunctionNotRegistered {
                    function: metadata.function.clone(),
                },
            );
        };

        let outcome = handle
            .invoke(function, args, &metadata, token, self.config.poll_interval())
            .await;
        match outcome {
            TaskOutcome::Completed(TaskOutput {
                output,
                stdout,
                stderr,
            }) => NodeUpdate::completed(output).with_streams(stdout, stderr),
            TaskOutcome::Failed(TaskFailure {
                error,
                stdout,
                stderr,
            }) => task_failed(&metadata, error).with_streams(stdout, stderr),
            TaskOutcome::Cancelled { stdout, stderr } => {
                NodeUpdate::cancelled().with_streams(stdout, stderr)
            }
        }
    }

    async fn execute_sublattice(
        &self,
        fresh: ExecutionState,
    ) -> Result<NodeUpdate, Report<DispatchError>> {
        // A resumed parent picks up the nested run where it stopped.
        let mut nested = match self.store.load(&fresh.dispatch_id).await {
            Ok(saved) => saved,
            Err(_) => fresh,
        };
        debug!(dispatch_id = %nested.dispatch_id, "running nested workflow");
        self.execute(&mut nested).await?;
        Ok(sublattice::node_update(nested))
    }

    async fn fail_inline(
        &self,
        state: &mut ExecutionState,
        node_id: NodeId,
        error: &NodeError,
    ) -> Result<(), Report<DispatchError>> {
        warn!(dispatch_id = %state.dispatch_id, %node_id, %error, "node failed");
        self.record(state, node_id, NodeUpdate::failed(error.to_string()))
            .await
    }

    /// Applies a node update, then persists and announces it.
    async fn record(
        &self,
        state: &mut ExecutionState,
        node_id: NodeId,
        update: NodeUpdate,
    ) -> Result<(), Report<DispatchError>> {
        let status = update.status;
        let changed = state
            .update_node(node_id, update.clone())
            .context(DispatchError::State {
                dispatch_id: state.dispatch_id.clone(),
            })?;
        if !changed {
            return Ok(());
        }

        self.store
            .update_node_record(&state.dispatch_id, node_id, update)
            .await
            .context(DispatchError::Store {
                dispatch_id: state.dispatch_id.clone(),
            })?;
        if let Some(status) = status {
            debug!(dispatch_id = %state.dispatch_id, %node_id, %status, "node status changed");
            self.notifier
                .notify(StatusEvent::node(&state.dispatch_id, node_id, status));
        }
        Ok(())
    }

    async fn set_status(
        &self,
        state: &mut ExecutionState,
        status: WorkflowStatus,
    ) -> Result<(), Report<DispatchError>> {
        state.status = status;
        if status == WorkflowStatus::Running && state.start_time.is_none() {
            state.start_time = Some(Utc::now());
        }
        if status.is_settled() {
            state.end_time = Some(Utc::now());
        }
        debug!(dispatch_id = %state.dispatch_id, %status, "workflow status changed");

        self.store
            .persist(state)
            .await
            .context(DispatchError::Store {
                dispatch_id: state.dispatch_id.clone(),
            })?;
        self.notifier
            .notify(StatusEvent::workflow(&state.dispatch_id, status));
        Ok(())
    }

    async fn finish(&self, state: &mut ExecutionState) -> Result<(), Report<DispatchError>> {
        match state.aggregate_status() {
            WorkflowStatus::Completed => match state.definition.metadata.workflow_executor {
                WorkflowExecutor::Dispatcher => self.evaluate_output(state).await,
                WorkflowExecutor::Client => {
                    self.set_status(state, WorkflowStatus::PendingPostprocessing)
                        .await
                }
            },
            WorkflowStatus::Cancelled => {
                info!(dispatch_id = %state.dispatch_id, "dispatch cancelled");
                self.set_status(state, WorkflowStatus::Cancelled).await
            }
            WorkflowStatus::Failed => {
                state.error = state.failure_message();
                warn!(
                    dispatch_id = %state.dispatch_id,
                    error = state.error.as_deref().unwrap_or_default(),
                    "dispatch failed"
                );
                self.set_status(state, WorkflowStatus::Failed).await
            }
            other => {
                state.error = Some(format!("dispatch stopped while nodes were {other}"));
                self.set_status(state, WorkflowStatus::Failed).await
            }
        }
    }

    /// Records a dispatch that was aborted by an error.
    ///
    /// Persisting is best effort; the report is what the caller sees.
    async fn abort(&self, state: &mut ExecutionState, report: &Report<DispatchError>) {
        error!(dispatch_id = %state.dispatch_id, error = %report, "dispatch aborted");
        state.status = WorkflowStatus::Failed;
        state.end_time = Some(Utc::now());
        state.error = Some(report.to_string());
        if let Err(e) = self.store.persist(state).await {
            warn!(dispatch_id = %state.dispatch_id, error = %e, "could not persist aborted dispatch");
        }
        self.notifier
            .notify(StatusEvent::workflow(&state.dispatch_id, WorkflowStatus::Failed));
    }
}

fn task_failed(metadata: &TaskMetadata, error: NodeError) -> NodeUpdate {
    warn!(
        dispatch_id = %metadata.dispatch_id,
        node_id = %metadata.node_id,
        executor = %metadata.executor,
        %error,
        "task failed"
    );
    NodeUpdate::failed(error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::ResultExpr;
    use crate::executor::{Executor, LOCAL_EXECUTOR};
    use crate::job::BackgroundJobExecutor;
    use crate::notify::ChannelNotifier;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    fn runner() -> Runner {
        Runner::new(FunctionRegistry::with_builtins(), ExecutorRegistry::with_local(4))
    }

    fn add_then_multiply() -> WorkflowDefinition {
        let mut b = WorkflowDefinition::builder("add_then_multiply");
        let two = b.parameter(json!(2));
        let three = b.parameter(json!(3));
        let sum = b.task("add", &[two, three]);
        let product = b.task("multiply", &[sum, three]);
        b.finish(ResultExpr::node(product))
    }

    fn status_of(state: &ExecutionState, name: &str) -> NodeStatus {
        let node = state
            .graph
            .nodes()
            .find(|node| node.name == name)
            .unwrap_or_else(|| panic!("no node named {name}"));
        state.node_status(node.id).unwrap()
    }

    #[tokio::test]
    async fn chained_tasks_complete() {
        let state = runner()
            .dispatch(add_then_multiply(), WorkflowInputs::new())
            .await
            .unwrap();

        assert_eq!(state.status, WorkflowStatus::Completed);
        assert_eq!(state.get_node_output(NodeId::new(2)), Some(&json!(5)));
        assert_eq!(state.get_node_output(NodeId::new(3)), Some(&json!(15)));
        assert_eq!(state.final_result, Some(json!(15)));
        assert!(state.start_time.is_some());
        assert!(state.end_time.is_some());
        assert!(state.error.is_none());
    }

    #[tokio::test]
    async fn failing_task_fails_workflow_but_not_sibling() {
        let mut b = WorkflowDefinition::builder("mixed");
        let message = b.parameter(json!("boom"));
        let one = b.parameter(json!(1));
        let failing = b.task("fail", &[message]);
        let fine = b.task("identity", &[one]);
        let after = b.task("identity", &[fine]);
        let definition = b.finish(ResultExpr::node(after));

        let state = runner().dispatch(definition, WorkflowInputs::new()).await.unwrap();

        assert_eq!(state.status, WorkflowStatus::Failed);
        assert_eq!(state.node_status(failing), Some(NodeStatus::Failed));
        assert_eq!(state.node_status(fine), Some(NodeStatus::Completed));
        assert_eq!(state.node_status(after), Some(NodeStatus::New));
        let error = state.error.clone().unwrap();
        assert!(error.contains(&format!("node {failing}")), "{error}");
        assert!(error.contains("boom"), "{error}");
        assert_eq!(state.node(failing).unwrap().stderr, "boom\n");
        assert!(state.final_result.is_none());
    }

    #[tokio::test]
    async fn parallel_identities_feed_sum() {
        let mut b = WorkflowDefinition::builder("fan_in");
        let one = b.parameter(json!(1));
        let ids: Vec<NodeId> = (0..3).map(|_| b.task("identity", &[one])).collect();
        let items = b.list(&ids);
        let total = b.task("sum", &[items]);
        let definition = b.finish(ResultExpr::node(total));

        let state = runner().dispatch(definition, WorkflowInputs::new()).await.unwrap();
        assert_eq!(state.status, WorkflowStatus::Completed);
        assert_eq!(state.final_result, Some(json!(3)));
    }

    #[tokio::test]
    async fn inputs_and_lookups_resolve_inline() {
        let mut b = WorkflowDefinition::builder("lookups");
        let pair = b.input("pair");
        let sep = b.input("sep");
        let first = b.item(pair, 0_i64);
        let last = b.item(pair, -1_i64);
        let joined = b.task("concat", &[first, last]);
        b.keyword(joined, "sep", sep);
        let record = b.dict(&[("joined", joined), ("first", first)]);
        let definition = b.finish(ResultExpr::node(record));

        let inputs = WorkflowInputs::new()
            .with_arg(json!(["a", "b", "c"]))
            .with_kwarg("sep", json!("+"));
        let state = runner().dispatch(definition, inputs).await.unwrap();
        assert_eq!(state.status, WorkflowStatus::Completed);
        assert_eq!(state.final_result, Some(json!({"joined": "a+c", "first": "a"})));
    }

    #[tokio::test]
    async fn failed_lookup_fails_node() {
        let mut b = WorkflowDefinition::builder("bad_lookup");
        let value = b.parameter(json!({"a": 1}));
        let missing = b.attribute(value, "b");
        let definition = b.finish(ResultExpr::node(missing));

        let state = runner().dispatch(definition, WorkflowInputs::new()).await.unwrap();
        assert_eq!(state.status, WorkflowStatus::Failed);
        assert_eq!(state.node_status(missing), Some(NodeStatus::Failed));
        assert!(state.error.unwrap().contains("input resolution failed"));
    }

    #[tokio::test]
    async fn cancel_before_start_cancels_every_node() {
        let runner = runner();
        let mut state = runner
            .prepare(add_then_multiply(), WorkflowInputs::new())
            .unwrap();
        runner.cancel(&state.dispatch_id);
        runner.run_workflow(&mut state).await.unwrap();

        assert_eq!(state.status, WorkflowStatus::Cancelled);
        assert!(
            state
                .nodes
                .values()
                .all(|record| record.status == NodeStatus::Cancelled)
        );
    }

    #[tokio::test]
    async fn cancel_mid_flight_lets_running_nodes_finish() {
        let (notifier, mut events) = ChannelNotifier::channel();
        let runner = runner()
            .with_notifier(notifier)
            .with_config(RunnerConfig {
                max_workers: 1,
                ..RunnerConfig::default()
            });

        let mut b = WorkflowDefinition::builder("slow");
        let ms = b.parameter(json!(100));
        let sleepers: Vec<NodeId> = (0..3).map(|_| b.task("sleep", &[ms])).collect();
        let tail = b.task("identity", &[sleepers[0]]);
        let definition = b.finish(ResultExpr::node(tail));

        let mut state = runner.prepare(definition, WorkflowInputs::new()).unwrap();
        let dispatch_id = state.dispatch_id.clone();
        let signals = runner.signals().clone();
        let watcher = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let StatusEvent::NodeStatusChanged {
                    status: NodeStatus::Running,
                    node_id,
                    ..
                } = event
                {
                    if node_id != NodeId::new(0) {
                        signals.cancel(&dispatch_id);
                        break;
                    }
                }
            }
        });

        runner.run_workflow(&mut state).await.unwrap();
        watcher.await.unwrap();

        let statuses: Vec<NodeStatus> = sleepers
            .iter()
            .map(|&id| state.node_status(id).unwrap())
            .collect();
        assert_eq!(
            statuses.iter().filter(|&&s| s == NodeStatus::Completed).count(),
            1
        );
        assert_eq!(
            statuses.iter().filter(|&&s| s == NodeStatus::Cancelled).count(),
            2
        );
        assert_eq!(state.node_status(tail), Some(NodeStatus::Cancelled));
        assert_eq!(state.status, WorkflowStatus::Cancelled);
    }

    fn nested_definition() -> WorkflowDefinition {
        let mut b = WorkflowDefinition::builder("double");
        let x = b.input("x");
        let doubled = b.task("add", &[x, x]);
        b.finish(ResultExpr::node(doubled))
    }

    #[tokio::test]
    async fn sublattice_runs_nested_dispatch() {
        let mut b = WorkflowDefinition::builder("outer");
        let four = b.parameter(json!(4));
        let nested = b.sublattice(nested_definition(), &[four]);
        let plus_one = b.parameter(json!(1));
        let total = b.task("add", &[nested, plus_one]);
        let definition = b.finish(ResultExpr::node(total));

        let runner = runner();
        let state = runner.dispatch(definition, WorkflowInputs::new()).await.unwrap();
        assert_eq!(state.status, WorkflowStatus::Completed);
        assert_eq!(state.final_result, Some(json!(9)));

        let record = state.node(nested).unwrap();
        let inner = record.nested.as_deref().unwrap();
        assert_eq!(inner.root_dispatch_id, state.root_dispatch_id);
        assert_eq!(inner.dispatch_id.parent(), Some(state.dispatch_id.clone()));
        assert_eq!(record.output, inner.final_result);
        assert_eq!(inner.final_result, Some(json!(8)));

        let stored = runner.store().load(&inner.dispatch_id).await.unwrap();
        assert_eq!(stored.status, WorkflowStatus::Completed);
    }

    #[tokio::test]
    async fn sublattice_requires_dispatcher_postprocessing() {
        let inner = WorkflowDefinition {
            metadata: crate::definition::WorkflowMetadata {
                workflow_executor: WorkflowExecutor::Client,
                ..Default::default()
            },
            ..nested_definition()
        };
        let mut b = WorkflowDefinition::builder("outer");
        let four = b.parameter(json!(4));
        let nested = b.sublattice(inner, &[four]);
        let definition = b.finish(ResultExpr::node(nested));

        let state = runner().dispatch(definition, WorkflowInputs::new()).await.unwrap();
        assert_eq!(state.status, WorkflowStatus::Failed);
        assert!(state.error.unwrap().contains("sublattice dispatch failed"));
    }

    #[tokio::test]
    async fn client_postprocessing_is_deferred() {
        let definition = WorkflowDefinition {
            metadata: crate::definition::WorkflowMetadata {
                workflow_executor: WorkflowExecutor::Client,
                ..Default::default()
            },
            ..add_then_multiply()
        };
        let runner = runner();
        let mut state = runner.dispatch(definition, WorkflowInputs::new()).await.unwrap();
        assert_eq!(state.status, WorkflowStatus::PendingPostprocessing);
        assert!(state.final_result.is_none());

        runner.postprocess(&mut state).await.unwrap();
        assert_eq!(state.status, WorkflowStatus::Completed);
        assert_eq!(state.final_result, Some(json!(15)));
        assert!(runner.postprocess(&mut state).await.is_err());
    }

    #[tokio::test]
    async fn unknown_executor_fails_node() {
        let mut b = WorkflowDefinition::builder("gpu");
        let one = b.parameter(json!(1));
        let task = b.task_on("gpu", "identity", &[one]);
        let definition = b.finish(ResultExpr::node(task));

        let state = runner().dispatch(definition, WorkflowInputs::new()).await.unwrap();
        assert_eq!(state.status, WorkflowStatus::Failed);
        let error = state.node(task).unwrap().error.clone().unwrap();
        assert!(error.contains("executor 'gpu'"), "{error}");
    }

    #[tokio::test]
    async fn unknown_function_fails_node() {
        let mut b = WorkflowDefinition::builder("missing");
        let task = b.task("nope", &[]);
        let definition = b.finish(ResultExpr::node(task));

        let state = runner().dispatch(definition, WorkflowInputs::new()).await.unwrap();
        assert_eq!(state.status, WorkflowStatus::Failed);
        assert!(state.error.unwrap().contains("function 'nope'"));
    }

    #[tokio::test]
    async fn job_executor_runs_and_cancels() {
        let executors = ExecutorRegistry::with_local(2).with_job("jobs", BackgroundJobExecutor::new(2));
        let runner = Runner::new(FunctionRegistry::with_builtins(), executors).with_config(
            RunnerConfig {
                poll_interval_ms: 5,
                ..RunnerConfig::default()
            },
        );

        let mut b = WorkflowDefinition::builder("jobs").executor("jobs");
        let five = b.parameter(json!(5));
        let three = b.parameter(json!(3));
        let product = b.task("multiply", &[five, three]);
        let definition = b.finish(ResultExpr::node(product));
        let state = runner.dispatch(definition, WorkflowInputs::new()).await.unwrap();
        assert_eq!(state.final_result, Some(json!(15)));

        let mut b = WorkflowDefinition::builder("slow_job").executor("jobs");
        let ms = b.parameter(json!(500));
        let slow = b.task("sleep", &[ms]);
        let definition = b.finish(ResultExpr::node(slow));
        let mut state = runner.prepare(definition, WorkflowInputs::new()).unwrap();
        let dispatch_id = state.dispatch_id.clone();
        let signals = runner.signals().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            signals.cancel(&dispatch_id);
        });
        runner.run_workflow(&mut state).await.unwrap();
        assert_eq!(state.node_status(slow), Some(NodeStatus::Cancelled));
        assert_eq!(state.status, WorkflowStatus::Cancelled);
    }

    #[tokio::test]
    async fn resume_skips_completed_nodes() {
        let runner = runner();
        let mut state = runner
            .prepare(add_then_multiply(), WorkflowInputs::new())
            .unwrap();
        // Simulate a crash after the add node finished with a stale value.
        for node_id in [0, 1] {
            state
                .update_node(NodeId::new(node_id), NodeUpdate::running())
                .unwrap();
        }
        state
            .update_node(NodeId::new(0), NodeUpdate::completed(json!(2)))
            .unwrap();
        state
            .update_node(NodeId::new(1), NodeUpdate::completed(json!(3)))
            .unwrap();
        state
            .update_node(NodeId::new(2), NodeUpdate::completed(json!(100)))
            .unwrap();
        state.status = WorkflowStatus::Running;

        runner.run_workflow(&mut state).await.unwrap();
        assert_eq!(state.status, WorkflowStatus::Completed);
        assert_eq!(state.get_node_output(NodeId::new(2)), Some(&json!(100)));
        assert_eq!(state.final_result, Some(json!(300)));
    }

    #[tokio::test]
    async fn setup_failure_is_executor_config_error() {
        struct Broken;

        #[async_trait]
        impl Executor for Broken {
            async fn setup(&self, _metadata: &TaskMetadata) -> Result<(), String> {
                Err("no gpu".to_string())
            }

            async fn run(
                &self,
                _function: Arc<dyn crate::function::TaskFunction>,
                _args: CallArgs,
                _metadata: &TaskMetadata,
            ) -> Result<TaskOutput, TaskFailure> {
                unreachable!("run after failed setup")
            }
        }

        let executors = ExecutorRegistry::new().with_direct(LOCAL_EXECUTOR, Broken);
        let runner = Runner::new(FunctionRegistry::with_builtins(), executors);
        let definition = add_then_multiply();
        let state = runner.dispatch(definition, WorkflowInputs::new()).await.unwrap();

        assert_eq!(state.status, WorkflowStatus::Failed);
        assert_eq!(status_of(&state, "add"), NodeStatus::Failed);
        assert!(state.error.unwrap().contains("no gpu"));
    }

    #[tokio::test]
    async fn missing_dependency_output_aborts_dispatch() {
        let runner = runner();
        let mut state = runner
            .prepare(add_then_multiply(), WorkflowInputs::new())
            .unwrap();
        // Layer 0 claims to be done but recorded no outputs.
        for node_id in [0, 1] {
            state.nodes.get_mut(&NodeId::new(node_id)).unwrap().status = NodeStatus::Completed;
        }

        let err = runner.execute(&mut state).await.unwrap_err();
        assert!(err.to_string().contains("no output record"), "{err}");
        assert_eq!(state.status, WorkflowStatus::Failed);
        let stored = runner.store().load(&state.dispatch_id).await.unwrap();
        assert_eq!(stored.status, WorkflowStatus::Failed);
    }

    #[tokio::test]
    async fn parent_cancel_reaches_running_sublattice() {
        let mut inner = WorkflowDefinition::builder("nap");
        let ms = inner.input("ms");
        let nap = inner.task("sleep", &[ms]);
        let after = inner.task("identity", &[nap]);
        let inner = inner.finish(ResultExpr::node(after));

        let mut b = WorkflowDefinition::builder("outer");
        let ms = b.parameter(json!(200));
        let nested = b.sublattice(inner, &[ms]);
        let tail = b.task("identity", &[nested]);
        let definition = b.finish(ResultExpr::node(tail));

        let runner = runner();
        let mut state = runner.prepare(definition, WorkflowInputs::new()).unwrap();
        let dispatch_id = state.dispatch_id.clone();
        let signals = runner.signals().clone();
        let canceller = dispatch_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            signals.cancel(&canceller);
        });
        runner.run_workflow(&mut state).await.unwrap();

        assert_eq!(state.status, WorkflowStatus::Cancelled);
        assert_eq!(state.node_status(nested), Some(NodeStatus::Cancelled));
        assert_eq!(state.node_status(tail), Some(NodeStatus::Cancelled));

        let inner_state = state.node(nested).unwrap().nested.as_deref().unwrap();
        assert_eq!(inner_state.status, WorkflowStatus::Cancelled);
        assert_eq!(inner_state.node_status(nap), Some(NodeStatus::Completed));
        assert_eq!(inner_state.node_status(after), Some(NodeStatus::Cancelled));

        let stored = runner
            .store()
            .load(&sublattice::nested_id(&dispatch_id, nested))
            .await
            .unwrap();
        assert_eq!(stored.status, WorkflowStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancelled_resume_settles_stale_running_nodes() {
        let runner = runner();
        let mut state = runner
            .prepare(add_then_multiply(), WorkflowInputs::new())
            .unwrap();
        // The previous process stopped while the add node was running.
        for (node_id, value) in [(0, 2), (1, 3)] {
            state
                .update_node(NodeId::new(node_id), NodeUpdate::running())
                .unwrap();
            state
                .update_node(NodeId::new(node_id), NodeUpdate::completed(json!(value)))
                .unwrap();
        }
        state
            .update_node(NodeId::new(2), NodeUpdate::running())
            .unwrap();
        state.status = WorkflowStatus::Running;

        runner.cancel(&state.dispatch_id);
        runner.run_workflow(&mut state).await.unwrap();

        assert_eq!(state.status, WorkflowStatus::Cancelled);
        assert_eq!(state.node_status(NodeId::new(2)), Some(NodeStatus::Cancelled));
        assert_eq!(state.node_status(NodeId::new(3)), Some(NodeStatus::Cancelled));
        assert!(state.error.is_none());
    }

    #[tokio::test]
    async fn nested_abort_is_recorded_on_nested_state() {
        let mut b = WorkflowDefinition::builder("outer");
        let four = b.parameter(json!(4));
        let nested = b.sublattice(nested_definition(), &[four]);
        let definition = b.finish(ResultExpr::node(nested));

        let runner = runner();
        let mut state = runner.prepare(definition, WorkflowInputs::new()).unwrap();

        // A saved nested run whose input node claims completion without output.
        let nested_dispatch = sublattice::nested_id(&state.dispatch_id, nested);
        let mut saved = ExecutionState::with_root(
            nested_dispatch.clone(),
            state.root_dispatch_id.clone(),
            nested_definition(),
            WorkflowInputs::new().with_arg(json!(4)),
        )
        .unwrap();
        saved.nodes.get_mut(&NodeId::new(0)).unwrap().status = NodeStatus::Completed;
        saved.status = WorkflowStatus::Running;
        runner.store().persist(&saved).await.unwrap();

        let err = runner.execute(&mut state).await.unwrap_err();
        assert!(err.to_string().contains("no output record"), "{err}");
        assert_eq!(state.status, WorkflowStatus::Failed);

        let stored = runner.store().load(&nested_dispatch).await.unwrap();
        assert_eq!(stored.status, WorkflowStatus::Failed);
        assert!(stored.error.is_some());
    }
}
