//! Submission, query and cancellation front end.
//!
//! [`Dispatcher`] runs each dispatch on its own tokio task and answers
//! queries from the runner's store. Waiters are released through a `watch`
//! channel once the run settles.

use crate::definition::{WorkflowDefinition, WorkflowInputs};
use crate::error::DispatchError;
use crate::execution::{ExecutionState, WorkflowStatus};
use crate::node::NodeId;
use crate::runner::Runner;
use rootcause::prelude::{Report, ResultExt};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use strata_core::DispatchId;
use tokio::sync::watch;
use tracing::{info, instrument};

/// Runs dispatches in the background and serves their state.
#[derive(Debug)]
pub struct Dispatcher {
    runner: Arc<Runner>,
    runs: Mutex<HashMap<DispatchId, watch::Receiver<bool>>>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(runner: Runner) -> Self {
        Self {
            runner: Arc::new(runner),
            runs: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn runner(&self) -> &Runner {
        &self.runner
    }

    /// Validates and persists a new dispatch, then starts it.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::InvalidDefinition` if the definition can't be
    /// bound to the inputs, or a store error if it can't be persisted.
    #[instrument(skip_all, fields(workflow = %definition.name))]
    pub async fn submit(
        &self,
        definition: WorkflowDefinition,
        inputs: WorkflowInputs,
    ) -> Result<DispatchId, Report<DispatchError>> {
        let state = self.runner.prepare(definition, inputs)?;
        let dispatch_id = state.dispatch_id.clone();
        self.runner
            .store()
            .persist(&state)
            .await
            .context(DispatchError::Store {
                dispatch_id: dispatch_id.clone(),
            })?;
        info!(%dispatch_id, "dispatch submitted");
        self.spawn(state);
        Ok(dispatch_id)
    }

    /// Submits a serialized (JSON) definition.
    ///
    /// # Errors
    ///
    /// As [`submit`](Self::submit); a document that doesn't parse is an
    /// invalid definition.
    pub async fn submit_json(
        &self,
        raw: &str,
        inputs: WorkflowInputs,
    ) -> Result<DispatchId, Report<DispatchError>> {
        let definition =
            WorkflowDefinition::from_json(raw).context(DispatchError::InvalidDefinition)?;
        self.submit(definition, inputs).await
    }

    /// Returns the current status of a dispatch.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::NotFound` if the dispatch is not stored.
    pub async fn get_status(
        &self,
        dispatch_id: &DispatchId,
    ) -> Result<WorkflowStatus, Report<DispatchError>> {
        Ok(self.load(dispatch_id).await?.status)
    }

    /// Returns a snapshot of a dispatch.
    ///
    /// With `wait`, blocks until the top-level run this dispatch belongs to
    /// has settled.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::NotFound` if the dispatch is not stored.
    pub async fn get_result(
        &self,
        dispatch_id: &DispatchId,
        wait: bool,
    ) -> Result<ExecutionState, Report<DispatchError>> {
        if wait {
            let receiver = self.lock_runs().get(&dispatch_id.root()).cloned();
            if let Some(mut receiver) = receiver {
                // An error means the run task is gone; the store has the rest.
                let _ = receiver.wait_for(|settled| *settled).await;
            }
        }
        self.load(dispatch_id).await
    }

    /// Returns the output of a completed node.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::NotFound` if the dispatch is not stored.
    pub async fn get_node_output(
        &self,
        dispatch_id: &DispatchId,
        node_id: NodeId,
    ) -> Result<Option<JsonValue>, Report<DispatchError>> {
        Ok(self.load(dispatch_id).await?.get_node_output(node_id).cloned())
    }

    /// Requests cancellation of a dispatch and everything nested in it.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::NotFound` if the dispatch is not stored.
    pub async fn cancel(&self, dispatch_id: &DispatchId) -> Result<(), Report<DispatchError>> {
        self.load(dispatch_id).await?;
        self.runner.cancel(dispatch_id);
        Ok(())
    }

    /// Continues a stored dispatch that did not settle.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::InProgress` if it is running here,
    /// `DispatchError::AlreadyTerminal` if it has settled, and
    /// `DispatchError::NotFound` if it is not stored.
    pub async fn resume(&self, dispatch_id: &DispatchId) -> Result<(), Report<DispatchError>> {
        if self.is_running(dispatch_id) {
            return Err(DispatchError::InProgress {
                dispatch_id: dispatch_id.clone(),
            }
            .into());
        }
        let state = self.load(dispatch_id).await?;
        if state.status.is_settled() {
            return Err(DispatchError::AlreadyTerminal {
                dispatch_id: dispatch_id.clone(),
            }
            .into());
        }
        info!(%dispatch_id, status = %state.status, "resuming dispatch");
        self.spawn(state);
        Ok(())
    }

    /// Completes a dispatch parked in PENDING_POSTPROCESSING.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::InProgress` if it is running here,
    /// `DispatchError::AlreadyTerminal` if it has already finished,
    /// `DispatchError::NotAwaitingPostprocessing` for any other unsettled
    /// status, and `DispatchError::NotFound` if it is not stored.
    pub async fn postprocess(
        &self,
        dispatch_id: &DispatchId,
    ) -> Result<ExecutionState, Report<DispatchError>> {
        if self.is_running(dispatch_id) {
            return Err(DispatchError::InProgress {
                dispatch_id: dispatch_id.clone(),
            }
            .into());
        }
        let mut state = self.load(dispatch_id).await?;
        self.runner.postprocess(&mut state).await?;
        Ok(state)
    }

    /// Removes a settled dispatch and its nested states.
    ///
    /// Returns false if nothing was stored.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::InProgress` if the dispatch is still running.
    pub async fn delete(&self, dispatch_id: &DispatchId) -> Result<bool, Report<DispatchError>> {
        if self.is_running(dispatch_id) {
            return Err(DispatchError::InProgress {
                dispatch_id: dispatch_id.clone(),
            }
            .into());
        }
        let deleted = self
            .runner
            .store()
            .delete(dispatch_id)
            .await
            .context(DispatchError::Store {
                dispatch_id: dispatch_id.clone(),
            })?;
        self.lock_runs().remove(dispatch_id);
        self.runner.signals().release(dispatch_id);
        Ok(deleted)
    }

    fn spawn(&self, mut state: ExecutionState) {
        let (settled_tx, settled_rx) = watch::channel(false);
        self.lock_runs()
            .insert(state.dispatch_id.clone(), settled_rx);

        let runner = Arc::clone(&self.runner);
        tokio::spawn(async move {
            // Aborts are recorded on the state by `execute`.
            let _ = runner.execute(&mut state).await;
            runner.signals().release(&state.dispatch_id);
            settled_tx.send_replace(true);
        });
    }

    fn is_running(&self, dispatch_id: &DispatchId) -> bool {
        self.lock_runs()
            .get(&dispatch_id.root())
            .is_some_and(|settled| !*settled.borrow())
    }

    async fn load(&self, dispatch_id: &DispatchId) -> Result<ExecutionState, Report<DispatchError>> {
        Ok(self
            .runner
            .store()
            .load(dispatch_id)
            .await
            .context(DispatchError::NotFound {
                dispatch_id: dispatch_id.clone(),
            })?)
    }

    fn lock_runs(&self) -> MutexGuard<'_, HashMap<DispatchId, watch::Receiver<bool>>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
