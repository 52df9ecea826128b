//! Workflow execution state.
//!
//! One [`ExecutionState`] exists per dispatch. It owns the dispatch's graph
//! and tracks:
//! - Overall workflow status, inputs, final result and error
//! - One [`NodeRecord`] per graph node
//! - Nested execution states of sublattice nodes
//!
//! The runner driving the dispatch is the only writer; once the workflow is
//! terminal the state is read-only.

use crate::cancellation::CancellationRegistry;
use crate::definition::{WorkflowDefinition, WorkflowInputs};
use crate::error::{DefinitionError, StateError};
use crate::graph::WorkflowGraph;
use crate::node::NodeId;
use chrono::{DateTime, Utc};
use rootcause::prelude::Report;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;
use strata_core::DispatchId;

/// The execution status of a single node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    /// Not started.
    #[default]
    New,
    /// Executing.
    Running,
    /// Finished with an output.
    Completed,
    /// Finished with an error.
    Failed,
    /// Never executed, or its job was cancelled.
    Cancelled,
}

impl NodeStatus {
    /// Returns true if this is a terminal status.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns the canonical upper-case name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The overall status of a dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    /// Created, not started.
    #[default]
    New,
    /// Layers are executing.
    Running,
    /// All nodes completed and the result was evaluated.
    Completed,
    /// At least one node failed, or the dispatch aborted.
    Failed,
    /// Cancelled with no failed node.
    Cancelled,
    /// Evaluating the result expression.
    Postprocessing,
    /// All nodes completed; waiting for the caller to post-process.
    PendingPostprocessing,
    /// The result expression could not be evaluated.
    PostprocessingFailed,
}

impl WorkflowStatus {
    /// Returns true if this is a terminal status.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::PostprocessingFailed
        )
    }

    /// Returns true once the dispatcher has nothing more to do for this run.
    ///
    /// Unlike [`is_terminal`](Self::is_terminal) this includes runs parked
    /// for client-side post-processing.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.is_terminal() || *self == Self::PendingPostprocessing
    }

    /// Returns the canonical upper-case name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Postprocessing => "POSTPROCESSING",
            Self::PendingPostprocessing => "PENDING_POSTPROCESSING",
            Self::PostprocessingFailed => "POSTPROCESSING_FAILED",
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution record of one node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Current status.
    pub status: NodeStatus,
    /// When the node started.
    pub start_time: Option<DateTime<Utc>>,
    /// When the node reached a terminal status.
    pub end_time: Option<DateTime<Utc>>,
    /// Output value, once completed.
    pub output: Option<JsonValue>,
    /// Formatted error text, once failed.
    pub error: Option<String>,
    /// Captured standard output.
    #[serde(default)]
    pub stdout: String,
    /// Captured standard error.
    #[serde(default)]
    pub stderr: String,
    /// Execution state of the nested workflow, for sublattice nodes.
    #[serde(default)]
    pub nested: Option<Box<ExecutionState>>,
}

/// A partial update to a [`NodeRecord`]; only the set fields are merged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeUpdate {
    pub status: Option<NodeStatus>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub output: Option<JsonValue>,
    pub error: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub nested: Option<Box<ExecutionState>>,
}

impl NodeUpdate {
    /// Marks the node RUNNING, starting now.
    #[must_use]
    pub fn running() -> Self {
        Self {
            status: Some(NodeStatus::Running),
            start_time: Some(Utc::now()),
            ..Self::default()
        }
    }

    /// Marks the node COMPLETED with an output, ending now.
    #[must_use]
    pub fn completed(output: JsonValue) -> Self {
        Self {
            status: Some(NodeStatus::Completed),
            end_time: Some(Utc::now()),
            output: Some(output),
            ..Self::default()
        }
    }

    /// Marks the node FAILED with error text, ending now.
    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Some(NodeStatus::Failed),
            end_time: Some(Utc::now()),
            error: Some(error.into()),
            ..Self::default()
        }
    }

    /// Marks the node CANCELLED, ending now.
    #[must_use]
    pub fn cancelled() -> Self {
        Self {
            status: Some(NodeStatus::Cancelled),
            end_time: Some(Utc::now()),
            ..Self::default()
        }
    }

    /// Sets the captured streams.
    #[must_use]
    pub fn with_streams(mut self, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        self.stdout = Some(stdout.into());
        self.stderr = Some(stderr.into());
        self
    }

    /// Attaches a nested execution state.
    #[must_use]
    pub fn with_nested(mut self, nested: ExecutionState) -> Self {
        self.nested = Some(Box::new(nested));
        self
    }
}

impl NodeRecord {
    /// Merges an update into the record.
    ///
    /// Returns `Ok(false)` when the record is already terminal and the update
    /// repeats the same status (or carries none); the record is left as is.
    ///
    /// # Errors
    ///
    /// Returns `StateError::InvalidTransition` if a terminal record is asked
    /// to move to a different status.
    pub fn apply(&mut self, node_id: NodeId, update: NodeUpdate) -> Result<bool, StateError> {
        if self.status.is_terminal() {
            return match update.status {
                Some(to) if to != self.status => Err(StateError::InvalidTransition {
                    node_id,
                    from: self.status,
                    to,
                }),
                _ => Ok(false),
            };
        }

        let NodeUpdate {
            status,
            start_time,
            end_time,
            output,
            error,
            stdout,
            stderr,
            nested,
        } = update;

        if let Some(status) = status {
            self.status = status;
        }
        if start_time.is_some() {
            self.start_time = start_time;
        }
        if end_time.is_some() {
            self.end_time = end_time;
        }
        if output.is_some() {
            self.output = output;
        }
        if error.is_some() {
            self.error = error;
        }
        if let Some(stdout) = stdout {
            self.stdout = stdout;
        }
        if let Some(stderr) = stderr {
            self.stderr = stderr;
        }
        if nested.is_some() {
            self.nested = nested;
        }
        Ok(true)
    }
}

/// The durable execution record of one dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    /// This dispatch.
    pub dispatch_id: DispatchId,
    /// The top-level dispatch (self for top-level runs).
    pub root_dispatch_id: DispatchId,
    /// Overall status.
    pub status: WorkflowStatus,
    /// Caller inputs.
    pub inputs: WorkflowInputs,
    /// Evaluated result, once post-processed.
    pub final_result: Option<JsonValue>,
    /// When the run started.
    pub start_time: Option<DateTime<Utc>>,
    /// When the run reached a terminal status.
    pub end_time: Option<DateTime<Utc>>,
    /// Workflow-level error text.
    pub error: Option<String>,
    /// The definition the graph was built from.
    pub definition: WorkflowDefinition,
    /// The graph of this workflow instance.
    pub graph: WorkflowGraph,
    /// Per-node records, ordered by node id.
    pub nodes: BTreeMap<NodeId, NodeRecord>,
}

impl ExecutionState {
    /// Creates the state of a top-level dispatch, status NEW.
    ///
    /// # Errors
    ///
    /// Returns an error if the definition can't be built with these inputs.
    pub fn new(
        dispatch_id: DispatchId,
        definition: WorkflowDefinition,
        inputs: WorkflowInputs,
    ) -> Result<Self, Report<DefinitionError>> {
        let root_dispatch_id = dispatch_id.root();
        Self::with_root(dispatch_id, root_dispatch_id, definition, inputs)
    }

    /// Creates the state of a dispatch under an explicit root.
    ///
    /// # Errors
    ///
    /// Returns an error if the definition can't be built with these inputs.
    pub fn with_root(
        dispatch_id: DispatchId,
        root_dispatch_id: DispatchId,
        definition: WorkflowDefinition,
        inputs: WorkflowInputs,
    ) -> Result<Self, Report<DefinitionError>> {
        let graph = definition.build_graph(&inputs)?;
        let mut state = Self {
            dispatch_id,
            root_dispatch_id,
            status: WorkflowStatus::New,
            inputs,
            final_result: None,
            start_time: None,
            end_time: None,
            error: None,
            definition,
            graph,
            nodes: BTreeMap::new(),
        };
        state.initialize_nodes();
        Ok(state)
    }

    /// Creates one NEW record per graph node that has none yet.
    pub fn initialize_nodes(&mut self) {
        for node in self.graph.nodes() {
            self.nodes.entry(node.id).or_default();
        }
    }

    /// Returns a node's record.
    #[must_use]
    pub fn node(&self, node_id: NodeId) -> Option<&NodeRecord> {
        self.nodes.get(&node_id)
    }

    /// Returns a node's status.
    #[must_use]
    pub fn node_status(&self, node_id: NodeId) -> Option<NodeStatus> {
        self.nodes.get(&node_id).map(|record| record.status)
    }

    /// Merges an update into a node's record.
    ///
    /// Returns whether the record changed. Repeating a terminal write is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the node has no record, or if a terminal record
    /// would change status.
    pub fn update_node(&mut self, node_id: NodeId, update: NodeUpdate) -> Result<bool, StateError> {
        self.nodes
            .get_mut(&node_id)
            .ok_or(StateError::NodeNotFound { node_id })?
            .apply(node_id, update)
    }

    /// Derives the workflow status from the node statuses.
    ///
    /// FAILED if any node failed; otherwise CANCELLED if any was cancelled;
    /// otherwise COMPLETED if all completed; otherwise RUNNING.
    #[must_use]
    pub fn aggregate_status(&self) -> WorkflowStatus {
        let statuses = || self.nodes.values().map(|record| record.status);
        if statuses().any(|s| s == NodeStatus::Failed) {
            WorkflowStatus::Failed
        } else if statuses().any(|s| s == NodeStatus::Cancelled) {
            WorkflowStatus::Cancelled
        } else if statuses().all(|s| s == NodeStatus::Completed) {
            WorkflowStatus::Completed
        } else {
            WorkflowStatus::Running
        }
    }

    /// Returns the output of a completed node.
    #[must_use]
    pub fn get_node_output(&self, node_id: NodeId) -> Option<&JsonValue> {
        self.nodes
            .get(&node_id)
            .filter(|record| record.status == NodeStatus::Completed)
            .and_then(|record| record.output.as_ref())
    }

    /// Returns the outputs of every completed node.
    #[must_use]
    pub fn get_all_node_outputs(&self) -> BTreeMap<NodeId, JsonValue> {
        self.nodes
            .keys()
            .filter_map(|&id| Some((id, self.get_node_output(id)?.clone())))
            .collect()
    }

    /// Returns the failed node with the lowest id.
    #[must_use]
    pub fn first_failure(&self) -> Option<(NodeId, &NodeRecord)> {
        self.nodes
            .iter()
            .find(|(_, record)| record.status == NodeStatus::Failed)
            .map(|(&id, record)| (id, record))
    }

    /// Formats the workflow error naming the first failed node.
    #[must_use]
    pub fn failure_message(&self) -> Option<String> {
        let (node_id, record) = self.first_failure()?;
        let name = self
            .graph
            .node(node_id)
            .map_or("<unknown>", |node| node.name.as_str());
        let error = record.error.as_deref().unwrap_or("unknown error");
        Some(format!("node {node_id} ({name}) failed: {error}"))
    }

    /// Sets the cancellation signal for this dispatch.
    ///
    /// Node statuses are left alone; the runner marks them on its next check.
    pub fn cancel(&self, signals: &CancellationRegistry) {
        signals.cancel(&self.dispatch_id);
    }

    /// Returns true once the workflow status is terminal.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
