//! Error types for the workflow crate.
//!
//! Errors are designed for layered context using rootcause:
//! - `GraphError`: Low-level graph operations (nodes, edges, layering)
//! - `DefinitionError`: Binding a workflow definition to its inputs
//! - `StateError`: Execution state record updates
//! - `StoreError`: Persistence collaborator failures
//! - `NodeError`: Per-node failures, recorded on the node and never propagated
//! - `DispatchError`: Dispatch-level failures (wraps lower errors via context)

use crate::execution::{NodeStatus, WorkflowStatus};
use crate::node::NodeId;
use strata_core::DispatchId;
use std::fmt;

/// Errors from graph operations.
///
/// These errors contain only information available at the graph layer.
/// Dispatch-level context should be added by the caller using `.context()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// Node with the given ID was not found in the graph.
    NodeNotFound { node_id: NodeId },
    /// Graph contains cycles; `remaining` lists the nodes that could not be layered.
    CycleDetected { remaining: Vec<NodeId> },
    /// A keyword edge was added without an argument name.
    MissingEdgeName { source: NodeId, target: NodeId },
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NodeNotFound { node_id } => write!(f, "node not found: {node_id}"),
            Self::CycleDetected { remaining } => {
                let ids: Vec<String> = remaining.iter().map(ToString::to_string).collect();
                write!(f, "graph contains cycles among nodes [{}]", ids.join(", "))
            }
            Self::MissingEdgeName { source, target } => {
                write!(f, "keyword edge {source} -> {target} has no argument name")
            }
        }
    }
}

impl std::error::Error for GraphError {}

/// Errors from binding a workflow definition to caller inputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DefinitionError {
    /// An edge or result expression references a node index that does not exist.
    InvalidNodeReference { index: u32 },
    /// A `binding` was set on a node that is not a parameter.
    InvalidBinding { node_id: NodeId, parameter: String },
    /// A binding names a parameter the workflow does not declare.
    UnknownParameter { name: String },
    /// A declared parameter received no value.
    MissingInput { name: String },
    /// A parameter received both a positional and a keyword value.
    DuplicateInput { name: String },
    /// More positional inputs than declared parameters.
    TooManyArguments { expected: usize, got: usize },
    /// The definition's graph is invalid (use as context wrapper).
    InvalidGraph { workflow: String },
    /// The serialized definition could not be parsed.
    Malformed { reason: String },
    /// The result expression references a node with no output.
    UnresolvedOutput { node_id: NodeId },
}

impl fmt::Display for DefinitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidNodeReference { index } => {
                write!(f, "reference to undefined node {index}")
            }
            Self::InvalidBinding { node_id, parameter } => {
                write!(
                    f,
                    "node {node_id} binds parameter '{parameter}' but is not a parameter node"
                )
            }
            Self::UnknownParameter { name } => write!(f, "unknown workflow parameter '{name}'"),
            Self::MissingInput { name } => write!(f, "missing input for parameter '{name}'"),
            Self::DuplicateInput { name } => {
                write!(f, "parameter '{name}' given both positionally and by keyword")
            }
            Self::TooManyArguments { expected, got } => {
                write!(f, "expected at most {expected} positional inputs, got {got}")
            }
            Self::InvalidGraph { workflow } => {
                write!(f, "workflow '{workflow}' does not form a valid graph")
            }
            Self::Malformed { reason } => write!(f, "malformed workflow definition: {reason}"),
            Self::UnresolvedOutput { node_id } => {
                write!(f, "result references node {node_id}, which has no output")
            }
        }
    }
}

impl std::error::Error for DefinitionError {}

/// Errors from execution state updates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    /// No record exists for the node.
    NodeNotFound { node_id: NodeId },
    /// A terminal record was asked to move to a different status.
    InvalidTransition {
        node_id: NodeId,
        from: NodeStatus,
        to: NodeStatus,
    },
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NodeNotFound { node_id } => write!(f, "no record for node {node_id}"),
            Self::InvalidTransition { node_id, from, to } => {
                write!(f, "invalid transition for node {node_id} from {from} to {to}")
            }
        }
    }
}

impl std::error::Error for StateError {}

/// Errors from the persistence collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// No state is stored for the dispatch.
    NotFound { dispatch_id: DispatchId },
    /// Reading or writing the backing storage failed.
    Io { message: String },
    /// A stored document could not be encoded or decoded.
    Serialization { message: String },
    /// A stored document uses an envelope version this build cannot read.
    UnsupportedVersion { version: u32 },
    /// The stored state refused the update.
    Rejected { reason: String },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { dispatch_id } => write!(f, "no stored state for {dispatch_id}"),
            Self::Io { message } => write!(f, "store i/o failed: {message}"),
            Self::Serialization { message } => write!(f, "store serialization failed: {message}"),
            Self::UnsupportedVersion { version } => {
                write!(f, "unsupported stored state version {version}")
            }
            Self::Rejected { reason } => write!(f, "store rejected update: {reason}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// A failure confined to one node.
///
/// The runner records the `Display` text on the node and marks it FAILED;
/// these errors never abort the dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    /// The task body itself failed or panicked.
    TaskRuntime { message: String },
    /// The node names a function missing from the function registry.
    FunctionNotRegistered { function: String },
    /// The executor reference is unknown or the executor could not be prepared.
    ExecutorConfig { executor: String, reason: String },
    /// An inline lookup or collection could not be resolved from its inputs.
    InputResolution { reason: String },
    /// A nested workflow could not be dispatched or did not complete.
    SublatticeDispatch { reason: String },
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TaskRuntime { message } => write!(f, "task raised: {message}"),
            Self::FunctionNotRegistered { function } => {
                write!(f, "function '{function}' is not registered")
            }
            Self::ExecutorConfig { executor, reason } => {
                write!(f, "executor '{executor}' unavailable: {reason}")
            }
            Self::InputResolution { reason } => write!(f, "input resolution failed: {reason}"),
            Self::SublatticeDispatch { reason } => {
                write!(f, "sublattice dispatch failed: {reason}")
            }
        }
    }
}

impl std::error::Error for NodeError {}

/// Dispatch-level errors.
///
/// Integrity violations abort the dispatch; the other variants are context
/// wrappers for lower-level errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// A dependency of a scheduled node has no completed output record.
    MissingDependencyRecord {
        dispatch_id: DispatchId,
        node_id: NodeId,
        dependency: NodeId,
    },
    /// The dispatch is already in a terminal state.
    AlreadyTerminal { dispatch_id: DispatchId },
    /// Post-processing was requested outside PENDING_POSTPROCESSING.
    NotAwaitingPostprocessing {
        dispatch_id: DispatchId,
        status: WorkflowStatus,
    },
    /// No dispatch with this id is known.
    NotFound { dispatch_id: DispatchId },
    /// The dispatch is still running.
    InProgress { dispatch_id: DispatchId },
    /// The workflow definition was rejected (use as context wrapper).
    InvalidDefinition,
    /// The graph could not be layered (use as context wrapper).
    Graph { dispatch_id: DispatchId },
    /// A state update failed (use as context wrapper).
    State { dispatch_id: DispatchId },
    /// The store rejected a write or read (use as context wrapper).
    Store { dispatch_id: DispatchId },
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingDependencyRecord {
                dispatch_id,
                node_id,
                dependency,
            } => write!(
                f,
                "dispatch {dispatch_id}: node {node_id} depends on node {dependency}, which has no output record"
            ),
            Self::AlreadyTerminal { dispatch_id } => {
                write!(f, "dispatch {dispatch_id} already finished")
            }
            Self::NotAwaitingPostprocessing {
                dispatch_id,
                status,
            } => write!(
                f,
                "dispatch {dispatch_id} is {status}, not awaiting post-processing"
            ),
            Self::NotFound { dispatch_id } => write!(f, "dispatch not found: {dispatch_id}"),
            Self::InProgress { dispatch_id } => {
                write!(f, "dispatch {dispatch_id} is still running")
            }
            Self::InvalidDefinition => write!(f, "workflow definition rejected"),
            Self::Graph { dispatch_id } => write!(f, "graph invalid for dispatch {dispatch_id}"),
            Self::State { dispatch_id } => {
                write!(f, "state update failed for dispatch {dispatch_id}")
            }
            Self::Store { dispatch_id } => {
                write!(f, "persistence failed for dispatch {dispatch_id}")
            }
        }
    }
}

impl std::error::Error for DispatchError {}
