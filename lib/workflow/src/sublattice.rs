//! Nested workflow dispatch.
//!
//! A sublattice node runs a whole workflow as one step of its parent. The
//! nested dispatch id is `parent:node`, and the nested state shares the
//! parent's root dispatch id.

use crate::definition::{WorkflowDefinition, WorkflowExecutor, WorkflowInputs};
use crate::error::NodeError;
use crate::execution::{ExecutionState, NodeUpdate, WorkflowStatus};
use crate::function::CallArgs;
use crate::node::NodeId;
use serde_json::Value as JsonValue;
use strata_core::DispatchId;

/// Builds the execution state of the workflow nested under `node_id`.
///
/// # Errors
///
/// Returns `NodeError::SublatticeDispatch` if the nested definition defers
/// post-processing to the client, or if it can't be bound to `args`.
pub fn build_nested(
    parent: &ExecutionState,
    node_id: NodeId,
    definition: &WorkflowDefinition,
    args: CallArgs,
) -> Result<ExecutionState, NodeError> {
    if definition.metadata.workflow_executor != WorkflowExecutor::Dispatcher {
        return Err(NodeError::SublatticeDispatch {
            reason: format!(
                "workflow '{}' must be post-processed by the dispatcher",
                definition.name
            ),
        });
    }

    let inputs = WorkflowInputs {
        args: args.args,
        kwargs: args.kwargs,
    };
    ExecutionState::with_root(
        nested_id(&parent.dispatch_id, node_id),
        parent.root_dispatch_id.clone(),
        definition.clone(),
        inputs,
    )
    .map_err(|report| NodeError::SublatticeDispatch {
        reason: report.to_string(),
    })
}

/// Dispatch id of the workflow nested under `node_id`.
#[must_use]
pub fn nested_id(parent: &DispatchId, node_id: NodeId) -> DispatchId {
    parent.nested(node_id.as_u32())
}

/// Turns a settled nested state into the update for its parent node.
///
/// The nested state is kept on the node for introspection.
#[must_use]
pub fn node_update(nested: ExecutionState) -> NodeUpdate {
    match nested.status {
        WorkflowStatus::Completed => {
            let output = nested.final_result.clone().unwrap_or(JsonValue::Null);
            NodeUpdate::completed(output).with_nested(nested)
        }
        WorkflowStatus::Cancelled => NodeUpdate::cancelled().with_nested(nested),
        status => {
            let reason = nested
                .error
                .clone()
                .unwrap_or_else(|| format!("nested dispatch ended {status}"));
            NodeUpdate::failed(NodeError::SublatticeDispatch { reason }.to_string())
                .with_nested(nested)
        }
    }
}
