//! Node input resolution.
//!
//! Dependency outputs are gathered along a node's incoming edges and either
//! turned into call arguments for a task, or folded into a value inline for
//! parameter, lookup and collection nodes.

use crate::edge::{Edge, ParamType};
use crate::error::{DispatchError, NodeError};
use crate::execution::ExecutionState;
use crate::function::CallArgs;
use crate::node::{ItemKey, NodeId, NodeKind};
use rootcause::prelude::Report;
use serde_json::{Map, Value as JsonValue};

/// Collects the output of every dependency of `node_id`, in edge order.
///
/// # Errors
///
/// Returns `DispatchError::MissingDependencyRecord` if a dependency has no
/// completed output. The runner only schedules a node after its dependencies
/// completed, so this is an integrity violation.
pub fn gather(
    state: &ExecutionState,
    node_id: NodeId,
) -> Result<Vec<(Edge, JsonValue)>, Report<DispatchError>> {
    state
        .graph
        .incoming_edges(node_id)
        .into_iter()
        .map(|(source, edge)| match state.get_node_output(source) {
            Some(value) => Ok((edge.clone(), value.clone())),
            None => Err(DispatchError::MissingDependencyRecord {
                dispatch_id: state.dispatch_id.clone(),
                node_id,
                dependency: source,
            }
            .into()),
        })
        .collect()
}

/// Splits gathered inputs into positional and keyword arguments.
///
/// Named collection edges become keywords; unnamed ones are positional.
#[must_use]
pub fn call_args(inputs: Vec<(Edge, JsonValue)>) -> CallArgs {
    let mut args = CallArgs::default();
    for (edge, value) in inputs {
        match (edge.param_type, edge.name) {
            (ParamType::Keyword | ParamType::CollectionKey, Some(name)) => {
                args.kwargs.insert(name, value);
            }
            _ => args.args.push(value),
        }
    }
    args
}

/// Computes the value of an inline node from its gathered inputs.
///
/// # Errors
///
/// Returns `NodeError::InputResolution` if a lookup misses, a lookup node
/// doesn't have exactly one input, or a dict entry has no key. Task and
/// sublattice kinds are not inline and are rejected the same way.
pub fn resolve_inline(
    kind: &NodeKind,
    inputs: Vec<(Edge, JsonValue)>,
) -> Result<JsonValue, NodeError> {
    match kind {
        NodeKind::Parameter { value } => Ok(value.clone()),
        NodeKind::Attribute { attribute } => {
            let source = single_input(inputs, kind)?;
            source.get(attribute).cloned().ok_or_else(|| NodeError::InputResolution {
                reason: format!("value has no attribute '{attribute}'"),
            })
        }
        NodeKind::ItemAccess { key } => {
            let source = single_input(inputs, kind)?;
            lookup(&source, key)
        }
        NodeKind::ListCollect => Ok(JsonValue::Array(
            inputs.into_iter().map(|(_, value)| value).collect(),
        )),
        NodeKind::DictCollect => {
            let mut entries = Map::new();
            for (edge, value) in inputs {
                let Some(name) = edge.name else {
                    return Err(NodeError::InputResolution {
                        reason: "dict entry without a key".to_string(),
                    });
                };
                entries.insert(name, value);
            }
            Ok(JsonValue::Object(entries))
        }
        NodeKind::Task { .. } | NodeKind::Sublattice { .. } => Err(NodeError::InputResolution {
            reason: format!("{} nodes are not resolved inline", kind.label()),
        }),
    }
}

fn single_input(inputs: Vec<(Edge, JsonValue)>, kind: &NodeKind) -> Result<JsonValue, NodeError> {
    let count = inputs.len();
    let mut values = inputs.into_iter().map(|(_, value)| value);
    match (values.next(), count) {
        (Some(value), 1) => Ok(value),
        _ => Err(NodeError::InputResolution {
            reason: format!("{} node needs exactly one input, got {count}", kind.label()),
        }),
    }
}

/// Index or key lookup. Negative indices count from the end of an array.
fn lookup(source: &JsonValue, key: &ItemKey) -> Result<JsonValue, NodeError> {
    let found = match (source, key) {
        (JsonValue::Array(items), ItemKey::Index(index)) => {
            let len = items.len() as i64;
            let position = if *index < 0 { len + index } else { *index };
            usize::try_from(position).ok().and_then(|i| items.get(i))
        }
        (JsonValue::Object(entries), ItemKey::Key(name)) => entries.get(name),
        (JsonValue::Object(entries), ItemKey::Index(index)) => entries.get(&index.to_string()),
        _ => None,
    };
    found.cloned().ok_or_else(|| NodeError::InputResolution {
        reason: format!("no item {key} in value"),
    })
}
