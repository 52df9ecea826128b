//! Workflow node types.
//!
//! Every node in a workflow graph carries an explicit [`NodeKind`] fixed when
//! the graph is built. The kind decides how the runner treats the node:
//!
//! - `Task` nodes call a registered function through an executor
//! - `Sublattice` nodes dispatch a nested workflow
//! - every other kind is a pseudo-node resolved inline by the scheduler

use crate::definition::WorkflowDefinition;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

/// A node identifier, dense from 0 within one graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(u32);

impl NodeId {
    /// Creates a node ID from its raw index.
    #[must_use]
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the raw index.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the index as a `usize` for slice and petgraph lookups.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for NodeId {
    fn from(index: u32) -> Self {
        Self(index)
    }
}

/// Key used by an `ItemAccess` node.
///
/// Integer keys index arrays (negative values count from the end); string
/// keys look up object members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ItemKey {
    /// Array index.
    Index(i64),
    /// Object member name.
    Key(String),
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(index) => write!(f, "[{index}]"),
            Self::Key(key) => write!(f, "[{key:?}]"),
        }
    }
}

impl From<i64> for ItemKey {
    fn from(index: i64) -> Self {
        Self::Index(index)
    }
}

impl From<&str> for ItemKey {
    fn from(key: &str) -> Self {
        Self::Key(key.to_string())
    }
}

/// What a node does when the runner reaches it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    /// Calls a registered task function through an executor.
    Task {
        /// Name of the function in the function registry.
        function: String,
    },
    /// A literal value substituted for a function call.
    Parameter {
        /// The literal value.
        value: JsonValue,
    },
    /// Member lookup on the single dependency's output.
    Attribute {
        /// Member name.
        attribute: String,
    },
    /// Index or key lookup on the single dependency's output.
    ItemAccess {
        /// The index or key.
        key: ItemKey,
    },
    /// Gathers dependency outputs into a list, in edge order.
    ListCollect,
    /// Gathers dependency outputs into an object keyed by edge name.
    DictCollect,
    /// Dispatches a nested workflow with the node's resolved inputs.
    Sublattice {
        /// The nested workflow body.
        definition: Box<WorkflowDefinition>,
    },
}

impl NodeKind {
    /// Returns true for kinds the scheduler resolves inline, without an executor.
    #[must_use]
    pub fn is_inline(&self) -> bool {
        matches!(
            self,
            Self::Parameter { .. }
                | Self::Attribute { .. }
                | Self::ItemAccess { .. }
                | Self::ListCollect
                | Self::DictCollect
        )
    }

    /// Short label for logs and default node names.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Task { .. } => "task",
            Self::Parameter { .. } => "parameter",
            Self::Attribute { .. } => "attribute",
            Self::ItemAccess { .. } => "item_access",
            Self::ListCollect => "list_collect",
            Self::DictCollect => "dict_collect",
            Self::Sublattice { .. } => "sublattice",
        }
    }
}

/// A node in a workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Stable id assigned at build time.
    pub id: NodeId,
    /// Human-readable name.
    pub name: String,
    /// What the node does.
    pub kind: NodeKind,
    /// Executor override for this node, if any.
    pub executor: Option<String>,
}

impl Node {
    /// Creates a node without an executor override.
    #[must_use]
    pub fn new(id: NodeId, name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id,
            name: name.into(),
            kind,
            executor: None,
        }
    }

    /// Sets the executor override.
    #[must_use]
    pub fn with_executor(mut self, executor: impl Into<String>) -> Self {
        self.executor = Some(executor.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_kinds() {
        assert!(NodeKind::Parameter { value: JsonValue::Null }.is_inline());
        assert!(NodeKind::ListCollect.is_inline());
        assert!(
            !NodeKind::Task {
                function: "add".to_string()
            }
            .is_inline()
        );
    }

    #[test]
    fn node_kind_serde_is_tagged() {
        let kind = NodeKind::ItemAccess {
            key: ItemKey::Index(-1),
        };
        let json = serde_json::to_value(&kind).expect("serialize");
        assert_eq!(json["type"], "item_access");
        assert_eq!(json["key"], -1);

        let parsed: NodeKind = serde_json::from_value(serde_json::json!({
            "type": "item_access",
            "key": "name"
        }))
        .expect("deserialize");
        assert_eq!(
            parsed,
            NodeKind::ItemAccess {
                key: ItemKey::Key("name".to_string())
            }
        );
    }

    #[test]
    fn node_builder() {
        let node = Node::new(
            NodeId::new(2),
            "add",
            NodeKind::Task {
                function: "add".to_string(),
            },
        )
        .with_executor("remote");
        assert_eq!(node.id.index(), 2);
        assert_eq!(node.executor.as_deref(), Some("remote"));
    }
}
