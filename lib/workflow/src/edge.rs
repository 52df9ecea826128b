//! Workflow edge types.
//!
//! An edge wires the output of its source node into one argument of its
//! target node. The parameter type decides how the argument is passed.

use serde::{Deserialize, Serialize};

/// How a dependency output is passed to the target node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    /// Appended to the positional arguments, in edge order.
    Positional,
    /// Passed as a keyword argument named by the edge.
    Keyword,
    /// Becomes an entry of a collection node, keyed by the edge name.
    CollectionKey,
}

/// An edge connecting a source node's output to a target node argument.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    /// How the value is passed.
    pub param_type: ParamType,
    /// Argument or collection key name (required for keyword edges).
    pub name: Option<String>,
}

impl Edge {
    /// Creates a positional edge.
    #[must_use]
    pub fn positional() -> Self {
        Self {
            param_type: ParamType::Positional,
            name: None,
        }
    }

    /// Creates a keyword edge.
    #[must_use]
    pub fn keyword(name: impl Into<String>) -> Self {
        Self {
            param_type: ParamType::Keyword,
            name: Some(name.into()),
        }
    }

    /// Creates a collection entry edge.
    ///
    /// `ListCollect` targets ignore the key; `DictCollect` targets require it.
    #[must_use]
    pub fn collection(key: Option<String>) -> Self {
        Self {
            param_type: ParamType::CollectionKey,
            name: key,
        }
    }
}
