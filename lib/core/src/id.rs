//! Dispatch identifiers.
//!
//! A top-level dispatch is identified by a ULID (Universally Unique
//! Lexicographically Sortable Identifier) rendered as `dsp_<ulid>`. Nested
//! sublattice dispatches append the id of the graph node that spawned them,
//! so `dsp_01H...:3:1` is node 1 of the workflow dispatched by node 3 of the
//! top-level run. The hierarchy can be navigated from the id alone.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

/// Prefix used for top-level dispatch ids.
const PREFIX: &str = "dsp";

/// Separator between a parent dispatch id and a nested node id.
const NESTED_SEPARATOR: char = ':';

/// Error returned when parsing an ID from a string fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseIdError {
    /// The type of ID that failed to parse.
    pub id_type: &'static str,
    /// The reason for the parse failure.
    pub reason: String,
}

impl fmt::Display for ParseIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to parse {}: {}", self.id_type, self.reason)
    }
}

impl std::error::Error for ParseIdError {}

/// Unique identifier for one execution run of a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DispatchId {
    root: Ulid,
    path: Vec<u32>,
}

impl DispatchId {
    /// Creates a new top-level dispatch ID with a randomly generated ULID.
    #[must_use]
    pub fn new() -> Self {
        Self::from_ulid(Ulid::new())
    }

    /// Creates a top-level dispatch ID from a ULID.
    #[must_use]
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self {
            root: ulid,
            path: Vec::new(),
        }
    }

    /// Returns the id of the dispatch spawned by `node_id` of this dispatch.
    #[must_use]
    pub fn nested(&self, node_id: u32) -> Self {
        let mut path = self.path.clone();
        path.push(node_id);
        Self {
            root: self.root,
            path,
        }
    }

    /// Returns the id of the top-level dispatch this one belongs to.
    #[must_use]
    pub fn root(&self) -> Self {
        Self::from_ulid(self.root)
    }

    /// Returns the parent dispatch id, or `None` for a top-level dispatch.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        let (_, parent_path) = self.path.split_last()?;
        Some(Self {
            root: self.root,
            path: parent_path.to_vec(),
        })
    }

    /// Returns the node id in the parent dispatch that spawned this one.
    #[must_use]
    pub fn parent_node(&self) -> Option<u32> {
        self.path.last().copied()
    }

    /// Returns the nesting depth (0 for a top-level dispatch).
    #[must_use]
    pub fn depth(&self) -> usize {
        self.path.len()
    }

    /// Returns true if `self` is `other` or nested (at any depth) below it.
    #[must_use]
    pub fn is_within(&self, other: &Self) -> bool {
        self.root == other.root && self.path.starts_with(&other.path)
    }
}

impl Default for DispatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DispatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{PREFIX}_{}", self.root)?;
        for node_id in &self.path {
            write!(f, "{NESTED_SEPARATOR}{node_id}")?;
        }
        Ok(())
    }
}

impl FromStr for DispatchId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse_error = |reason: String| ParseIdError {
            id_type: "DispatchId",
            reason,
        };

        let mut segments = s.split(NESTED_SEPARATOR);
        let root_str = segments.next().unwrap_or_default();
        // Accept both `dsp_<ulid>` and a raw ULID.
        let ulid_str = root_str
            .strip_prefix(PREFIX)
            .and_then(|rest| rest.strip_prefix('_'))
            .unwrap_or(root_str);
        let root = Ulid::from_str(ulid_str).map_err(|e| parse_error(e.to_string()))?;

        let path = segments
            .map(|segment| {
                segment
                    .parse::<u32>()
                    .map_err(|e| parse_error(format!("invalid node segment '{segment}': {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { root, path })
    }
}

impl Serialize for DispatchId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DispatchId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl From<Ulid> for DispatchId {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}
