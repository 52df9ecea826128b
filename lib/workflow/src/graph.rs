//! Workflow graph implementation using petgraph.
//!
//! A workflow instance is a directed acyclic graph where:
//! - Nodes are tasks or inline pseudo-operations, with ids dense from 0
//! - Edges wire a source node's output into one argument of the target
//!
//! Nodes are never removed, so a [`NodeId`] doubles as the petgraph
//! `NodeIndex` and no side lookup table is needed.

use crate::edge::{Edge, ParamType};
use crate::error::GraphError;
use crate::node::{Node, NodeId, NodeKind};
use petgraph::Direction;
use petgraph::graph::{DiGraph, EdgeIndex, NodeIndex};
use petgraph::visit::EdgeRef;
use serde::{Deserialize, Serialize};

/// A workflow graph using petgraph's directed graph.
#[derive(Debug, Clone, Default)]
pub struct WorkflowGraph {
    graph: DiGraph<Node, Edge>,
}

impl WorkflowGraph {
    /// Creates a new empty workflow graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node and returns its id, the next dense index.
    pub fn add_node(
        &mut self,
        name: impl Into<String>,
        kind: NodeKind,
        executor: Option<String>,
    ) -> NodeId {
        let id = NodeId::new(self.graph.node_count() as u32);
        let mut node = Node::new(id, name, kind);
        node.executor = executor;
        self.graph.add_node(node);
        id
    }

    /// Adds an edge from `source` into an argument of `target`.
    ///
    /// # Errors
    ///
    /// Returns an error if either node doesn't exist, or if a keyword edge
    /// has no argument name.
    pub fn add_edge(&mut self, source: NodeId, target: NodeId, edge: Edge) -> Result<(), GraphError> {
        self.ensure_node(source)?;
        self.ensure_node(target)?;
        if edge.param_type == ParamType::Keyword && edge.name.is_none() {
            return Err(GraphError::MissingEdgeName { source, target });
        }
        self.graph.add_edge(index(source), index(target), edge);
        Ok(())
    }

    /// Returns a node by id.
    #[must_use]
    pub fn node(&self, node_id: NodeId) -> Option<&Node> {
        self.graph.node_weight(index(node_id))
    }

    /// Returns a mutable node by id.
    pub fn node_mut(&mut self, node_id: NodeId) -> Option<&mut Node> {
        self.graph.node_weight_mut(index(node_id))
    }

    /// Returns all nodes in id order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.graph.node_weights()
    }

    /// Returns all edges as `(source, target, edge)` in insertion order.
    pub fn edges(&self) -> impl Iterator<Item = (NodeId, NodeId, &Edge)> {
        self.graph
            .edge_references()
            .map(|e| (node_id_of(e.source()), node_id_of(e.target()), e.weight()))
    }

    /// Returns the number of nodes in the graph.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Returns the number of edges in the graph.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Returns the incoming edges of a node as `(source, edge)`, in edge
    /// insertion order.
    ///
    /// Argument order for positional parameters and list collections follows
    /// this order.
    #[must_use]
    pub fn incoming_edges(&self, node_id: NodeId) -> Vec<(NodeId, &Edge)> {
        if self.node(node_id).is_none() {
            return Vec::new();
        }
        let mut edges: Vec<(EdgeIndex, NodeId, &Edge)> = self
            .graph
            .edges_directed(index(node_id), Direction::Incoming)
            .map(|e| (e.id(), node_id_of(e.source()), e.weight()))
            .collect();
        edges.sort_by_key(|(edge_index, _, _)| *edge_index);
        edges
            .into_iter()
            .map(|(_, source, edge)| (source, edge))
            .collect()
    }

    /// Returns the distinct nodes with an edge into `node_id`, in first-edge
    /// insertion order.
    #[must_use]
    pub fn dependencies_of(&self, node_id: NodeId) -> Vec<NodeId> {
        let mut dependencies = Vec::new();
        for (source, _) in self.incoming_edges(node_id) {
            if !dependencies.contains(&source) {
                dependencies.push(source);
            }
        }
        dependencies
    }

    /// Partitions the nodes into topological layers (Kahn's algorithm).
    ///
    /// Layer `k` holds exactly the nodes whose dependencies all sit in layers
    /// before `k`. Each layer is sorted by ascending node id.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::CycleDetected` listing the nodes left over once
    /// no further layer can be peeled.
    pub fn topological_layers(&self) -> Result<Vec<Vec<NodeId>>, GraphError> {
        let mut in_degree: Vec<usize> = self
            .graph
            .node_indices()
            .map(|idx| self.graph.edges_directed(idx, Direction::Incoming).count())
            .collect();

        let mut current: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|idx| in_degree[idx.index()] == 0)
            .collect();
        let mut layers = Vec::new();
        let mut placed = 0;

        while !current.is_empty() {
            let mut next = Vec::new();
            for &idx in &current {
                for edge in self.graph.edges_directed(idx, Direction::Outgoing) {
                    let target = edge.target();
                    in_degree[target.index()] -= 1;
                    if in_degree[target.index()] == 0 {
                        next.push(target);
                    }
                }
            }
            next.sort_unstable();
            placed += current.len();
            layers.push(current.into_iter().map(node_id_of).collect());
            current = next;
        }

        if placed < self.graph.node_count() {
            let remaining = self
                .graph
                .node_indices()
                .filter(|idx| in_degree[idx.index()] > 0)
                .map(node_id_of)
                .collect();
            return Err(GraphError::CycleDetected { remaining });
        }

        Ok(layers)
    }

    fn ensure_node(&self, node_id: NodeId) -> Result<(), GraphError> {
        self.node(node_id)
            .map(|_| ())
            .ok_or(GraphError::NodeNotFound { node_id })
    }
}

impl PartialEq for WorkflowGraph {
    fn eq(&self, other: &Self) -> bool {
        self.nodes().eq(other.nodes()) && self.edges().eq(other.edges())
    }
}

impl Serialize for WorkflowGraph {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        graph_serde::serialize(&self.graph, serializer)
    }
}

impl<'de> Deserialize<'de> for WorkflowGraph {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        graph_serde::deserialize(deserializer).map(|graph| Self { graph })
    }
}

fn index(node_id: NodeId) -> NodeIndex {
    NodeIndex::new(node_id.index())
}

fn node_id_of(idx: NodeIndex) -> NodeId {
    NodeId::new(idx.index() as u32)
}

/// Custom serde for petgraph DiGraph.
///
/// Serializes as `{nodes, edges}`; deserialization re-adds nodes in id order
/// so indices line up with ids again.
mod graph_serde {
    use super::*;
    use serde::de::Error as _;
    use serde::ser::SerializeStruct;

    #[derive(Serialize, Deserialize)]
    struct EdgeRecord {
        source: NodeId,
        target: NodeId,
        #[serde(flatten)]
        edge: Edge,
    }

    #[derive(Deserialize)]
    struct GraphRecord {
        #[serde(default)]
        nodes: Vec<Node>,
        #[serde(default)]
        edges: Vec<EdgeRecord>,
    }

    pub fn serialize<S>(graph: &DiGraph<Node, Edge>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let nodes: Vec<&Node> = graph.node_weights().collect();
        let edges: Vec<EdgeRecord> = graph
            .edge_references()
            .map(|e| EdgeRecord {
                source: node_id_of(e.source()),
                target: node_id_of(e.target()),
                edge: e.weight().clone(),
            })
            .collect();

        let mut state = serializer.serialize_struct("Graph", 2)?;
        state.serialize_field("nodes", &nodes)?;
        state.serialize_field("edges", &edges)?;
        state.end()
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DiGraph<Node, Edge>, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let GraphRecord { mut nodes, edges } = GraphRecord::deserialize(deserializer)?;
        nodes.sort_by_key(|node| node.id);

        let mut graph = DiGraph::new();
        for (position, node) in nodes.into_iter().enumerate() {
            if node.id.index() != position {
                return Err(D::Error::custom(format!(
                    "node ids must be dense from 0, found {} at position {position}",
                    node.id
                )));
            }
            graph.add_node(node);
        }

        let count = graph.node_count();
        for EdgeRecord { source, target, edge } in edges {
            if source.index() >= count || target.index() >= count {
                return Err(D::Error::custom(format!(
                    "edge {source} -> {target} references an unknown node"
                )));
            }
            graph.add_edge(index(source), index(target), edge);
        }

        Ok(graph)
    }
}
