//! Workflow definition types.
//!
//! A workflow definition is the user-authored computation:
//! - Declared parameters and metadata (executors, post-processing mode)
//! - Node and edge specs, with node ids being indices into `nodes`
//! - A result expression evaluated once every node has an output
//!
//! A definition is immutable once built into a [`WorkflowGraph`]; caller
//! inputs are substituted into the bound parameter nodes at that point.

use crate::edge::Edge;
use crate::error::DefinitionError;
use crate::graph::WorkflowGraph;
use crate::node::{ItemKey, NodeId, NodeKind};
use rootcause::prelude::{Report, ResultExt};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

/// Where workflow-level post-processing runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowExecutor {
    /// The dispatcher evaluates the result as soon as all nodes complete.
    #[default]
    Dispatcher,
    /// The run stops at PENDING_POSTPROCESSING and the caller post-processes.
    Client,
}

/// Declared metadata for a workflow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowMetadata {
    /// Default executor for task nodes without their own.
    #[serde(default)]
    pub executor: Option<String>,
    /// Where post-processing runs.
    #[serde(default)]
    pub workflow_executor: WorkflowExecutor,
    /// Dependency specs the executors must provide (opaque to the engine).
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// One node of a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Human-readable name.
    pub name: String,
    /// What the node does.
    pub kind: NodeKind,
    /// Executor override.
    #[serde(default)]
    pub executor: Option<String>,
    /// Workflow parameter whose input replaces this parameter node's value.
    #[serde(default)]
    pub binding: Option<String>,
}

/// One edge of a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeSpec {
    /// Index of the source node.
    pub source: NodeId,
    /// Index of the target node.
    pub target: NodeId,
    /// How the value is passed.
    #[serde(flatten)]
    pub edge: Edge,
}

/// The post-processing body of a workflow.
///
/// Evaluated in order with every `Node` reference replaced by that node's
/// output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResultExpr {
    /// The output of a node.
    Node { node: NodeId },
    /// A constant.
    Literal { value: JsonValue },
    /// A list of sub-expressions.
    List { items: Vec<ResultExpr> },
    /// An object of sub-expressions.
    Dict { entries: BTreeMap<String, ResultExpr> },
}

impl ResultExpr {
    /// References a node's output.
    #[must_use]
    pub fn node(node: NodeId) -> Self {
        Self::Node { node }
    }

    /// Returns every node the expression references, in evaluation order.
    #[must_use]
    pub fn referenced_nodes(&self) -> Vec<NodeId> {
        let mut nodes = Vec::new();
        self.collect_nodes(&mut nodes);
        nodes
    }

    fn collect_nodes(&self, nodes: &mut Vec<NodeId>) {
        match self {
            Self::Node { node } => nodes.push(*node),
            Self::Literal { .. } => {}
            Self::List { items } => items.iter().for_each(|item| item.collect_nodes(nodes)),
            Self::Dict { entries } => entries.values().for_each(|entry| entry.collect_nodes(nodes)),
        }
    }

    /// Evaluates the expression against node outputs.
    ///
    /// # Errors
    ///
    /// Returns `DefinitionError::UnresolvedOutput` for the first referenced
    /// node `output_of` has no value for.
    pub fn evaluate<F>(&self, output_of: &F) -> Result<JsonValue, DefinitionError>
    where
        F: Fn(NodeId) -> Option<JsonValue>,
    {
        match self {
            Self::Node { node } => {
                output_of(*node).ok_or(DefinitionError::UnresolvedOutput { node_id: *node })
            }
            Self::Literal { value } => Ok(value.clone()),
            Self::List { items } => items
                .iter()
                .map(|item| item.evaluate(output_of))
                .collect::<Result<Vec<_>, _>>()
                .map(JsonValue::Array),
            Self::Dict { entries } => entries
                .iter()
                .map(|(key, entry)| Ok((key.clone(), entry.evaluate(output_of)?)))
                .collect::<Result<serde_json::Map<_, _>, _>>()
                .map(JsonValue::Object),
        }
    }
}

impl Default for ResultExpr {
    fn default() -> Self {
        Self::Literal {
            value: JsonValue::Null,
        }
    }
}

/// Caller inputs for one dispatch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInputs {
    /// Positional inputs, bound to parameters in declaration order.
    #[serde(default)]
    pub args: Vec<JsonValue>,
    /// Keyword inputs, bound by parameter name.
    #[serde(default)]
    pub kwargs: BTreeMap<String, JsonValue>,
}

impl WorkflowInputs {
    /// Creates empty inputs.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a positional input.
    #[must_use]
    pub fn with_arg(mut self, value: JsonValue) -> Self {
        self.args.push(value);
        self
    }

    /// Sets a keyword input.
    #[must_use]
    pub fn with_kwarg(mut self, name: impl Into<String>, value: JsonValue) -> Self {
        self.kwargs.insert(name.into(), value);
        self
    }
}

/// A complete workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Workflow name.
    pub name: String,
    /// Declared parameter names, in positional order.
    #[serde(default)]
    pub parameters: Vec<String>,
    /// Declared metadata.
    #[serde(default)]
    pub metadata: WorkflowMetadata,
    /// Node specs; a node's id is its index.
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
    /// Edge specs.
    #[serde(default)]
    pub edges: Vec<EdgeSpec>,
    /// Post-processing body.
    #[serde(default)]
    pub output: ResultExpr,
}

impl WorkflowDefinition {
    /// Starts building a definition.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> DefinitionBuilder {
        DefinitionBuilder::new(name)
    }

    /// Parses a serialized (JSON) definition.
    ///
    /// # Errors
    ///
    /// Returns `DefinitionError::Malformed` if the document doesn't parse.
    pub fn from_json(raw: &str) -> Result<Self, Report<DefinitionError>> {
        serde_json::from_str(raw).map_err(|e| {
            DefinitionError::Malformed {
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Binds caller inputs to the declared parameters.
    ///
    /// Positional inputs bind first, in declaration order; keyword inputs
    /// fill the rest.
    ///
    /// # Errors
    ///
    /// Returns an error for too many positional inputs, unknown or duplicate
    /// keywords, or a parameter left without a value.
    pub fn bind_inputs(
        &self,
        inputs: &WorkflowInputs,
    ) -> Result<BTreeMap<String, JsonValue>, Report<DefinitionError>> {
        if inputs.args.len() > self.parameters.len() {
            return Err(DefinitionError::TooManyArguments {
                expected: self.parameters.len(),
                got: inputs.args.len(),
            }
            .into());
        }

        let mut bound: BTreeMap<String, JsonValue> = self
            .parameters
            .iter()
            .cloned()
            .zip(inputs.args.iter().cloned())
            .collect();

        for (name, value) in &inputs.kwargs {
            if !self.parameters.contains(name) {
                return Err(DefinitionError::UnknownParameter { name: name.clone() }.into());
            }
            if bound.insert(name.clone(), value.clone()).is_some() {
                return Err(DefinitionError::DuplicateInput { name: name.clone() }.into());
            }
        }

        if let Some(missing) = self.parameters.iter().find(|p| !bound.contains_key(*p)) {
            return Err(DefinitionError::MissingInput {
                name: missing.clone(),
            }
            .into());
        }

        Ok(bound)
    }

    /// Builds the graph of one workflow instance.
    ///
    /// # Errors
    ///
    /// Returns an error if inputs don't bind, a binding sits on a non-parameter
    /// node, an edge or the result references an unknown node, or the nodes
    /// don't form a DAG.
    pub fn build_graph(&self, inputs: &WorkflowInputs) -> Result<WorkflowGraph, Report<DefinitionError>> {
        let bound = self.bind_inputs(inputs)?;
        let mut graph = WorkflowGraph::new();

        for (index, spec) in self.nodes.iter().enumerate() {
            let node_id = NodeId::new(index as u32);
            let kind = match (&spec.binding, &spec.kind) {
                (None, kind) => kind.clone(),
                (Some(parameter), NodeKind::Parameter { .. }) => {
                    let value = bound.get(parameter).cloned().ok_or_else(|| {
                        DefinitionError::UnknownParameter {
                            name: parameter.clone(),
                        }
                    })?;
                    NodeKind::Parameter { value }
                }
                (Some(parameter), _) => {
                    return Err(DefinitionError::InvalidBinding {
                        node_id,
                        parameter: parameter.clone(),
                    }
                    .into());
                }
            };
            graph.add_node(spec.name.clone(), kind, spec.executor.clone());
        }

        let count = self.nodes.len() as u32;
        let check = |node_id: NodeId| {
            if node_id.as_u32() < count {
                Ok(())
            } else {
                Err(DefinitionError::InvalidNodeReference {
                    index: node_id.as_u32(),
                })
            }
        };

        for spec in &self.edges {
            check(spec.source)?;
            check(spec.target)?;
            graph
                .add_edge(spec.source, spec.target, spec.edge.clone())
                .context(DefinitionError::InvalidGraph {
                    workflow: self.name.clone(),
                })?;
        }
        for node_id in self.output.referenced_nodes() {
            check(node_id)?;
        }

        graph
            .topological_layers()
            .context(DefinitionError::InvalidGraph {
                workflow: self.name.clone(),
            })?;

        Ok(graph)
    }
}

/// Programmatic construction of a [`WorkflowDefinition`].
///
/// Each node method returns the new node's id for wiring later nodes.
#[derive(Debug, Clone)]
pub struct DefinitionBuilder {
    definition: WorkflowDefinition,
}

impl DefinitionBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            definition: WorkflowDefinition {
                name: name.into(),
                parameters: Vec::new(),
                metadata: WorkflowMetadata::default(),
                nodes: Vec::new(),
                edges: Vec::new(),
                output: ResultExpr::default(),
            },
        }
    }

    /// Sets the default executor.
    #[must_use]
    pub fn executor(mut self, executor: impl Into<String>) -> Self {
        self.definition.metadata.executor = Some(executor.into());
        self
    }

    /// Sets where post-processing runs.
    #[must_use]
    pub fn workflow_executor(mut self, workflow_executor: WorkflowExecutor) -> Self {
        self.definition.metadata.workflow_executor = workflow_executor;
        self
    }

    /// Adds a dependency spec.
    #[must_use]
    pub fn dependency(mut self, dependency: impl Into<String>) -> Self {
        self.definition.metadata.dependencies.push(dependency.into());
        self
    }

    /// Declares a workflow parameter and returns the node carrying its input.
    pub fn input(&mut self, name: impl Into<String>) -> NodeId {
        let name = name.into();
        self.definition.parameters.push(name.clone());
        self.push(NodeSpec {
            name: name.clone(),
            kind: NodeKind::Parameter {
                value: JsonValue::Null,
            },
            executor: None,
            binding: Some(name),
        })
    }

    /// Adds a literal value.
    pub fn parameter(&mut self, value: JsonValue) -> NodeId {
        self.plain("parameter", NodeKind::Parameter { value })
    }

    /// Adds a task call with positional arguments.
    pub fn task(&mut self, function: impl Into<String>, args: &[NodeId]) -> NodeId {
        let function = function.into();
        let node = self.plain(function.clone(), NodeKind::Task { function });
        self.positional(node, args);
        node
    }

    /// Adds a task call pinned to an executor.
    pub fn task_on(
        &mut self,
        executor: impl Into<String>,
        function: impl Into<String>,
        args: &[NodeId],
    ) -> NodeId {
        let node = self.task(function, args);
        self.definition.nodes[node.index()].executor = Some(executor.into());
        node
    }

    /// Passes `source` to `target` as keyword argument `name`.
    pub fn keyword(&mut self, target: NodeId, name: impl Into<String>, source: NodeId) {
        self.edge(source, target, Edge::keyword(name));
    }

    /// Adds a member lookup on `source`.
    pub fn attribute(&mut self, source: NodeId, attribute: impl Into<String>) -> NodeId {
        let attribute = attribute.into();
        let node = self.plain(
            format!("attribute {attribute}"),
            NodeKind::Attribute { attribute },
        );
        self.edge(source, node, Edge::positional());
        node
    }

    /// Adds an index or key lookup on `source`.
    pub fn item(&mut self, source: NodeId, key: impl Into<ItemKey>) -> NodeId {
        let key = key.into();
        let node = self.plain(format!("item {key}"), NodeKind::ItemAccess { key });
        self.edge(source, node, Edge::positional());
        node
    }

    /// Collects outputs into a list.
    pub fn list(&mut self, items: &[NodeId]) -> NodeId {
        let node = self.plain("list", NodeKind::ListCollect);
        for &item in items {
            self.edge(item, node, Edge::collection(None));
        }
        node
    }

    /// Collects outputs into an object.
    pub fn dict(&mut self, entries: &[(&str, NodeId)]) -> NodeId {
        let node = self.plain("dict", NodeKind::DictCollect);
        for &(key, value) in entries {
            self.edge(value, node, Edge::collection(Some(key.to_string())));
        }
        node
    }

    /// Adds a nested workflow call with positional arguments.
    pub fn sublattice(&mut self, definition: WorkflowDefinition, args: &[NodeId]) -> NodeId {
        let node = self.plain(
            definition.name.clone(),
            NodeKind::Sublattice {
                definition: Box::new(definition),
            },
        );
        self.positional(node, args);
        node
    }

    /// Finishes the definition with its result expression.
    #[must_use]
    pub fn finish(mut self, output: ResultExpr) -> WorkflowDefinition {
        self.definition.output = output;
        self.definition
    }

    fn plain(&mut self, name: impl Into<String>, kind: NodeKind) -> NodeId {
        self.push(NodeSpec {
            name: name.into(),
            kind,
            executor: None,
            binding: None,
        })
    }

    fn push(&mut self, spec: NodeSpec) -> NodeId {
        let id = NodeId::new(self.definition.nodes.len() as u32);
        self.definition.nodes.push(spec);
        id
    }

    fn positional(&mut self, target: NodeId, args: &[NodeId]) {
        for &arg in args {
            self.edge(arg, target, Edge::positional());
        }
    }

    fn edge(&mut self, source: NodeId, target: NodeId, edge: Edge) {
        self.definition.edges.push(EdgeSpec {
            source,
            target,
            edge,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn arithmetic() -> WorkflowDefinition {
        let mut b = WorkflowDefinition::builder("arithmetic");
        let x = b.input("x");
        let y = b.input("y");
        let sum = b.task("add", &[x, y]);
        let three = b.parameter(json!(3));
        let product = b.task("multiply", &[sum, three]);
        b.finish(ResultExpr::node(product))
    }

    #[test]
    fn bind_positional_then_keyword() {
        let definition = arithmetic();
        let inputs = WorkflowInputs::new()
            .with_arg(json!(2))
            .with_kwarg("y", json!(3));
        let bound = definition.bind_inputs(&inputs).unwrap();
        assert_eq!(bound["x"], json!(2));
        assert_eq!(bound["y"], json!(3));
    }

    #[test]
    fn bind_rejects_bad_inputs() {
        let definition = arithmetic();

        let missing = WorkflowInputs::new().with_arg(json!(2));
        assert!(definition.bind_inputs(&missing).is_err());

        let duplicate = WorkflowInputs::new()
            .with_arg(json!(2))
            .with_kwarg("x", json!(3));
        assert!(definition.bind_inputs(&duplicate).is_err());

        let unknown = WorkflowInputs::new()
            .with_arg(json!(2))
            .with_arg(json!(3))
            .with_kwarg("z", json!(4));
        assert!(definition.bind_inputs(&unknown).is_err());

        let too_many = WorkflowInputs::new()
            .with_arg(json!(1))
            .with_arg(json!(2))
            .with_arg(json!(3));
        assert!(definition.bind_inputs(&too_many).is_err());
    }

    #[test]
    fn build_graph_substitutes_inputs() {
        let graph = arithmetic()
            .build_graph(&WorkflowInputs::new().with_arg(json!(2)).with_arg(json!(5)))
            .unwrap();
        assert_eq!(graph.node_count(), 5);
        assert_eq!(graph.edge_count(), 4);
        assert_eq!(
            graph.node(NodeId::new(1)).unwrap().kind,
            NodeKind::Parameter { value: json!(5) }
        );
        assert_eq!(
            graph.dependencies_of(NodeId::new(4)),
            vec![NodeId::new(2), NodeId::new(3)]
        );
    }

    #[test]
    fn binding_on_task_is_rejected() {
        let mut definition = arithmetic();
        definition.nodes[2].binding = Some("x".to_string());
        let inputs = WorkflowInputs::new().with_arg(json!(1)).with_arg(json!(1));
        assert!(definition.build_graph(&inputs).is_err());
    }

    #[test]
    fn unknown_edge_reference_is_rejected() {
        let mut definition = arithmetic();
        definition.edges.push(EdgeSpec {
            source: NodeId::new(0),
            target: NodeId::new(42),
            edge: Edge::positional(),
        });
        let inputs = WorkflowInputs::new().with_arg(json!(1)).with_arg(json!(1));
        let err = definition.build_graph(&inputs).unwrap_err();
        assert!(err.to_string().contains("undefined node 42"));
    }

    #[test]
    fn cyclic_definition_is_rejected() {
        let mut b = WorkflowDefinition::builder("loop");
        let a = b.task("identity", &[]);
        let c = b.task("identity", &[a]);
        let mut definition = b.finish(ResultExpr::node(c));
        definition.edges.push(EdgeSpec {
            source: c,
            target: a,
            edge: Edge::positional(),
        });
        assert!(definition.build_graph(&WorkflowInputs::new()).is_err());
    }

    #[test]
    fn builder_wires_lookups_and_collections() {
        let mut b = WorkflowDefinition::builder("shapes").executor("local");
        let record = b.parameter(json!({"items": [1, 2, 3]}));
        let items = b.attribute(record, "items");
        let last = b.item(items, -1_i64);
        let both = b.list(&[last, items]);
        let named = b.dict(&[("last", last)]);
        let pinned = b.task_on("jobs", "identity", &[named]);
        b.keyword(pinned, "extra", both);
        let definition = b.finish(ResultExpr::node(pinned));

        assert_eq!(definition.metadata.executor.as_deref(), Some("local"));
        assert_eq!(definition.nodes[pinned.index()].executor.as_deref(), Some("jobs"));
        assert_eq!(
            definition.edges.last().unwrap().edge,
            Edge::keyword("extra")
        );
        let graph = definition.build_graph(&WorkflowInputs::new()).unwrap();
        assert_eq!(graph.topological_layers().unwrap().len(), 5);
    }

    #[test]
    fn evaluate_replaces_node_references() {
        let expr = ResultExpr::Dict {
            entries: BTreeMap::from([
                ("total".to_string(), ResultExpr::node(NodeId::new(1))),
                (
                    "parts".to_string(),
                    ResultExpr::List {
                        items: vec![
                            ResultExpr::node(NodeId::new(0)),
                            ResultExpr::Literal { value: json!("x") },
                        ],
                    },
                ),
            ]),
        };
        let outputs = |id: NodeId| Some(json!(id.as_u32() * 10));
        assert_eq!(
            expr.evaluate(&outputs).unwrap(),
            json!({"total": 10, "parts": [0, "x"]})
        );

        let none = |_: NodeId| None;
        assert_eq!(
            expr.evaluate(&none),
            Err(DefinitionError::UnresolvedOutput {
                node_id: NodeId::new(0)
            })
        );
    }

    #[test]
    fn definition_json_roundtrip_rebuilds_same_graph() {
        let definition = arithmetic();
        let raw = serde_json::to_string(&definition).unwrap();
        let parsed = WorkflowDefinition::from_json(&raw).unwrap();
        assert_eq!(parsed, definition);

        let inputs = WorkflowInputs::new().with_arg(json!(2)).with_arg(json!(3));
        let original = definition.build_graph(&inputs).unwrap();
        let rebuilt = parsed.build_graph(&inputs).unwrap();
        assert_eq!(original, rebuilt);
        assert_eq!(
            original.topological_layers().unwrap(),
            rebuilt.topological_layers().unwrap()
        );
    }

    #[test]
    fn malformed_json_is_rejected() {
        let err = WorkflowDefinition::from_json("{not json").unwrap_err();
        assert!(err.to_string().contains("malformed workflow definition"));
    }
}
