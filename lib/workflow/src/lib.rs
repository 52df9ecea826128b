//! Workflow orchestration engine for strata.
//!
//! This crate provides the dispatch engine, including:
//!
//! - **Definitions**: Workflows as node and edge specs with a result expression
//! - **Graph Model**: Directed graphs using petgraph, layered topologically
//! - **Execution**: Per-dispatch state with one record per node
//! - **Executors**: Direct and job-handle backends behind a named registry
//! - **Runner**: Layer-by-layer scheduling with cancellation and sublattices
//! - **Front end**: Submission, query and cancellation of background dispatches

pub mod cancellation;
pub mod config;
pub mod definition;
pub mod edge;
pub mod error;
pub mod execution;
pub mod executor;
pub mod function;
pub mod graph;
pub mod job;
pub mod node;
pub mod notify;
pub mod resolve;
pub mod runner;
pub mod service;
pub mod store;
pub mod sublattice;

pub use cancellation::CancellationRegistry;
pub use config::RunnerConfig;
pub use definition::{
    DefinitionBuilder, ResultExpr, WorkflowDefinition, WorkflowExecutor, WorkflowInputs,
    WorkflowMetadata,
};
pub use edge::{Edge, ParamType};
pub use error::{DefinitionError, DispatchError, GraphError, NodeError, StateError, StoreError};
pub use execution::{ExecutionState, NodeRecord, NodeStatus, NodeUpdate, WorkflowStatus};
pub use executor::{Executor, ExecutorHandle, ExecutorRegistry, JobExecutor, LocalExecutor};
pub use function::{CallArgs, FunctionRegistry, Streams, TaskFunction};
pub use graph::WorkflowGraph;
pub use job::BackgroundJobExecutor;
pub use node::{ItemKey, Node, NodeId, NodeKind};
pub use notify::{ChannelNotifier, NoopNotifier, Notifier, StatusEvent, TracingNotifier};
pub use runner::Runner;
pub use service::Dispatcher;
pub use store::{FileStore, MemoryStore, StateStore};
