use thiserror::Error;

use crate::graph::NodeId;

pub use anyhow::Error as ElementError;

/// Configuration errors found while turning a graph into tasks.
///
/// These never reach the tick: they are returned from the scheduling call
/// that asked for the compilation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("Graph '{graph}' contains a cycle through node '{node}'")]
    Cycle { graph: String, node: String },

    #[error("Graph '{graph}' embeds itself as a static subgraph")]
    RecursiveSubgraph { graph: String },

    #[error("Graph '{graph}' has an edge referencing unknown node {node:?}")]
    UnknownNode { graph: String, node: NodeId },
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Couldn't compile graph.\n{0}")]
    Compile(#[from] CompileError),

    #[error("Component '{0}' has no graph to schedule")]
    MissingGraph(String),

    #[error("Couldn't build worker pool.\n{0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("Executor still has {0} task(s) in flight")]
    NotIdle(usize),
}
