#![forbid(unsafe_code)]
//! Task-graph execution engine for procedural content generation.
//!
//! A [`Graph`] of nodes, each carrying [`Settings`] that name an [`Element`],
//! is compiled into a flat list of tasks and scheduled on an [`Executor`].
//! The executor is driven by repeated calls to [`Executor::execute`]; each
//! call is one tick that promotes tasks whose dependencies completed and runs
//! them on a worker pool or on the driving thread. Element results are
//! memoized in a [`GraphCache`] keyed by element, input and settings.
//!
//! ```
//! use std::sync::Arc;
//! use pcg_executor::{
//!     Context, DataCollection, Element, Executor, ExecutorConfig, Graph, GraphComponent,
//!     Settings, TaggedData,
//! };
//!
//! struct Double;
//!
//! impl Element for Double {
//!     fn execute_internal(&self, ctx: &mut Context) -> anyhow::Result<bool> {
//!         for item in ctx.input_data.inputs() {
//!             if let Some(value) = item.downcast_ref::<u32>() {
//!                 ctx.output_data.push(TaggedData::new(value * 2));
//!             }
//!         }
//!         Ok(true)
//!     }
//! }
//!
//! let graph = Graph::new("doubling");
//! let double = graph.add_node("double", Settings::new(Double));
//! graph.add_edge(graph.input_node(), double);
//! graph.add_edge(double, graph.output_node());
//!
//! let input: DataCollection = [TaggedData::new(21u32)].into_iter().collect();
//! let component = Arc::new(GraphComponent::new("example", Arc::new(graph)).with_input(input));
//!
//! let mut executor = Executor::new(ExecutorConfig::inline()).unwrap();
//! let output = executor.schedule(component, &[]).unwrap();
//! assert!(executor.flush());
//!
//! let result = executor.output_data(output).unwrap();
//! assert_eq!(result.tagged_data[0].downcast_ref::<u32>(), Some(&42));
//! ```

mod cache;
mod compiler;
mod component;
mod config;
mod context;
mod core;
mod data;
mod debug;
mod element;
mod error;
mod executor;
mod graph;
#[cfg(feature = "logging")]
mod logging;
mod settings;
mod subgraph;

pub use crate::cache::{CacheStats, GraphCache};
pub use crate::compiler::{CompiledGraph, GraphCompiler, TaskTemplate};
pub use crate::component::{Component, GraphComponent};
pub use crate::config::{ExecutorConfig, OutputRetention};
pub use crate::context::{Context, Wakeup};
pub use crate::core::{Hash32, TaskId};
pub use crate::data::{Data, DataCollection, DataUsage, TaggedData};
pub use crate::debug::{DebugDisplay, LogDebugDisplay};
pub use crate::element::{
    BarrierElement, Element, ElementId, FetchInputElement, GenericElement,
    InputForwardingElement, TrivialElement,
};
pub use crate::error::{CompileError, ElementError, ExecutorError};
pub use crate::executor::{
    Audit, Diagnostics, Executor, ExecutorHandle, TaskRecord, TaskState,
};
pub use crate::graph::{Graph, GraphId, Node, NodeId};
#[cfg(feature = "logging")]
pub use crate::logging::init_logging;
pub use crate::settings::{DebugSettings, ExecutionMode, Settings, SubgraphRef};
pub use crate::subgraph::SubgraphElement;
