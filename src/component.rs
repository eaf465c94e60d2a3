use std::fmt;
use std::sync::Arc;

use crate::data::DataCollection;
use crate::graph::Graph;

/// The owner of a graph: what gets scheduled, and where the graph's input
/// node gets its data from.
pub trait Component: Send + Sync {
    fn name(&self) -> &str;

    /// Graph to run for this component, if any.
    fn graph(&self) -> Option<Arc<Graph>>;

    /// Data appended to whatever flows into the graph's input node.
    fn input_data(&self) -> Option<DataCollection> {
        None
    }
}

/// Plain component carrying a graph and an optional input collection.
#[derive(Clone)]
pub struct GraphComponent {
    name: String,
    graph: Option<Arc<Graph>>,
    input: Option<DataCollection>,
}

impl GraphComponent {
    pub fn new(name: impl Into<String>, graph: Arc<Graph>) -> Self {
        Self {
            name: name.into(),
            graph: Some(graph),
            input: None,
        }
    }

    /// A component with nothing to run.
    pub fn empty(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            graph: None,
            input: None,
        }
    }

    pub fn with_input(mut self, input: DataCollection) -> Self {
        self.input = Some(input);
        self
    }
}

impl Component for GraphComponent {
    fn name(&self) -> &str {
        &self.name
    }

    fn graph(&self) -> Option<Arc<Graph>> {
        self.graph.clone()
    }

    fn input_data(&self) -> Option<DataCollection> {
        self.input.clone()
    }
}

impl fmt::Debug for GraphComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphComponent")
            .field("name", &self.name)
            .field("graph", &self.graph.as_ref().map(|graph| graph.name()))
            .field("input", &self.input.as_ref().map(DataCollection::len))
            .finish()
    }
}
