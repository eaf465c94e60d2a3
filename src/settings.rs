use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::Hash32;
use crate::element::{Element, ElementId, TrivialElement};
use crate::graph::{Graph, GraphId};
use crate::subgraph::SubgraphElement;

/// Administrative switch controlling how a node participates in execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ExecutionMode {
    #[default]
    Enabled,
    /// Runs normally, then hands the context to the debug display.
    Debug,
    /// Like `Debug`, but the output is cancelled so nothing downstream sees it.
    Isolated,
    /// The node forwards its input unchanged.
    Disabled,
}

/// Visualization knobs read by the debug display. They never take part in
/// the settings fingerprint, so tweaking them keeps cached results valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugSettings {
    pub label: Option<String>,
    pub max_items_logged: usize,
}

impl Default for DebugSettings {
    fn default() -> Self {
        Self {
            label: None,
            max_items_logged: 16,
        }
    }
}

/// A node whose body is another graph.
#[derive(Clone)]
pub struct SubgraphRef {
    pub graph: Arc<Graph>,
    /// Dynamic subgraphs are scheduled at run time instead of being inlined
    /// by the compiler.
    pub dynamic: bool,
}

impl fmt::Debug for SubgraphRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubgraphRef")
            .field("graph", &self.graph.name())
            .field("dynamic", &self.dynamic)
            .finish()
    }
}

/// Per-node configuration: which element runs and the policies the execution
/// wrapper applies around it.
#[derive(Clone)]
pub struct Settings {
    pub element: Arc<dyn Element>,
    /// Element specific parameters.
    pub params: serde_json::Value,
    pub seed: i32,
    /// When non-empty, only inputs carrying one of these tags reach the element.
    pub filter_on_tags: BTreeSet<String>,
    pub pass_through_filtered_out_inputs: bool,
    pub tags_applied_on_output: BTreeSet<String>,
    pub execution_mode: ExecutionMode,
    pub debug: DebugSettings,
    pub subgraph: Option<SubgraphRef>,
}

#[derive(Serialize)]
struct FingerprintView<'a> {
    element: &'a str,
    params: &'a serde_json::Value,
    seed: i32,
    filter_on_tags: &'a BTreeSet<String>,
    pass_through_filtered_out_inputs: bool,
    tags_applied_on_output: &'a BTreeSet<String>,
    subgraph: Option<(GraphId, bool)>,
}

impl Settings {
    pub fn new(element: impl Element + 'static) -> Self {
        Self::from_element(Arc::new(element))
    }

    pub fn from_element(element: Arc<dyn Element>) -> Self {
        Self {
            element,
            params: serde_json::Value::Null,
            seed: 0xC35A9631u32 as i32,
            filter_on_tags: BTreeSet::new(),
            pass_through_filtered_out_inputs: true,
            tags_applied_on_output: BTreeSet::new(),
            execution_mode: ExecutionMode::Enabled,
            debug: DebugSettings::default(),
            subgraph: None,
        }
    }

    /// Pass-through settings used by graph input and output nodes.
    pub fn trivial() -> Self {
        Self::new(TrivialElement)
    }

    pub fn subgraph(graph: Arc<Graph>, dynamic: bool) -> Self {
        let mut settings = Self::new(SubgraphElement);
        settings.subgraph = Some(SubgraphRef { graph, dynamic });
        settings
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_seed(mut self, seed: i32) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_filter_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filter_on_tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_pass_through(mut self, pass_through: bool) -> Self {
        self.pass_through_filtered_out_inputs = pass_through;
        self
    }

    pub fn with_output_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags_applied_on_output = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.execution_mode = mode;
        self
    }

    pub fn with_debug(mut self, debug: DebugSettings) -> Self {
        self.debug = debug;
        self
    }

    pub fn element_id(&self) -> ElementId {
        ElementId::of(&self.element)
    }

    pub fn static_subgraph(&self) -> Option<&Arc<Graph>> {
        self.subgraph
            .as_ref()
            .filter(|sub| !sub.dynamic)
            .map(|sub| &sub.graph)
    }

    /// Fingerprint of everything that can change what the element computes,
    /// or `None` when the settings cannot be serialized. Results produced
    /// under settings without a fingerprint are never cached.
    ///
    /// Debug settings and the execution mode are left out: both only act after
    /// the element has produced (or fetched) its output.
    pub fn fingerprint(&self) -> Option<Hash32> {
        let view = FingerprintView {
            element: self.element.name(),
            params: &self.params,
            seed: self.seed,
            filter_on_tags: &self.filter_on_tags,
            pass_through_filtered_out_inputs: self.pass_through_filtered_out_inputs,
            tags_applied_on_output: &self.tags_applied_on_output,
            subgraph: self.subgraph.as_ref().map(|sub| (sub.graph.id(), sub.dynamic)),
        };

        json_fingerprint(&view)
    }
}

fn json_fingerprint<T: Serialize>(value: &T) -> Option<Hash32> {
    match serde_json::to_vec(value) {
        Ok(bytes) => Some(Hash32::hash(bytes)),
        Err(err) => {
            tracing::warn!("settings have no fingerprint, results will not be cached: {err}");
            None
        }
    }
}

impl Hash for Settings {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.element_id().hash(state);
        self.fingerprint().hash(state);
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("element", &self.element.name())
            .field("params", &self.params)
            .field("seed", &self.seed)
            .field("filter_on_tags", &self.filter_on_tags)
            .field("tags_applied_on_output", &self.tags_applied_on_output)
            .field("execution_mode", &self.execution_mode)
            .field("subgraph", &self.subgraph)
            .finish_non_exhaustive()
    }
}
