//! Turns a [`Graph`] into a flat, dependency-ordered list of task templates.
//!
//! Static subgraphs are inlined: every node of the embedded graph becomes a
//! task of the parent, and the subgraph node itself dissolves into the
//! embedded input and output nodes. Dynamic subgraphs stay a single task and
//! are scheduled when that task runs.
//!
//! The layout of a compiled graph is fixed:
//!
//! 1. the body tasks, in topological order,
//! 2. a pre-execute gate, which every root of the body waits for and which
//!    carries the external dependencies of a scheduled batch,
//! 3. the terminal task forwarding the output node's data, always last.

use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use petgraph::graph::{DiGraph, NodeIndex};

use crate::element::{BarrierElement, Element, TrivialElement};
use crate::error::CompileError;
use crate::graph::{Graph, GraphId, Node, NodeId};

pub struct TaskTemplate {
    pub(crate) label: String,
    pub(crate) node: Option<Arc<Node>>,
    /// Fixed element; `None` runs whatever the node's settings name.
    pub(crate) element: Option<Arc<dyn Element>>,
    /// Data dependencies, in the order their outputs are concatenated.
    pub(crate) inputs: Vec<usize>,
    /// Ordering-only dependencies.
    pub(crate) after: Vec<usize>,
}

impl TaskTemplate {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn node(&self) -> Option<&Arc<Node>> {
        self.node.as_ref()
    }

    pub fn inputs(&self) -> &[usize] {
        &self.inputs
    }

    pub fn after(&self) -> &[usize] {
        &self.after
    }
}

pub struct CompiledGraph {
    graph: GraphId,
    name: String,
    tasks: Vec<TaskTemplate>,
    input_task: usize,
    gate: usize,
    /// Every graph inlined into this compilation, with the revision it had.
    sources: Vec<(GraphId, Weak<Graph>, u64)>,
}

impl CompiledGraph {
    pub fn graph_id(&self) -> GraphId {
        self.graph
    }

    pub fn tasks(&self) -> &[TaskTemplate] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Task of the graph's own input node, where the scheduling input element
    /// is plugged in.
    pub fn input_task(&self) -> usize {
        self.input_task
    }

    pub fn gate(&self) -> usize {
        self.gate
    }

    pub fn terminal(&self) -> usize {
        self.tasks.len() - 1
    }

    pub fn embeds(&self, graph: GraphId) -> bool {
        self.sources.iter().any(|(id, _, _)| *id == graph)
    }

    fn is_current(&self) -> bool {
        self.sources.iter().all(|(_, graph, revision)| {
            graph
                .upgrade()
                .is_some_and(|graph| graph.revision() == *revision)
        })
    }
}

impl Display for CompiledGraph {
    /// Renders the task layout as a Mermaid flowchart. Solid arrows carry data,
    /// dotted ones only order.
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "graph TD")?;

        for (index, task) in self.tasks.iter().enumerate() {
            let label = task.label.replace('"', "#quot;");
            writeln!(f, "    t{index}[\"{label}\"]")?;
        }

        for (index, task) in self.tasks.iter().enumerate() {
            for input in &task.inputs {
                writeln!(f, "    t{input} --> t{index}")?;
            }
            for after in &task.after {
                writeln!(f, "    t{after} -.-> t{index}")?;
            }
        }

        Ok(())
    }
}

impl fmt::Debug for CompiledGraph {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledGraph")
            .field("graph", &self.graph)
            .field("name", &self.name)
            .field("tasks", &self.tasks.len())
            .finish_non_exhaustive()
    }
}

/// Compiles graphs and keeps the result per graph for as long as it stays
/// valid.
#[derive(Default)]
pub struct GraphCompiler {
    cache: RwLock<HashMap<GraphId, Arc<CompiledGraph>>>,
}

impl GraphCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compile(&self, graph: &Arc<Graph>) -> Result<Arc<CompiledGraph>, CompileError> {
        {
            let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(compiled) = cache.get(&graph.id())
                && compiled.is_current()
            {
                return Ok(compiled.clone());
            }
        }

        let compiled = Arc::new(compile_graph(graph)?);
        tracing::debug!(
            graph = graph.name(),
            tasks = compiled.len(),
            "compiled graph"
        );

        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(graph.id(), compiled.clone());

        Ok(compiled)
    }

    /// Forgets the compilation of `graph` and of every graph inlining it.
    pub fn notify_graph_changed(&self, graph: GraphId) {
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, compiled| !compiled.embeds(graph));
    }

    pub fn clear(&self) {
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for GraphCompiler {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphCompiler")
            .field("cached", &self.len())
            .finish()
    }
}

struct Vertex {
    label: String,
    graph: String,
    node: Arc<Node>,
}

/// One occurrence of a graph in the expansion, with the vertices already
/// reserved for its input and output nodes.
struct Instance {
    graph: Arc<Graph>,
    prefix: String,
    ancestry: Vec<GraphId>,
    input: usize,
    output: usize,
}

fn reserve(vertices: &mut Vec<Vertex>, graph: &Graph, prefix: &str, id: NodeId) -> usize {
    let node = graph.io_node(id);
    vertices.push(Vertex {
        label: format!("{prefix}{}", node.name()),
        graph: graph.name().to_string(),
        node,
    });
    vertices.len() - 1
}

fn compile_graph(root: &Arc<Graph>) -> Result<CompiledGraph, CompileError> {
    let mut vertices: Vec<Vertex> = Vec::new();
    let mut edges: Vec<(usize, usize)> = Vec::new();
    let mut sources = Vec::new();

    let root_input = reserve(&mut vertices, root, "", NodeId::INPUT);
    let root_output = reserve(&mut vertices, root, "", NodeId::OUTPUT);

    let mut work = vec![Instance {
        graph: root.clone(),
        prefix: String::new(),
        ancestry: vec![root.id()],
        input: root_input,
        output: root_output,
    }];

    while let Some(instance) = work.pop() {
        let snapshot = instance.graph.snapshot();
        sources.push((
            instance.graph.id(),
            Arc::downgrade(&instance.graph),
            snapshot.revision,
        ));

        // node -> (vertex receiving its inputs, vertex producing its output)
        let mut ends: HashMap<NodeId, (usize, usize)> = HashMap::new();

        for node in &snapshot.nodes {
            let id = node.id();

            if id == NodeId::INPUT {
                ends.insert(id, (instance.input, instance.input));
                continue;
            }

            if id == NodeId::OUTPUT {
                ends.insert(id, (instance.output, instance.output));
                continue;
            }

            let settings = node.settings();

            if let Some(child) = settings.static_subgraph() {
                if instance.ancestry.contains(&child.id()) {
                    return Err(CompileError::RecursiveSubgraph {
                        graph: child.name().to_string(),
                    });
                }

                let prefix = format!("{}{}/", instance.prefix, node.name());
                let input = reserve(&mut vertices, child, &prefix, NodeId::INPUT);
                let output = reserve(&mut vertices, child, &prefix, NodeId::OUTPUT);
                ends.insert(id, (input, output));

                let mut ancestry = instance.ancestry.clone();
                ancestry.push(child.id());

                work.push(Instance {
                    graph: child.clone(),
                    prefix,
                    ancestry,
                    input,
                    output,
                });
                continue;
            }

            vertices.push(Vertex {
                label: format!("{}{}", instance.prefix, node.name()),
                graph: instance.graph.name().to_string(),
                node: node.clone(),
            });
            let vertex = vertices.len() - 1;
            ends.insert(id, (vertex, vertex));
        }

        for &(from, to) in &snapshot.edges {
            let unknown = |node| CompileError::UnknownNode {
                graph: instance.graph.name().to_string(),
                node,
            };
            let (_, source) = *ends.get(&from).ok_or_else(|| unknown(from))?;
            let (target, _) = *ends.get(&to).ok_or_else(|| unknown(to))?;
            edges.push((source, target));
        }
    }

    let mut dag: DiGraph<usize, ()> = DiGraph::with_capacity(vertices.len(), edges.len());
    for index in 0..vertices.len() {
        dag.add_node(index);
    }
    for &(source, target) in &edges {
        dag.add_edge(NodeIndex::new(source), NodeIndex::new(target), ());
    }

    let order = petgraph::algo::toposort(&dag, None).map_err(|cycle| {
        let vertex = &vertices[cycle.node_id().index()];
        CompileError::Cycle {
            graph: vertex.graph.clone(),
            node: vertex.node.name().to_string(),
        }
    })?;

    // vertex -> task position
    let mut position = vec![0; vertices.len()];
    for (task, vertex) in order.iter().enumerate() {
        position[vertex.index()] = task;
    }

    let mut inputs: Vec<Vec<usize>> = vec![Vec::new(); vertices.len()];
    for &(source, target) in &edges {
        inputs[position[target]].push(position[source]);
    }

    let gate = vertices.len();
    let mut tasks: Vec<TaskTemplate> = order
        .iter()
        .zip(inputs)
        .map(|(vertex, inputs)| {
            let vertex = &vertices[vertex.index()];
            let after = if inputs.is_empty() { vec![gate] } else { Vec::new() };
            TaskTemplate {
                label: vertex.label.clone(),
                node: Some(vertex.node.clone()),
                element: None,
                inputs,
                after,
            }
        })
        .collect();

    tasks.push(TaskTemplate {
        label: String::from("pre-execute"),
        node: None,
        element: Some(Arc::new(BarrierElement)),
        inputs: Vec::new(),
        after: Vec::new(),
    });

    tasks.push(TaskTemplate {
        label: String::from("terminal"),
        node: None,
        element: Some(Arc::new(TrivialElement)),
        inputs: vec![position[root_output]],
        after: Vec::new(),
    });

    Ok(CompiledGraph {
        graph: root.id(),
        name: root.name().to_string(),
        tasks,
        input_task: position[root_input],
        gate,
        sources,
    })
}
