//! The abstract node graph consumed by the compiler.
//!
//! A [`Graph`] always owns an input node and an output node. User nodes carry
//! [`Settings`] and are wired with directed edges: an edge `a -> b` makes the
//! output of `a` part of the input of `b`.
//!
//! Graphs are shared (`Arc<Graph>`) and edited through `&self`. Every edit that
//! changes the shape of the graph bumps its revision, which is what the
//! compiler checks before reusing a cached compilation.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::settings::Settings;

static NEXT_GRAPH_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GraphId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    pub const INPUT: NodeId = NodeId(0);
    pub const OUTPUT: NodeId = NodeId(1);

    pub fn index(self) -> u32 {
        self.0
    }
}

pub struct Node {
    id: NodeId,
    name: String,
    settings: RwLock<Arc<Settings>>,
}

impl Node {
    fn new(id: NodeId, name: impl Into<String>, settings: Settings) -> Self {
        Self {
            id,
            name: name.into(),
            settings: RwLock::new(Arc::new(settings)),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current default settings. Read at execution time, so non-structural
    /// edits reach already compiled tasks.
    pub fn settings(&self) -> Arc<Settings> {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct GraphBody {
    nodes: Vec<Arc<Node>>,
    edges: Vec<(NodeId, NodeId)>,
    next_node: u32,
}

/// A consistent view of a graph taken under its lock.
pub(crate) struct GraphSnapshot {
    pub nodes: Vec<Arc<Node>>,
    pub edges: Vec<(NodeId, NodeId)>,
    pub revision: u64,
}

pub struct Graph {
    id: GraphId,
    name: String,
    body: RwLock<GraphBody>,
    revision: AtomicU64,
}

impl Graph {
    pub fn new(name: impl Into<String>) -> Self {
        let body = GraphBody {
            nodes: vec![
                Arc::new(Node::new(NodeId::INPUT, "Input", Settings::trivial())),
                Arc::new(Node::new(NodeId::OUTPUT, "Output", Settings::trivial())),
            ],
            edges: Vec::new(),
            next_node: 2,
        };

        Self {
            id: GraphId(NEXT_GRAPH_ID.fetch_add(1, Ordering::Relaxed)),
            name: name.into(),
            body: RwLock::new(body),
            revision: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> GraphId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Structural revision, bumped on every edit that changes the task layout.
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }

    pub fn input_node(&self) -> NodeId {
        NodeId::INPUT
    }

    pub fn output_node(&self) -> NodeId {
        NodeId::OUTPUT
    }

    pub fn add_node(&self, name: impl Into<String>, settings: Settings) -> NodeId {
        let mut body = self.write();
        let id = NodeId(body.next_node);
        body.next_node += 1;
        body.nodes.push(Arc::new(Node::new(id, name, settings)));
        self.bump();
        id
    }

    /// Adds a directed edge and returns `to` for easy chaining. Endpoints are
    /// validated when the graph is compiled.
    pub fn add_edge(&self, from: NodeId, to: NodeId) -> NodeId {
        let mut body = self.write();
        if !body.edges.contains(&(from, to)) {
            body.edges.push((from, to));
            self.bump();
        }
        to
    }

    /// Removes a user node and every edge touching it. The input and output
    /// nodes cannot be removed.
    pub fn remove_node(&self, id: NodeId) -> bool {
        if id == NodeId::INPUT || id == NodeId::OUTPUT {
            return false;
        }

        let mut body = self.write();
        let before = body.nodes.len();
        body.nodes.retain(|node| node.id != id);

        if body.nodes.len() == before {
            return false;
        }

        body.edges.retain(|&(from, to)| from != id && to != id);
        self.bump();
        true
    }

    /// Replaces a node's settings. Only a change of subgraph reference is
    /// structural; anything else is picked up by compiled tasks as is.
    pub fn set_settings(&self, id: NodeId, settings: Settings) -> bool {
        let body = self.read();
        let Some(node) = body.nodes.iter().find(|node| node.id == id) else {
            return false;
        };

        let mut slot = node.settings.write().unwrap_or_else(PoisonError::into_inner);
        let structural = subgraph_key(&slot) != subgraph_key(&settings);
        *slot = Arc::new(settings);

        if structural {
            self.bump();
        }

        true
    }

    pub fn node(&self, id: NodeId) -> Option<Arc<Node>> {
        self.read().nodes.iter().find(|node| node.id == id).cloned()
    }

    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.read().nodes.clone()
    }

    pub fn edges(&self) -> Vec<(NodeId, NodeId)> {
        self.read().edges.clone()
    }

    /// The input or output node, which every graph keeps in its first two
    /// slots.
    pub(crate) fn io_node(&self, id: NodeId) -> Arc<Node> {
        debug_assert!(id == NodeId::INPUT || id == NodeId::OUTPUT);
        self.read().nodes[id.0 as usize].clone()
    }

    pub(crate) fn snapshot(&self) -> GraphSnapshot {
        let body = self.read();
        GraphSnapshot {
            nodes: body.nodes.clone(),
            edges: body.edges.clone(),
            revision: self.revision(),
        }
    }

    fn bump(&self) {
        self.revision.fetch_add(1, Ordering::AcqRel);
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, GraphBody> {
        self.body.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, GraphBody> {
        self.body.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn subgraph_key(settings: &Settings) -> Option<(GraphId, bool)> {
    settings
        .subgraph
        .as_ref()
        .map(|sub| (sub.graph.id(), sub.dynamic))
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("revision", &self.revision())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_graph_has_io_nodes() {
        let graph = Graph::new("empty");
        let nodes = graph.nodes();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].id(), graph.input_node());
        assert_eq!(nodes[1].id(), graph.output_node());
    }

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(Graph::new("a").id(), Graph::new("b").id());
    }

    #[test]
    fn test_structural_edits_bump_revision() {
        let graph = Graph::new("g");
        let r0 = graph.revision();

        let a = graph.add_node("a", Settings::trivial());
        let r1 = graph.revision();
        assert!(r1 > r0);

        graph.add_edge(graph.input_node(), a);
        let r2 = graph.revision();
        assert!(r2 > r1);

        // duplicate edge is a no-op
        graph.add_edge(graph.input_node(), a);
        assert_eq!(graph.revision(), r2);

        // plain settings change is not structural
        assert!(graph.set_settings(a, Settings::trivial().with_seed(3)));
        assert_eq!(graph.revision(), r2);
        assert_eq!(graph.node(a).unwrap().settings().seed, 3);

        // switching to a subgraph is
        let sub = Arc::new(Graph::new("sub"));
        assert!(graph.set_settings(a, Settings::subgraph(sub, false)));
        assert!(graph.revision() > r2);
    }

    #[test]
    fn test_remove_node_drops_edges() {
        let graph = Graph::new("g");
        let a = graph.add_node("a", Settings::trivial());
        graph.add_edge(graph.input_node(), a);
        graph.add_edge(a, graph.output_node());

        assert!(!graph.remove_node(graph.input_node()));
        assert!(graph.remove_node(a));
        assert!(!graph.remove_node(a));
        assert!(graph.edges().is_empty());
    }
}
