//! Call graphs and the program model that owns them.

use std::collections::BTreeMap;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;

use crate::flow_graph::{md_index_of, Address, FlowGraph};

/// Sentinel for a vertex whose flow graph has not been attached yet. The
/// reader replaces every occurrence before the program is handed out.
pub(crate) const UNATTACHED: usize = usize::MAX;

/// Call-site relation between two functions.
#[derive(Debug, Clone, Copy)]
pub struct CallEdge {
    /// Set when multiple call sites exist between the same pair of
    /// functions; propagation skips duplicates.
    pub duplicate: bool,
}

/// A function in the call graph.
#[derive(Debug, Clone)]
pub struct FunctionVertex {
    pub address: Address,
    pub name: String,
    pub demangled_name: Option<String>,
    pub library: bool,
    /// Imported or external function synthesized with an empty flow graph.
    pub stub: bool,
    /// Index of the owned flow graph in [`Program::flow_graphs`].
    pub flow_graph: usize,
}

impl FunctionVertex {
    pub fn display_name(&self) -> &str {
        self.demangled_name.as_deref().unwrap_or(&self.name)
    }
}

/// Directed graph of functions connected by call-site edges.
///
/// Vertices are stored in ascending address order so vertex indices
/// iterate deterministically across runs and platforms.
#[derive(Debug)]
pub struct CallGraph {
    exe_filename: String,
    exe_hash: String,
    graph: DiGraph<FunctionVertex, CallEdge>,
    by_address: BTreeMap<Address, NodeIndex>,
    md_index: f64,
}

impl CallGraph {
    /// Builds a call graph from parsed vertices and index-pair edges.
    /// `edges` reference the positions vertices were passed in.
    pub fn new(
        exe_filename: String,
        exe_hash: String,
        vertices: Vec<FunctionVertex>,
        edges: &[(usize, usize)],
    ) -> Self {
        let mut order: Vec<usize> = (0..vertices.len()).collect();
        let mut slots: Vec<Option<FunctionVertex>> = vertices.into_iter().map(Some).collect();
        order.sort_by_key(|&i| slots[i].as_ref().map(|v| v.address));

        let mut graph = DiGraph::new();
        let mut by_address = BTreeMap::new();
        let mut old_to_new = vec![NodeIndex::end(); slots.len()];
        for &i in &order {
            let Some(vertex) = slots[i].take() else { continue };
            let address = vertex.address;
            let index = graph.add_node(vertex);
            old_to_new[i] = index;
            by_address.insert(address, index);
        }

        let mut seen = std::collections::BTreeSet::new();
        for &(source, target) in edges {
            let (s, t) = (old_to_new[source], old_to_new[target]);
            let duplicate = !seen.insert((s, t));
            graph.add_edge(s, t, CallEdge { duplicate });
        }

        let md_index = md_index_of(&graph, None);
        Self {
            exe_filename,
            exe_hash,
            graph,
            by_address,
            md_index,
        }
    }

    pub fn exe_filename(&self) -> &str {
        &self.exe_filename
    }

    pub fn exe_hash(&self) -> &str {
        &self.exe_hash
    }

    pub fn graph(&self) -> &DiGraph<FunctionVertex, CallEdge> {
        &self.graph
    }

    pub fn vertex(&self, index: NodeIndex) -> &FunctionVertex {
        &self.graph[index]
    }

    pub(crate) fn vertex_mut(&mut self, index: NodeIndex) -> &mut FunctionVertex {
        &mut self.graph[index]
    }

    pub fn vertices(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.node_indices()
    }

    pub fn vertex_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Looks up the function vertex at an exact address.
    pub fn vertex_at(&self, address: Address) -> Option<NodeIndex> {
        self.by_address.get(&address).copied()
    }

    /// Structural fingerprint of the whole call graph, computed once.
    pub fn md_index(&self) -> f64 {
        self.md_index
    }

    /// Call targets reachable over non-duplicate edges.
    pub fn callees(&self, vertex: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph
            .edges_directed(vertex, Direction::Outgoing)
            .filter(|edge| !edge.weight().duplicate)
            .map(|edge| edge.target())
    }

    /// Call sites reaching this function over non-duplicate edges.
    pub fn callers(&self, vertex: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph
            .edges_directed(vertex, Direction::Incoming)
            .filter(|edge| !edge.weight().duplicate)
            .map(|edge| edge.source())
    }
}

/// One loaded binary: the call graph plus the flow graphs it owns.
///
/// After loading, every call-graph vertex owns exactly one flow graph
/// (stubs own an empty one) and the model is read-only until matching
/// begins.
#[derive(Debug)]
pub struct Program {
    pub call_graph: CallGraph,
    pub flow_graphs: Vec<FlowGraph>,
}

impl Program {
    /// The flow graph owned by a call-graph vertex.
    pub fn flow_graph_of(&self, vertex: NodeIndex) -> &FlowGraph {
        let index = self.call_graph.vertex(vertex).flow_graph;
        debug_assert_ne!(index, UNATTACHED, "flow graph never attached");
        &self.flow_graphs[index]
    }

    pub fn function_count(&self) -> usize {
        self.call_graph.vertex_count()
    }
}
