//! Flow graphs: basic blocks, interned instructions, and the MD-index
//! structural fingerprint.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use rustc_hash::FxHashMap;
use sha2::{Digest, Sha256};

/// Location inside a binary.
pub type Address = u64;

/// Truncated SHA-256 digest used as an equality key for byte patterns.
pub fn hash_bytes(bytes: &[u8]) -> u64 {
    let digest = Sha256::digest(bytes);
    u64::from_le_bytes([
        digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
    ])
}

/// A single disassembled instruction. The raw byte pattern is interned in
/// the shared [`InstructionCache`].
#[derive(Debug, Clone)]
pub struct Instruction {
    pub address: Address,
    pub bytes: Arc<[u8]>,
    pub pattern_hash: u64,
    /// Target function address when this instruction is a call site.
    pub call_target: Option<Address>,
}

/// Process-wide interning table for instruction byte patterns.
///
/// Shared by both flow-graph sets and the reader. Contents are append-only
/// during load and cleared only when the owning engine is torn down.
#[derive(Debug, Default)]
pub struct InstructionCache {
    patterns: Mutex<FxHashMap<u64, Arc<[u8]>>>,
}

impl InstructionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns a byte pattern, returning the shared slice and its digest.
    pub fn intern(&self, bytes: &[u8]) -> (Arc<[u8]>, u64) {
        let hash = hash_bytes(bytes);
        let mut patterns = self.patterns.lock();
        let pattern = patterns
            .entry(hash)
            .or_insert_with(|| Arc::from(bytes))
            .clone();
        (pattern, hash)
    }

    pub fn len(&self) -> usize {
        self.patterns.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.lock().is_empty()
    }

    pub fn clear(&self) {
        self.patterns.lock().clear();
    }
}

/// Straight-line instruction sequence with a single entry and exit.
#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub address: Address,
    pub instructions: Vec<Instruction>,
    /// Digest over the concatenated instruction bytes.
    pub hash: u64,
}

impl BasicBlock {
    pub fn new(address: Address, instructions: Vec<Instruction>) -> Self {
        let mut hasher = Sha256::new();
        for instruction in &instructions {
            hasher.update(&instruction.bytes);
        }
        let digest = hasher.finalize();
        let hash = u64::from_le_bytes([
            digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
        ]);
        Self {
            address,
            instructions,
            hash,
        }
    }

    pub fn instruction_count(&self) -> usize {
        self.instructions.len()
    }
}

/// Intra-function control flow graph.
///
/// Vertices are basic blocks in ascending address order so that vertex
/// indices iterate deterministically. Owned by its program; the enclosing
/// call-graph vertex is recorded for propagation across the call graph.
#[derive(Debug)]
pub struct FlowGraph {
    entry_address: Address,
    name: String,
    demangled_name: Option<String>,
    library: bool,
    graph: DiGraph<BasicBlock, ()>,
    entry: Option<NodeIndex>,
    md_index: f64,
    byte_hash: u64,
    instruction_count: usize,
    call_graph_vertex: NodeIndex,
}

impl FlowGraph {
    /// Builds a flow graph from parsed basic blocks. `edges` reference the
    /// positions blocks were passed in; they are remapped after the blocks
    /// are sorted by address.
    pub fn new(
        entry_address: Address,
        name: String,
        demangled_name: Option<String>,
        library: bool,
        call_graph_vertex: NodeIndex,
        blocks: Vec<BasicBlock>,
        edges: &[(usize, usize)],
    ) -> Self {
        let mut order: Vec<usize> = (0..blocks.len()).collect();
        let mut slots: Vec<Option<BasicBlock>> = blocks.into_iter().map(Some).collect();
        order.sort_by_key(|&i| slots[i].as_ref().map(|b| b.address));

        let mut graph = DiGraph::new();
        let mut old_to_new = vec![NodeIndex::end(); slots.len()];
        for &i in &order {
            let Some(block) = slots[i].take() else { continue };
            old_to_new[i] = graph.add_node(block);
        }
        for &(source, target) in edges {
            graph.add_edge(old_to_new[source], old_to_new[target], ());
        }

        let entry = graph
            .node_indices()
            .find(|&v| graph[v].address == entry_address);

        let mut hasher = Sha256::new();
        let mut instruction_count = 0;
        for v in graph.node_indices() {
            for instruction in &graph[v].instructions {
                hasher.update(&instruction.bytes);
                instruction_count += 1;
            }
        }
        let digest = hasher.finalize();
        let byte_hash = u64::from_le_bytes([
            digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
        ]);

        let md_index = md_index_of(&graph, entry);
        Self {
            entry_address,
            name,
            demangled_name,
            library,
            graph,
            entry,
            md_index,
            byte_hash,
            instruction_count,
            call_graph_vertex,
        }
    }

    /// Empty flow graph standing in for an imported or external function.
    pub fn empty(
        entry_address: Address,
        name: String,
        demangled_name: Option<String>,
        call_graph_vertex: NodeIndex,
    ) -> Self {
        Self {
            entry_address,
            name,
            demangled_name,
            library: true,
            graph: DiGraph::new(),
            entry: None,
            md_index: 0.0,
            byte_hash: 0,
            instruction_count: 0,
            call_graph_vertex,
        }
    }

    pub fn entry_address(&self) -> Address {
        self.entry_address
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn demangled_name(&self) -> Option<&str> {
        self.demangled_name.as_deref()
    }

    /// Preferred display name: demangled when available.
    pub fn display_name(&self) -> &str {
        self.demangled_name.as_deref().unwrap_or(&self.name)
    }

    pub fn is_library(&self) -> bool {
        self.library
    }

    pub fn graph(&self) -> &DiGraph<BasicBlock, ()> {
        &self.graph
    }

    pub fn entry(&self) -> Option<NodeIndex> {
        self.entry
    }

    pub fn call_graph_vertex(&self) -> NodeIndex {
        self.call_graph_vertex
    }

    pub fn block(&self, vertex: NodeIndex) -> &BasicBlock {
        &self.graph[vertex]
    }

    pub fn basic_block_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn instruction_count(&self) -> usize {
        self.instruction_count
    }

    /// Structural fingerprint, computed once at construction.
    pub fn md_index(&self) -> f64 {
        self.md_index
    }

    /// Digest over all instruction bytes in block-address order.
    pub fn byte_hash(&self) -> u64 {
        self.byte_hash
    }

    pub fn block_vertices(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.node_indices()
    }

    pub fn successors(&self, vertex: NodeIndex) -> BTreeSet<NodeIndex> {
        self.graph
            .neighbors_directed(vertex, Direction::Outgoing)
            .collect()
    }

    pub fn predecessors(&self, vertex: NodeIndex) -> BTreeSet<NodeIndex> {
        self.graph
            .neighbors_directed(vertex, Direction::Incoming)
            .collect()
    }
}

/// Real-valued graph invariant over edge neighborhoods.
///
/// Each edge contributes the inverse square root of a weighted sum of its
/// endpoint degrees and the source's breadth-first level, so the value is
/// sensitive to topology but independent of addresses and names.
pub(crate) fn md_index_of<N, E>(graph: &DiGraph<N, E>, entry: Option<NodeIndex>) -> f64 {
    if graph.edge_count() == 0 {
        return 0.0;
    }

    let n = graph.node_count();
    let mut in_degree = vec![0u32; n];
    let mut out_degree = vec![0u32; n];
    for edge in graph.edge_references() {
        out_degree[edge.source().index()] += 1;
        in_degree[edge.target().index()] += 1;
    }

    // Breadth-first levels from the entry; unreached vertices stay at zero.
    let mut level = vec![0u32; n];
    if let Some(entry) = entry {
        let mut seen = vec![false; n];
        seen[entry.index()] = true;
        let mut queue = VecDeque::from([entry]);
        while let Some(v) = queue.pop_front() {
            let next = level[v.index()] + 1;
            let mut targets: Vec<NodeIndex> =
                graph.neighbors_directed(v, Direction::Outgoing).collect();
            targets.sort_unstable();
            for t in targets {
                if !seen[t.index()] {
                    seen[t.index()] = true;
                    level[t.index()] = next;
                    queue.push_back(t);
                }
            }
        }
    }

    let (w_in_s, w_out_s) = (2.0f64.sqrt(), 3.0f64.sqrt());
    let (w_in_t, w_out_t) = (5.0f64.sqrt(), 7.0f64.sqrt());
    let w_level = 11.0f64.sqrt();
    let mut index = 0.0;
    for edge in graph.edge_references() {
        let (s, t) = (edge.source().index(), edge.target().index());
        let term = w_in_s * f64::from(in_degree[s])
            + w_out_s * f64::from(out_degree[s])
            + w_in_t * f64::from(in_degree[t])
            + w_out_t * f64::from(out_degree[t])
            + w_level * f64::from(level[s]);
        if term > 0.0 {
            index += 1.0 / term.sqrt();
        }
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instruction(cache: &InstructionCache, address: Address, bytes: &[u8]) -> Instruction {
        let (bytes, pattern_hash) = cache.intern(bytes);
        Instruction {
            address,
            bytes,
            pattern_hash,
            call_target: None,
        }
    }

    fn diamond(cache: &InstructionCache) -> FlowGraph {
        let blocks = vec![
            BasicBlock::new(0x1000, vec![instruction(cache, 0x1000, &[0x55])]),
            BasicBlock::new(0x1010, vec![instruction(cache, 0x1010, &[0x90, 0x90])]),
            BasicBlock::new(0x1020, vec![instruction(cache, 0x1020, &[0xc3])]),
            BasicBlock::new(0x1030, vec![instruction(cache, 0x1030, &[0xcc])]),
        ];
        FlowGraph::new(
            0x1000,
            "diamond".to_owned(),
            None,
            false,
            NodeIndex::new(0),
            blocks,
            &[(0, 1), (0, 2), (1, 3), (2, 3)],
        )
    }

    #[test]
    fn cache_interns_identical_patterns() {
        let cache = InstructionCache::new();
        let (a, ha) = cache.intern(&[0x48, 0x89, 0xe5]);
        let (b, hb) = cache.intern(&[0x48, 0x89, 0xe5]);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(ha, hb);
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn md_index_is_structural() {
        let cache = InstructionCache::new();
        let a = diamond(&cache);
        let b = diamond(&cache);
        assert!(a.md_index() > 0.0);
        assert_eq!(a.md_index(), b.md_index());

        let chain = FlowGraph::new(
            0x2000,
            "chain".to_owned(),
            None,
            false,
            NodeIndex::new(0),
            vec![
                BasicBlock::new(0x2000, vec![instruction(&cache, 0x2000, &[0x55])]),
                BasicBlock::new(0x2010, vec![instruction(&cache, 0x2010, &[0xc3])]),
            ],
            &[(0, 1)],
        );
        assert_ne!(a.md_index(), chain.md_index());
    }

    #[test]
    fn blocks_are_sorted_by_address() {
        let cache = InstructionCache::new();
        let blocks = vec![
            BasicBlock::new(0x3020, vec![instruction(&cache, 0x3020, &[0xc3])]),
            BasicBlock::new(0x3000, vec![instruction(&cache, 0x3000, &[0x55])]),
        ];
        let graph = FlowGraph::new(
            0x3000,
            "f".to_owned(),
            None,
            false,
            NodeIndex::new(0),
            blocks,
            &[(1, 0)],
        );
        let addresses: Vec<Address> = graph
            .block_vertices()
            .map(|v| graph.block(v).address)
            .collect();
        assert_eq!(addresses, vec![0x3000, 0x3020]);
        assert_eq!(graph.entry().map(|v| graph.block(v).address), Some(0x3000));
        assert_eq!(graph.edge_count(), 1);
    }
}
