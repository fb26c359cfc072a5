//! Aggregate counting over flow-graph sets and fixed points.
//!
//! Counts live in fixed structs with named integer fields; the
//! descriptive string-keyed map exists only at the external boundary for
//! writers and reports.

use std::collections::BTreeMap;

use petgraph::visit::EdgeRef;

use crate::call_graph::Program;
use crate::diff::{FixedPoint, MatchingContext};
use crate::flow_graph::FlowGraph;

/// Per-step-name match counts.
pub type Histogram = BTreeMap<String, u64>;

/// Structural totals of one flow-graph set, split library / non-library.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GraphCounts {
    pub functions: u64,
    pub basic_blocks: u64,
    pub instructions: u64,
    pub edges: u64,
    pub library_functions: u64,
    pub library_basic_blocks: u64,
    pub library_instructions: u64,
    pub library_edges: u64,
}

impl GraphCounts {
    pub fn total_functions(&self) -> u64 {
        self.functions + self.library_functions
    }

    pub fn total_basic_blocks(&self) -> u64 {
        self.basic_blocks + self.library_basic_blocks
    }

    pub fn total_instructions(&self) -> u64 {
        self.instructions + self.library_instructions
    }

    pub fn total_edges(&self) -> u64 {
        self.edges + self.library_edges
    }
}

/// Match totals over a fixed-point set, split library / non-library.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MatchCounts {
    pub functions: u64,
    pub basic_blocks: u64,
    pub instructions: u64,
    pub edges: u64,
    pub library_functions: u64,
    pub library_basic_blocks: u64,
    pub library_instructions: u64,
    pub library_edges: u64,
}

impl MatchCounts {
    pub fn total_functions(&self) -> u64 {
        self.functions + self.library_functions
    }

    pub fn total_basic_blocks(&self) -> u64 {
        self.basic_blocks + self.library_basic_blocks
    }

    pub fn total_instructions(&self) -> u64 {
        self.instructions + self.library_instructions
    }

    pub fn total_edges(&self) -> u64 {
        self.edges + self.library_edges
    }

    pub fn add(&mut self, other: &MatchCounts) {
        self.functions += other.functions;
        self.basic_blocks += other.basic_blocks;
        self.instructions += other.instructions;
        self.edges += other.edges;
        self.library_functions += other.library_functions;
        self.library_basic_blocks += other.library_basic_blocks;
        self.library_instructions += other.library_instructions;
        self.library_edges += other.library_edges;
    }
}

/// Everything the summary layer needs: both sides' structure counts plus
/// the match counts.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiffCounts {
    pub primary: GraphCounts,
    pub secondary: GraphCounts,
    pub matches: MatchCounts,
}

impl DiffCounts {
    /// Descriptive string-keyed view for the external boundary.
    pub fn to_map(&self) -> BTreeMap<String, u64> {
        let mut map = BTreeMap::new();
        for (prefix, counts) in [("primary", &self.primary), ("secondary", &self.secondary)] {
            map.insert(format!("functions {prefix} (non-library)"), counts.functions);
            map.insert(
                format!("functions {prefix} (library)"),
                counts.library_functions,
            );
            map.insert(
                format!("basicBlocks {prefix} (non-library)"),
                counts.basic_blocks,
            );
            map.insert(
                format!("basicBlocks {prefix} (library)"),
                counts.library_basic_blocks,
            );
            map.insert(
                format!("instructions {prefix} (non-library)"),
                counts.instructions,
            );
            map.insert(
                format!("instructions {prefix} (library)"),
                counts.library_instructions,
            );
            map.insert(format!("flowGraph edges {prefix} (non-library)"), counts.edges);
            map.insert(
                format!("flowGraph edges {prefix} (library)"),
                counts.library_edges,
            );
        }
        map.insert(
            "function matches (non-library)".to_owned(),
            self.matches.functions,
        );
        map.insert(
            "function matches (library)".to_owned(),
            self.matches.library_functions,
        );
        map.insert(
            "basicBlock matches (non-library)".to_owned(),
            self.matches.basic_blocks,
        );
        map.insert(
            "basicBlock matches (library)".to_owned(),
            self.matches.library_basic_blocks,
        );
        map.insert(
            "instruction matches (non-library)".to_owned(),
            self.matches.instructions,
        );
        map.insert(
            "instruction matches (library)".to_owned(),
            self.matches.library_instructions,
        );
        map.insert(
            "flowGraph edge matches (non-library)".to_owned(),
            self.matches.edges,
        );
        map.insert(
            "flowGraph edge matches (library)".to_owned(),
            self.matches.library_edges,
        );
        map
    }
}

/// Counts one flow-graph set per category.
pub fn count_flow_graphs<'a>(flow_graphs: impl Iterator<Item = &'a FlowGraph>) -> GraphCounts {
    let mut counts = GraphCounts::default();
    for flow_graph in flow_graphs {
        if flow_graph.is_library() {
            counts.library_functions += 1;
            counts.library_basic_blocks += flow_graph.basic_block_count() as u64;
            counts.library_instructions += flow_graph.instruction_count() as u64;
            counts.library_edges += flow_graph.edge_count() as u64;
        } else {
            counts.functions += 1;
            counts.basic_blocks += flow_graph.basic_block_count() as u64;
            counts.instructions += flow_graph.instruction_count() as u64;
            counts.edges += flow_graph.edge_count() as u64;
        }
    }
    counts
}

pub fn count_program(program: &Program) -> GraphCounts {
    count_flow_graphs(program.flow_graphs.iter())
}

/// Matched flow-graph edges of one fixed point: a primary edge counts iff
/// both endpoints are matched and the corresponding secondary edge
/// exists.
pub fn matched_edge_count(point: &FixedPoint, primary: &FlowGraph, secondary: &FlowGraph) -> u64 {
    let mut matched = 0;
    for edge in primary.graph().edge_references() {
        let (Some(source), Some(target)) = (
            point.secondary_block_for(edge.source()),
            point.secondary_block_for(edge.target()),
        ) else {
            continue;
        };
        if secondary.graph().find_edge(source, target).is_some() {
            matched += 1;
        }
    }
    matched
}

/// Counts one fixed point's matches and records its steps in the
/// histogram. A pair is library when either side is.
pub fn count_fixed_point(
    point: &FixedPoint,
    primary: &FlowGraph,
    secondary: &FlowGraph,
    histogram: &mut Histogram,
) -> MatchCounts {
    let mut counts = MatchCounts::default();
    let library = primary.is_library() || secondary.is_library();

    *histogram.entry(point.step_name.to_owned()).or_default() += 1;
    let mut basic_blocks = 0;
    let mut instructions = 0;
    for pair in &point.basic_blocks {
        *histogram.entry(pair.step_name.to_owned()).or_default() += 1;
        basic_blocks += 1;
        instructions += pair.instruction_matches.len() as u64;
    }
    let edges = matched_edge_count(point, primary, secondary);

    if library {
        counts.library_functions = 1;
        counts.library_basic_blocks = basic_blocks;
        counts.library_instructions = instructions;
        counts.library_edges = edges;
    } else {
        counts.functions = 1;
        counts.basic_blocks = basic_blocks;
        counts.instructions = instructions;
        counts.edges = edges;
    }
    counts
}

/// Aggregates everything the similarity layer consumes from a finished
/// matching context.
pub fn gather_counts(context: &MatchingContext) -> (DiffCounts, Histogram) {
    let mut histogram = Histogram::new();
    let primary = count_program(context.primary);
    let secondary = count_program(context.secondary);
    let mut matches = MatchCounts::default();
    for point in context.fixed_points.iter() {
        let primary_graph = context.primary.flow_graph_of(point.primary);
        let secondary_graph = context.secondary.flow_graph_of(point.secondary);
        matches.add(&count_fixed_point(
            point,
            primary_graph,
            secondary_graph,
            &mut histogram,
        ));
    }
    (
        DiffCounts {
            primary,
            secondary,
            matches,
        },
        histogram,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::BasicBlockFixedPoint;
    use crate::flow_graph::{BasicBlock, Instruction, InstructionCache};
    use petgraph::graph::NodeIndex;

    fn linear_graph(cache: &InstructionCache, base: u64, patterns: &[&[u8]]) -> FlowGraph {
        let blocks: Vec<BasicBlock> = patterns
            .iter()
            .enumerate()
            .map(|(i, bytes)| {
                let address = base + (i as u64) * 0x10;
                let (bytes, pattern_hash) = cache.intern(bytes);
                BasicBlock::new(
                    address,
                    vec![Instruction {
                        address,
                        bytes,
                        pattern_hash,
                        call_target: None,
                    }],
                )
            })
            .collect();
        let edges: Vec<(usize, usize)> = (1..patterns.len()).map(|i| (i - 1, i)).collect();
        FlowGraph::new(
            base,
            format!("f_{base:x}"),
            None,
            false,
            NodeIndex::new(0),
            blocks,
            &edges,
        )
    }

    #[test]
    fn edge_matches_require_matching_secondary_edge() {
        let cache = InstructionCache::new();
        let primary = linear_graph(&cache, 0x1000, &[&[0x55], &[0x90], &[0xc3]]);
        let secondary = linear_graph(&cache, 0x2000, &[&[0x55], &[0x90], &[0xc3]]);

        // Only the first two blocks are matched, so just one of the two
        // primary edges has both endpoints mapped into the secondary.
        let mut point = FixedPoint::new(NodeIndex::new(0), NodeIndex::new(0), "test");
        for i in 0..2 {
            assert!(point.add_basic_block(BasicBlockFixedPoint {
                primary: NodeIndex::new(i),
                secondary: NodeIndex::new(i),
                step_name: "basicBlock: hash matching",
                instruction_matches: vec![(0x1000 + i as u64 * 0x10, 0x2000 + i as u64 * 0x10)],
            }));
        }
        assert_eq!(matched_edge_count(&point, &primary, &secondary), 1);

        let mut histogram = Histogram::new();
        let counts = count_fixed_point(&point, &primary, &secondary, &mut histogram);
        assert_eq!(counts.functions, 1);
        assert_eq!(counts.basic_blocks, 2);
        assert_eq!(counts.instructions, 2);
        assert_eq!(counts.edges, 1);
        assert_eq!(histogram.get("test"), Some(&1));
        assert_eq!(histogram.get("basicBlock: hash matching"), Some(&2));
    }

    #[test]
    fn count_splits_library_and_non_library() {
        let cache = InstructionCache::new();
        let non_library = linear_graph(&cache, 0x1000, &[&[0x55], &[0xc3]]);
        let library = FlowGraph::empty(0x2000, "imported".to_owned(), None, NodeIndex::new(1));
        let counts = count_flow_graphs([&non_library, &library].into_iter());
        assert_eq!(counts.functions, 1);
        assert_eq!(counts.library_functions, 1);
        assert_eq!(counts.basic_blocks, 2);
        assert_eq!(counts.library_basic_blocks, 0);
        assert_eq!(counts.instructions, 2);
        assert_eq!(counts.edges, 1);
    }
}
