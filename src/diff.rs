//! The matcher engine: fixed points, the append-only store, the matching
//! context, and the staged diff loop with propagation.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info};
use petgraph::graph::NodeIndex;
use petgraph::visit::EdgeRef;
use petgraph::Direction;

use crate::call_graph::Program;
use crate::counts::matched_edge_count;
use crate::error::{DiffError, DiffResult};
use crate::flow_graph::{Address, BasicBlock, FlowGraph};
use crate::matching::{
    find_basic_block_fixed_points, BoxedBasicBlockStep, MatchingRegistry, CALL_REFERENCE_MATCHING,
};

/// Change category assigned to every fixed point after matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Blocks, edges, and instructions all matched on both sides.
    Identical,
    /// Same block and edge structure with instruction-level differences.
    InstructionsChanged,
    /// Basic blocks or edges were added, removed, or rewired.
    StructureChanged,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChangeKind::Identical => "identical",
            ChangeKind::InstructionsChanged => "instructions changed",
            ChangeKind::StructureChanged => "structure changed",
        })
    }
}

/// A matched pair of basic blocks inside one function fixed point.
#[derive(Debug, Clone)]
pub struct BasicBlockFixedPoint {
    pub primary: NodeIndex,
    pub secondary: NodeIndex,
    pub step_name: &'static str,
    /// Ordered matched instruction address pairs.
    pub instruction_matches: Vec<(Address, Address)>,
}

/// A committed pair of corresponding functions plus the basic-block fixed
/// points discovered inside them.
#[derive(Debug, Clone)]
pub struct FixedPoint {
    pub primary: NodeIndex,
    pub secondary: NodeIndex,
    pub step_name: &'static str,
    pub basic_blocks: Vec<BasicBlockFixedPoint>,
    bb_by_primary: BTreeMap<NodeIndex, usize>,
    bb_by_secondary: BTreeMap<NodeIndex, usize>,
    pub change: Option<ChangeKind>,
}

impl FixedPoint {
    pub fn new(primary: NodeIndex, secondary: NodeIndex, step_name: &'static str) -> Self {
        Self {
            primary,
            secondary,
            step_name,
            basic_blocks: Vec::new(),
            bb_by_primary: BTreeMap::new(),
            bb_by_secondary: BTreeMap::new(),
            change: None,
        }
    }

    pub fn has_primary_block(&self, block: NodeIndex) -> bool {
        self.bb_by_primary.contains_key(&block)
    }

    pub fn has_secondary_block(&self, block: NodeIndex) -> bool {
        self.bb_by_secondary.contains_key(&block)
    }

    /// The secondary block matched to a primary block, if any.
    pub fn secondary_block_for(&self, primary: NodeIndex) -> Option<NodeIndex> {
        self.bb_by_primary
            .get(&primary)
            .map(|&i| self.basic_blocks[i].secondary)
    }

    pub fn instruction_match_count(&self) -> usize {
        self.basic_blocks
            .iter()
            .map(|pair| pair.instruction_matches.len())
            .sum()
    }

    pub(crate) fn add_basic_block(&mut self, pair: BasicBlockFixedPoint) -> bool {
        if self.has_primary_block(pair.primary) || self.has_secondary_block(pair.secondary) {
            return false;
        }
        let index = self.basic_blocks.len();
        self.bb_by_primary.insert(pair.primary, index);
        self.bb_by_secondary.insert(pair.secondary, index);
        self.basic_blocks.push(pair);
        true
    }
}

/// Bidirectional function correspondence store. Append-only within one
/// diff run; insertion marks both endpoints as matched.
#[derive(Debug, Default)]
pub struct FixedPointStore {
    points: Vec<FixedPoint>,
    by_primary: BTreeMap<NodeIndex, usize>,
    by_secondary: BTreeMap<NodeIndex, usize>,
}

impl FixedPointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn clear(&mut self) {
        self.points.clear();
        self.by_primary.clear();
        self.by_secondary.clear();
    }

    pub fn is_primary_matched(&self, vertex: NodeIndex) -> bool {
        self.by_primary.contains_key(&vertex)
    }

    pub fn is_secondary_matched(&self, vertex: NodeIndex) -> bool {
        self.by_secondary.contains_key(&vertex)
    }

    pub fn lookup_by_primary(&self, vertex: NodeIndex) -> Option<&FixedPoint> {
        self.by_primary.get(&vertex).map(|&i| &self.points[i])
    }

    pub fn lookup_by_secondary(&self, vertex: NodeIndex) -> Option<&FixedPoint> {
        self.by_secondary.get(&vertex).map(|&i| &self.points[i])
    }

    /// Inserts a fixed point, failing fast when either side is already
    /// matched.
    pub fn insert(&mut self, point: FixedPoint) -> DiffResult<usize> {
        if self.is_primary_matched(point.primary) || self.is_secondary_matched(point.secondary) {
            return Err(DiffError::InvariantViolation(format!(
                "duplicate fixed point insertion for vertices {:?} and {:?}",
                point.primary, point.secondary
            )));
        }
        let index = self.points.len();
        self.by_primary.insert(point.primary, index);
        self.by_secondary.insert(point.secondary, index);
        self.points.push(point);
        Ok(index)
    }

    pub fn point(&self, index: usize) -> &FixedPoint {
        &self.points[index]
    }

    pub fn point_mut(&mut self, index: usize) -> &mut FixedPoint {
        &mut self.points[index]
    }

    /// The vertex pair of a stored fixed point.
    pub fn pair(&self, index: usize) -> (NodeIndex, NodeIndex) {
        let point = &self.points[index];
        (point.primary, point.secondary)
    }

    /// Iterates fixed points in ascending primary address order.
    pub fn iter(&self) -> impl Iterator<Item = &FixedPoint> + '_ {
        self.by_primary.values().map(|&i| &self.points[i])
    }
}

/// Mutable working set during diffing. The two programs stay read-only;
/// all match state lives in the store.
pub struct MatchingContext<'a> {
    pub primary: &'a Program,
    pub secondary: &'a Program,
    pub fixed_points: FixedPointStore,
    /// Indices of fixed points discovered during the current rigor level.
    pub new_fixed_points: Vec<usize>,
}

impl<'a> MatchingContext<'a> {
    pub fn new(primary: &'a Program, secondary: &'a Program) -> Self {
        Self {
            primary,
            secondary,
            fixed_points: FixedPointStore::new(),
            new_fixed_points: Vec::new(),
        }
    }

    /// Creates a fixed point unless either side is already claimed.
    pub fn add_fixed_point(
        &mut self,
        primary: NodeIndex,
        secondary: NodeIndex,
        step_name: &'static str,
    ) -> Option<usize> {
        if self.fixed_points.is_primary_matched(primary)
            || self.fixed_points.is_secondary_matched(secondary)
        {
            return None;
        }
        let index = self
            .fixed_points
            .insert(FixedPoint::new(primary, secondary, step_name))
            .ok()?;
        self.new_fixed_points.push(index);
        debug!(
            "fixed point {:#x} <-> {:#x} via {}",
            self.primary.call_graph.vertex(primary).address,
            self.secondary.call_graph.vertex(secondary).address,
            step_name
        );
        Some(index)
    }

    /// Records a matched basic-block pair inside a function fixed point.
    pub fn add_basic_block_fixed_point(
        &mut self,
        fixed_point: usize,
        primary: NodeIndex,
        secondary: NodeIndex,
        step_name: &'static str,
        instruction_matches: Vec<(Address, Address)>,
    ) -> bool {
        self.fixed_points
            .point_mut(fixed_point)
            .add_basic_block(BasicBlockFixedPoint {
                primary,
                secondary,
                step_name,
                instruction_matches,
            })
    }

    /// The flow graphs on both sides of a stored fixed point.
    pub fn flow_graphs_of(&self, fixed_point: usize) -> (&'a FlowGraph, &'a FlowGraph) {
        let point = self.fixed_points.point(fixed_point);
        (
            self.primary.flow_graph_of(point.primary),
            self.secondary.flow_graph_of(point.secondary),
        )
    }

    pub fn unmatched_primary(&self) -> BTreeSet<NodeIndex> {
        self.primary
            .call_graph
            .vertices()
            .filter(|&v| !self.fixed_points.is_primary_matched(v))
            .collect()
    }

    pub fn unmatched_secondary(&self) -> BTreeSet<NodeIndex> {
        self.secondary
            .call_graph
            .vertices()
            .filter(|&v| !self.fixed_points.is_secondary_matched(v))
            .collect()
    }
}

/// Cooperative cancellation handle, checked between rigor levels.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

#[derive(Clone, Copy)]
enum Side {
    Primary,
    Secondary,
}

/// Functions reachable over non-duplicate out-edges that are still
/// unmatched on the given side.
fn unmatched_children(
    program: &Program,
    store: &FixedPointStore,
    side: Side,
    vertex: NodeIndex,
) -> BTreeSet<NodeIndex> {
    neighborhood(program, store, side, vertex, Direction::Outgoing)
}

/// Symmetric to [`unmatched_children`], over in-edges.
fn unmatched_parents(
    program: &Program,
    store: &FixedPointStore,
    side: Side,
    vertex: NodeIndex,
) -> BTreeSet<NodeIndex> {
    neighborhood(program, store, side, vertex, Direction::Incoming)
}

fn neighborhood(
    program: &Program,
    store: &FixedPointStore,
    side: Side,
    vertex: NodeIndex,
    direction: Direction,
) -> BTreeSet<NodeIndex> {
    let graph = program.call_graph.graph();
    let mut result = BTreeSet::new();
    for edge in graph.edges_directed(vertex, direction) {
        if edge.weight().duplicate {
            continue;
        }
        let other = match direction {
            Direction::Outgoing => edge.target(),
            Direction::Incoming => edge.source(),
        };
        let matched = match side {
            Side::Primary => store.is_primary_matched(other),
            Side::Secondary => store.is_secondary_matched(other),
        };
        if !matched {
            result.insert(other);
        }
    }
    result
}

/// Runs the staged matching algorithm.
///
/// The outer loop walks rigor levels, each a front-shortened prefix of
/// the call-graph step list with the prefix head as the active step. The
/// inner loop re-applies the active step to the child and parent
/// neighborhoods of every stored fixed point until nothing new turns up.
/// Re-iterating all fixed points rather than only fresh ones is
/// intentional: a previously ambiguous neighborhood may become unique
/// after a sibling is matched.
pub fn diff(
    context: &mut MatchingContext,
    registry: &MatchingRegistry,
    cancel: Option<&CancelToken>,
) -> DiffResult<()> {
    let steps = &registry.call_graph_steps;
    let basic_block_steps = &registry.basic_block_steps;

    for level in 0..steps.len() {
        if let Some(token) = cancel {
            if token.is_cancelled() {
                return Err(DiffError::Cancelled);
            }
        }
        let active = &steps[level];
        let remaining = &steps[level + 1..];
        context.new_fixed_points.clear();

        let primary_unmatched = context.unmatched_primary();
        let secondary_unmatched = context.unmatched_secondary();
        debug!(
            "{}: {} x {} unmatched candidates",
            active.name(),
            primary_unmatched.len(),
            secondary_unmatched.len()
        );
        active.find_fixed_points(
            None,
            &primary_unmatched,
            &secondary_unmatched,
            context,
            remaining,
            basic_block_steps,
        );

        loop {
            let mut discovered = false;

            // Propagate down to the children of all fixed points.
            for index in 0..context.fixed_points.len() {
                let (primary, secondary) = context.fixed_points.pair(index);
                let primary_children = unmatched_children(
                    context.primary,
                    &context.fixed_points,
                    Side::Primary,
                    primary,
                );
                let secondary_children = unmatched_children(
                    context.secondary,
                    &context.fixed_points,
                    Side::Secondary,
                    secondary,
                );
                if !primary_children.is_empty() && !secondary_children.is_empty() {
                    discovered |= active.find_fixed_points(
                        Some((primary, secondary)),
                        &primary_children,
                        &secondary_children,
                        context,
                        remaining,
                        basic_block_steps,
                    );
                }
            }

            // Propagate up to the parents.
            for index in 0..context.fixed_points.len() {
                let (primary, secondary) = context.fixed_points.pair(index);
                let primary_parents = unmatched_parents(
                    context.primary,
                    &context.fixed_points,
                    Side::Primary,
                    primary,
                );
                let secondary_parents = unmatched_parents(
                    context.secondary,
                    &context.fixed_points,
                    Side::Secondary,
                    secondary,
                );
                if !primary_parents.is_empty() && !secondary_parents.is_empty() {
                    discovered |= active.find_fixed_points(
                        Some((primary, secondary)),
                        &primary_parents,
                        &secondary_parents,
                        context,
                        remaining,
                        basic_block_steps,
                    );
                }
            }

            if !discovered {
                break;
            }
        }

        // Follow call sites out of this level's discoveries. The queue
        // grows while we walk it, so refinement chains are processed too.
        let mut i = 0;
        while i < context.new_fixed_points.len() {
            let index = context.new_fixed_points[i];
            find_call_reference_fixed_points(context, index, basic_block_steps);
            i += 1;
        }

        info!(
            "{}: {} fixed points total",
            active.name(),
            context.fixed_points.len()
        );
    }

    classify_changes(context);
    Ok(())
}

fn instruction_call_target(block: &BasicBlock, address: Address) -> Option<Address> {
    block
        .instructions
        .iter()
        .find(|instruction| instruction.address == address)
        .and_then(|instruction| instruction.call_target)
}

/// Walks the matched instruction pairs of a fixed point; where both
/// instructions are call sites whose targets are still unmatched, the
/// targets become a new fixed point.
fn find_call_reference_fixed_points(
    context: &mut MatchingContext,
    fixed_point: usize,
    basic_block_steps: &[BoxedBasicBlockStep],
) {
    let (primary_graph, secondary_graph) = context.flow_graphs_of(fixed_point);

    let pair_count = context.fixed_points.point(fixed_point).basic_blocks.len();
    for pair_index in 0..pair_count {
        let (primary_block, secondary_block, match_count) = {
            let pair = &context.fixed_points.point(fixed_point).basic_blocks[pair_index];
            (pair.primary, pair.secondary, pair.instruction_matches.len())
        };
        for match_index in 0..match_count {
            let (primary_address, secondary_address) = context.fixed_points.point(fixed_point)
                .basic_blocks[pair_index]
                .instruction_matches[match_index];
            let primary_target =
                instruction_call_target(primary_graph.block(primary_block), primary_address);
            let secondary_target =
                instruction_call_target(secondary_graph.block(secondary_block), secondary_address);
            let (Some(primary_target), Some(secondary_target)) =
                (primary_target, secondary_target)
            else {
                continue;
            };
            let Some(primary_vertex) = context.primary.call_graph.vertex_at(primary_target) else {
                continue;
            };
            let Some(secondary_vertex) = context.secondary.call_graph.vertex_at(secondary_target)
            else {
                continue;
            };
            if let Some(index) =
                context.add_fixed_point(primary_vertex, secondary_vertex, CALL_REFERENCE_MATCHING)
            {
                find_basic_block_fixed_points(context, index, basic_block_steps);
            }
        }
    }
}

/// Tags a fixed point with its change category. Pure over the fixed
/// point and its two flow graphs.
pub fn classify(point: &FixedPoint, primary: &FlowGraph, secondary: &FlowGraph) -> ChangeKind {
    let block_matches = point.basic_blocks.len();
    let instruction_matches = point.instruction_match_count();
    let edge_matches = matched_edge_count(point, primary, secondary) as usize;

    let blocks_complete =
        block_matches == primary.basic_block_count() && block_matches == secondary.basic_block_count();
    let edges_complete =
        edge_matches == primary.edge_count() && edge_matches == secondary.edge_count();
    let instructions_complete = instruction_matches == primary.instruction_count()
        && instruction_matches == secondary.instruction_count();

    if blocks_complete && edges_complete && instructions_complete {
        ChangeKind::Identical
    } else if blocks_complete && edges_complete {
        ChangeKind::InstructionsChanged
    } else {
        ChangeKind::StructureChanged
    }
}

fn classify_changes(context: &mut MatchingContext) {
    for index in 0..context.fixed_points.len() {
        let (primary, secondary) = context.fixed_points.pair(index);
        let primary_graph = context.primary.flow_graph_of(primary);
        let secondary_graph = context.secondary.flow_graph_of(secondary);
        let change = classify(context.fixed_points.point(index), primary_graph, secondary_graph);
        context.fixed_points.point_mut(index).change = Some(change);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_rejects_duplicate_insertions() {
        let mut store = FixedPointStore::new();
        let a = NodeIndex::new(0);
        let b = NodeIndex::new(1);
        let c = NodeIndex::new(2);
        store
            .insert(FixedPoint::new(a, b, "function: hash matching"))
            .expect("first insertion");
        let err = store
            .insert(FixedPoint::new(a, c, "function: hash matching"))
            .expect_err("duplicate primary");
        assert!(matches!(err, DiffError::InvariantViolation(_)));
        let err = store
            .insert(FixedPoint::new(c, b, "function: hash matching"))
            .expect_err("duplicate secondary");
        assert!(matches!(err, DiffError::InvariantViolation(_)));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn fixed_point_indexes_blocks_both_ways() {
        let mut point = FixedPoint::new(NodeIndex::new(0), NodeIndex::new(0), "test");
        assert!(point.add_basic_block(BasicBlockFixedPoint {
            primary: NodeIndex::new(1),
            secondary: NodeIndex::new(2),
            step_name: "basicBlock: hash matching",
            instruction_matches: vec![(0x10, 0x20)],
        }));
        assert!(!point.add_basic_block(BasicBlockFixedPoint {
            primary: NodeIndex::new(1),
            secondary: NodeIndex::new(3),
            step_name: "basicBlock: hash matching",
            instruction_matches: Vec::new(),
        }));
        assert!(point.has_primary_block(NodeIndex::new(1)));
        assert!(point.has_secondary_block(NodeIndex::new(2)));
        assert_eq!(point.secondary_block_for(NodeIndex::new(1)), Some(NodeIndex::new(2)));
        assert_eq!(point.instruction_match_count(), 1);
    }

    #[test]
    fn cancel_token_round_trip() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }
}
