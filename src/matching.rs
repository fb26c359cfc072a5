//! Matching steps: named strategies that propose fixed points from
//! candidate sets, ordered from highest to lowest precision.
//!
//! Every step buckets the unmatched candidates of both sides by a
//! per-step signature. A bucket with exactly one candidate on each side
//! becomes a fixed point; ambiguous buckets are handed to the next,
//! strictly weaker step for arbitration. The registry owning the ordered
//! step lists is threaded through the API so there is no process-global
//! mutable state.

use std::collections::{BTreeMap, BTreeSet};

use petgraph::graph::NodeIndex;

use crate::call_graph::Program;
use crate::diff::MatchingContext;
use crate::flow_graph::{Address, BasicBlock, FlowGraph};

/// Step name recorded for fixed points discovered through call-site
/// references. Not a registry member; its confidence lives in the
/// override table.
pub const CALL_REFERENCE_MATCHING: &str = "function: call reference matching";

/// Last-resort basic-block step, weighted zero in the confidence lookup.
pub const BASIC_BLOCK_PROPAGATION: &str = "basicBlock: propagation (size==1)";

/// Function-granularity matching strategy.
pub trait FunctionMatchingStep {
    fn name(&self) -> &'static str;

    /// Weight of matches found by this step, in [0, 1].
    fn confidence(&self) -> f64;

    /// Proposes fixed points from the candidate sets. `parents` is the
    /// fixed point whose neighborhood produced the candidates, when the
    /// call originates from propagation. `remaining_steps` holds the
    /// strictly weaker steps used to resolve ambiguous buckets. Returns
    /// whether any fixed point was created.
    fn find_fixed_points(
        &self,
        parents: Option<(NodeIndex, NodeIndex)>,
        primary_candidates: &BTreeSet<NodeIndex>,
        secondary_candidates: &BTreeSet<NodeIndex>,
        context: &mut MatchingContext,
        remaining_steps: &[BoxedFunctionStep],
        basic_block_steps: &[BoxedBasicBlockStep],
    ) -> bool;
}

/// Basic-block-granularity matching strategy, scoped to one function
/// fixed point.
pub trait BasicBlockMatchingStep {
    fn name(&self) -> &'static str;

    fn confidence(&self) -> f64;

    fn find_fixed_points(
        &self,
        fixed_point: usize,
        primary_candidates: &BTreeSet<NodeIndex>,
        secondary_candidates: &BTreeSet<NodeIndex>,
        context: &mut MatchingContext,
        remaining_steps: &[BoxedBasicBlockStep],
    ) -> bool;
}

pub type BoxedFunctionStep = Box<dyn FunctionMatchingStep + Send + Sync>;
pub type BoxedBasicBlockStep = Box<dyn BasicBlockMatchingStep + Send + Sync>;

/// Ordered step lists plus confidence overrides for step names that can
/// appear in histograms without being registry members.
pub struct MatchingRegistry {
    pub call_graph_steps: Vec<BoxedFunctionStep>,
    pub basic_block_steps: Vec<BoxedBasicBlockStep>,
    confidence_overrides: BTreeMap<&'static str, f64>,
}

impl Default for MatchingRegistry {
    fn default() -> Self {
        let mut confidence_overrides = BTreeMap::new();
        confidence_overrides.insert(CALL_REFERENCE_MATCHING, 0.75);
        confidence_overrides.insert(BASIC_BLOCK_PROPAGATION, 0.0);
        Self {
            call_graph_steps: vec![
                Box::new(FunctionHashMatching),
                Box::new(FunctionNameMatching),
                Box::new(FunctionMdIndexMatching),
                Box::new(FunctionCountsMatching),
                Box::new(FunctionNamePrefixMatching),
            ],
            basic_block_steps: vec![
                Box::new(BasicBlockHashMatching),
                Box::new(BasicBlockEntryPointMatching),
                Box::new(BasicBlockInstructionCountMatching),
                Box::new(BasicBlockPropagationMatching),
            ],
            confidence_overrides,
        }
    }
}

impl MatchingRegistry {
    /// Confidence weight for a histogram step name. Overrides win so that
    /// names produced outside the registries still resolve.
    pub fn confidence_for(&self, name: &str) -> f64 {
        if let Some(&confidence) = self.confidence_overrides.get(name) {
            return confidence;
        }
        for step in &self.call_graph_steps {
            if step.name() == name {
                return step.confidence();
            }
        }
        for step in &self.basic_block_steps {
            if step.name() == name {
                return step.confidence();
            }
        }
        0.0
    }
}

/// Buckets both candidate sets by `signature` and resolves them: unique
/// 1:1 buckets become fixed points, ambiguous buckets recurse into the
/// next remaining step.
fn match_functions_by_signature<K: Ord>(
    step_name: &'static str,
    parents: Option<(NodeIndex, NodeIndex)>,
    primary_candidates: &BTreeSet<NodeIndex>,
    secondary_candidates: &BTreeSet<NodeIndex>,
    context: &mut MatchingContext,
    remaining_steps: &[BoxedFunctionStep],
    basic_block_steps: &[BoxedBasicBlockStep],
    signature: impl Fn(&Program, NodeIndex) -> Option<K>,
) -> bool {
    let primary_program = context.primary;
    let secondary_program = context.secondary;

    let mut primary_buckets: BTreeMap<K, Vec<NodeIndex>> = BTreeMap::new();
    for &vertex in primary_candidates {
        if context.fixed_points.is_primary_matched(vertex) {
            continue;
        }
        if let Some(key) = signature(primary_program, vertex) {
            primary_buckets.entry(key).or_default().push(vertex);
        }
    }
    let mut secondary_buckets: BTreeMap<K, Vec<NodeIndex>> = BTreeMap::new();
    for &vertex in secondary_candidates {
        if context.fixed_points.is_secondary_matched(vertex) {
            continue;
        }
        if let Some(key) = signature(secondary_program, vertex) {
            secondary_buckets.entry(key).or_default().push(vertex);
        }
    }

    let mut found = false;
    for (key, primaries) in &primary_buckets {
        let Some(secondaries) = secondary_buckets.get(key) else {
            continue;
        };
        if primaries.len() == 1 && secondaries.len() == 1 {
            if let Some(index) = context.add_fixed_point(primaries[0], secondaries[0], step_name) {
                find_basic_block_fixed_points(context, index, basic_block_steps);
                found = true;
            }
        } else if let Some((next, rest)) = remaining_steps.split_first() {
            let primaries: BTreeSet<NodeIndex> = primaries.iter().copied().collect();
            let secondaries: BTreeSet<NodeIndex> = secondaries.iter().copied().collect();
            found |= next.find_fixed_points(
                parents,
                &primaries,
                &secondaries,
                context,
                rest,
                basic_block_steps,
            );
        }
    }
    found
}

/// Matches functions whose instruction byte streams are identical.
pub struct FunctionHashMatching;

impl FunctionMatchingStep for FunctionHashMatching {
    fn name(&self) -> &'static str {
        "function: hash matching"
    }

    fn confidence(&self) -> f64 {
        1.0
    }

    fn find_fixed_points(
        &self,
        parents: Option<(NodeIndex, NodeIndex)>,
        primary_candidates: &BTreeSet<NodeIndex>,
        secondary_candidates: &BTreeSet<NodeIndex>,
        context: &mut MatchingContext,
        remaining_steps: &[BoxedFunctionStep],
        basic_block_steps: &[BoxedBasicBlockStep],
    ) -> bool {
        match_functions_by_signature(
            self.name(),
            parents,
            primary_candidates,
            secondary_candidates,
            context,
            remaining_steps,
            basic_block_steps,
            |program, vertex| {
                let flow_graph = program.flow_graph_of(vertex);
                (flow_graph.instruction_count() > 0).then(|| flow_graph.byte_hash())
            },
        )
    }
}

/// Matches functions by display name, covering imports and stubs too.
pub struct FunctionNameMatching;

impl FunctionMatchingStep for FunctionNameMatching {
    fn name(&self) -> &'static str {
        "function: name matching"
    }

    fn confidence(&self) -> f64 {
        0.95
    }

    fn find_fixed_points(
        &self,
        parents: Option<(NodeIndex, NodeIndex)>,
        primary_candidates: &BTreeSet<NodeIndex>,
        secondary_candidates: &BTreeSet<NodeIndex>,
        context: &mut MatchingContext,
        remaining_steps: &[BoxedFunctionStep],
        basic_block_steps: &[BoxedBasicBlockStep],
    ) -> bool {
        match_functions_by_signature(
            self.name(),
            parents,
            primary_candidates,
            secondary_candidates,
            context,
            remaining_steps,
            basic_block_steps,
            |program, vertex| {
                let name = program.call_graph.vertex(vertex).display_name();
                (!name.is_empty()).then(|| name.to_owned())
            },
        )
    }
}

/// Matches functions with bit-equal MD-indices.
pub struct FunctionMdIndexMatching;

impl FunctionMatchingStep for FunctionMdIndexMatching {
    fn name(&self) -> &'static str {
        "function: MD index matching"
    }

    fn confidence(&self) -> f64 {
        0.9
    }

    fn find_fixed_points(
        &self,
        parents: Option<(NodeIndex, NodeIndex)>,
        primary_candidates: &BTreeSet<NodeIndex>,
        secondary_candidates: &BTreeSet<NodeIndex>,
        context: &mut MatchingContext,
        remaining_steps: &[BoxedFunctionStep],
        basic_block_steps: &[BoxedBasicBlockStep],
    ) -> bool {
        match_functions_by_signature(
            self.name(),
            parents,
            primary_candidates,
            secondary_candidates,
            context,
            remaining_steps,
            basic_block_steps,
            |program, vertex| {
                let flow_graph = program.flow_graph_of(vertex);
                (flow_graph.basic_block_count() > 0).then(|| flow_graph.md_index().to_bits())
            },
        )
    }
}

/// Matches functions with equal (edges, basic blocks, instructions)
/// count vectors.
pub struct FunctionCountsMatching;

impl FunctionMatchingStep for FunctionCountsMatching {
    fn name(&self) -> &'static str {
        "function: edges/basic blocks/instructions matching"
    }

    fn confidence(&self) -> f64 {
        0.7
    }

    fn find_fixed_points(
        &self,
        parents: Option<(NodeIndex, NodeIndex)>,
        primary_candidates: &BTreeSet<NodeIndex>,
        secondary_candidates: &BTreeSet<NodeIndex>,
        context: &mut MatchingContext,
        remaining_steps: &[BoxedFunctionStep],
        basic_block_steps: &[BoxedBasicBlockStep],
    ) -> bool {
        match_functions_by_signature(
            self.name(),
            parents,
            primary_candidates,
            secondary_candidates,
            context,
            remaining_steps,
            basic_block_steps,
            |program, vertex| {
                let flow_graph = program.flow_graph_of(vertex);
                (flow_graph.basic_block_count() > 0).then(|| {
                    (
                        flow_graph.edge_count(),
                        flow_graph.basic_block_count(),
                        flow_graph.instruction_count(),
                    )
                })
            },
        )
    }
}

/// Matches functions whose names agree after stripping trailing digits,
/// catching compiler-suffixed clones.
pub struct FunctionNamePrefixMatching;

impl FunctionMatchingStep for FunctionNamePrefixMatching {
    fn name(&self) -> &'static str {
        "function: name prefix matching"
    }

    fn confidence(&self) -> f64 {
        0.5
    }

    fn find_fixed_points(
        &self,
        parents: Option<(NodeIndex, NodeIndex)>,
        primary_candidates: &BTreeSet<NodeIndex>,
        secondary_candidates: &BTreeSet<NodeIndex>,
        context: &mut MatchingContext,
        remaining_steps: &[BoxedFunctionStep],
        basic_block_steps: &[BoxedBasicBlockStep],
    ) -> bool {
        match_functions_by_signature(
            self.name(),
            parents,
            primary_candidates,
            secondary_candidates,
            context,
            remaining_steps,
            basic_block_steps,
            |program, vertex| name_prefix(program.call_graph.vertex(vertex).display_name()),
        )
    }
}

fn name_prefix(name: &str) -> Option<String> {
    let trimmed = name.trim_end_matches(|c: char| c.is_ascii_digit());
    (trimmed.len() >= 5).then(|| trimmed.to_owned())
}

/// Buckets unmatched basic blocks of one function pair by `signature`.
fn match_basic_blocks_by_signature<K: Ord>(
    step_name: &'static str,
    fixed_point: usize,
    primary_candidates: &BTreeSet<NodeIndex>,
    secondary_candidates: &BTreeSet<NodeIndex>,
    context: &mut MatchingContext,
    remaining_steps: &[BoxedBasicBlockStep],
    signature: impl Fn(&FlowGraph, NodeIndex) -> Option<K>,
) -> bool {
    let (primary_graph, secondary_graph) = context.flow_graphs_of(fixed_point);

    let mut primary_buckets: BTreeMap<K, Vec<NodeIndex>> = BTreeMap::new();
    let mut secondary_buckets: BTreeMap<K, Vec<NodeIndex>> = BTreeMap::new();
    {
        let point = context.fixed_points.point(fixed_point);
        for &block in primary_candidates {
            if point.has_primary_block(block) {
                continue;
            }
            if let Some(key) = signature(primary_graph, block) {
                primary_buckets.entry(key).or_default().push(block);
            }
        }
        for &block in secondary_candidates {
            if point.has_secondary_block(block) {
                continue;
            }
            if let Some(key) = signature(secondary_graph, block) {
                secondary_buckets.entry(key).or_default().push(block);
            }
        }
    }

    let mut found = false;
    for (key, primaries) in &primary_buckets {
        let Some(secondaries) = secondary_buckets.get(key) else {
            continue;
        };
        if primaries.len() == 1 && secondaries.len() == 1 {
            let (primary, secondary) = (primaries[0], secondaries[0]);
            let instruction_matches =
                match_instructions(primary_graph.block(primary), secondary_graph.block(secondary));
            found |= context.add_basic_block_fixed_point(
                fixed_point,
                primary,
                secondary,
                step_name,
                instruction_matches,
            );
        } else if let Some((next, rest)) = remaining_steps.split_first() {
            let primaries: BTreeSet<NodeIndex> = primaries.iter().copied().collect();
            let secondaries: BTreeSet<NodeIndex> = secondaries.iter().copied().collect();
            found |= next.find_fixed_points(fixed_point, &primaries, &secondaries, context, rest);
        }
    }
    found
}

/// Matches basic blocks with identical instruction bytes.
pub struct BasicBlockHashMatching;

impl BasicBlockMatchingStep for BasicBlockHashMatching {
    fn name(&self) -> &'static str {
        "basicBlock: hash matching"
    }

    fn confidence(&self) -> f64 {
        1.0
    }

    fn find_fixed_points(
        &self,
        fixed_point: usize,
        primary_candidates: &BTreeSet<NodeIndex>,
        secondary_candidates: &BTreeSet<NodeIndex>,
        context: &mut MatchingContext,
        remaining_steps: &[BoxedBasicBlockStep],
    ) -> bool {
        match_basic_blocks_by_signature(
            self.name(),
            fixed_point,
            primary_candidates,
            secondary_candidates,
            context,
            remaining_steps,
            |graph, block| Some(graph.block(block).hash),
        )
    }
}

/// Pairs the entry blocks of a matched function pair.
pub struct BasicBlockEntryPointMatching;

impl BasicBlockMatchingStep for BasicBlockEntryPointMatching {
    fn name(&self) -> &'static str {
        "basicBlock: entry point matching"
    }

    fn confidence(&self) -> f64 {
        0.9
    }

    fn find_fixed_points(
        &self,
        fixed_point: usize,
        primary_candidates: &BTreeSet<NodeIndex>,
        secondary_candidates: &BTreeSet<NodeIndex>,
        context: &mut MatchingContext,
        remaining_steps: &[BoxedBasicBlockStep],
    ) -> bool {
        match_basic_blocks_by_signature(
            self.name(),
            fixed_point,
            primary_candidates,
            secondary_candidates,
            context,
            remaining_steps,
            |graph, block| (graph.entry() == Some(block)).then_some(()),
        )
    }
}

/// Matches basic blocks with equal instruction counts.
pub struct BasicBlockInstructionCountMatching;

impl BasicBlockMatchingStep for BasicBlockInstructionCountMatching {
    fn name(&self) -> &'static str {
        "basicBlock: instruction count matching"
    }

    fn confidence(&self) -> f64 {
        0.5
    }

    fn find_fixed_points(
        &self,
        fixed_point: usize,
        primary_candidates: &BTreeSet<NodeIndex>,
        secondary_candidates: &BTreeSet<NodeIndex>,
        context: &mut MatchingContext,
        remaining_steps: &[BoxedBasicBlockStep],
    ) -> bool {
        match_basic_blocks_by_signature(
            self.name(),
            fixed_point,
            primary_candidates,
            secondary_candidates,
            context,
            remaining_steps,
            |graph, block| Some(graph.block(block).instruction_count()),
        )
    }
}

/// Pairs the sole remaining unmatched block on each side.
pub struct BasicBlockPropagationMatching;

impl BasicBlockMatchingStep for BasicBlockPropagationMatching {
    fn name(&self) -> &'static str {
        BASIC_BLOCK_PROPAGATION
    }

    fn confidence(&self) -> f64 {
        0.0
    }

    fn find_fixed_points(
        &self,
        fixed_point: usize,
        primary_candidates: &BTreeSet<NodeIndex>,
        secondary_candidates: &BTreeSet<NodeIndex>,
        context: &mut MatchingContext,
        remaining_steps: &[BoxedBasicBlockStep],
    ) -> bool {
        match_basic_blocks_by_signature(
            self.name(),
            fixed_point,
            primary_candidates,
            secondary_candidates,
            context,
            remaining_steps,
            |_, _| Some(()),
        )
    }
}

/// Runs the basic-block step chain once over the candidate sets,
/// refiltering between levels because earlier steps may claim part of
/// the sets.
fn run_basic_block_chain(
    context: &mut MatchingContext,
    fixed_point: usize,
    steps: &[BoxedBasicBlockStep],
    primary_candidates: &BTreeSet<NodeIndex>,
    secondary_candidates: &BTreeSet<NodeIndex>,
) -> bool {
    let mut found = false;
    for level in 0..steps.len() {
        let point = context.fixed_points.point(fixed_point);
        let primaries: BTreeSet<NodeIndex> = primary_candidates
            .iter()
            .copied()
            .filter(|&block| !point.has_primary_block(block))
            .collect();
        let secondaries: BTreeSet<NodeIndex> = secondary_candidates
            .iter()
            .copied()
            .filter(|&block| !point.has_secondary_block(block))
            .collect();
        if primaries.is_empty() || secondaries.is_empty() {
            break;
        }
        found |= steps[level].find_fixed_points(
            fixed_point,
            &primaries,
            &secondaries,
            context,
            &steps[level + 1..],
        );
    }
    found
}

/// Matches the basic blocks of one function fixed point: a seed pass over
/// all blocks, then propagation along the neighborhoods of matched pairs
/// until a full sweep adds nothing.
pub fn find_basic_block_fixed_points(
    context: &mut MatchingContext,
    fixed_point: usize,
    steps: &[BoxedBasicBlockStep],
) {
    if steps.is_empty() {
        return;
    }
    let (primary_graph, secondary_graph) = context.flow_graphs_of(fixed_point);
    if primary_graph.basic_block_count() == 0 || secondary_graph.basic_block_count() == 0 {
        return;
    }

    let all_primary: BTreeSet<NodeIndex> = primary_graph.block_vertices().collect();
    let all_secondary: BTreeSet<NodeIndex> = secondary_graph.block_vertices().collect();
    run_basic_block_chain(context, fixed_point, steps, &all_primary, &all_secondary);

    loop {
        let mut discovered = false;
        let mut i = 0;
        while i < context.fixed_points.point(fixed_point).basic_blocks.len() {
            let (primary, secondary) = {
                let pair = &context.fixed_points.point(fixed_point).basic_blocks[i];
                (pair.primary, pair.secondary)
            };

            let point = context.fixed_points.point(fixed_point);
            let succ_primary: BTreeSet<NodeIndex> = primary_graph
                .successors(primary)
                .into_iter()
                .filter(|&block| !point.has_primary_block(block))
                .collect();
            let succ_secondary: BTreeSet<NodeIndex> = secondary_graph
                .successors(secondary)
                .into_iter()
                .filter(|&block| !point.has_secondary_block(block))
                .collect();
            if !succ_primary.is_empty() && !succ_secondary.is_empty() {
                discovered |= run_basic_block_chain(
                    context,
                    fixed_point,
                    steps,
                    &succ_primary,
                    &succ_secondary,
                );
            }

            let point = context.fixed_points.point(fixed_point);
            let pred_primary: BTreeSet<NodeIndex> = primary_graph
                .predecessors(primary)
                .into_iter()
                .filter(|&block| !point.has_primary_block(block))
                .collect();
            let pred_secondary: BTreeSet<NodeIndex> = secondary_graph
                .predecessors(secondary)
                .into_iter()
                .filter(|&block| !point.has_secondary_block(block))
                .collect();
            if !pred_primary.is_empty() && !pred_secondary.is_empty() {
                discovered |= run_basic_block_chain(
                    context,
                    fixed_point,
                    steps,
                    &pred_primary,
                    &pred_secondary,
                );
            }

            i += 1;
        }
        if !discovered {
            break;
        }
    }
}

/// Longest common subsequence over instruction byte-pattern digests,
/// yielding the ordered matched address pairs of two basic blocks.
pub(crate) fn match_instructions(
    primary: &BasicBlock,
    secondary: &BasicBlock,
) -> Vec<(Address, Address)> {
    let a: Vec<u64> = primary.instructions.iter().map(|i| i.pattern_hash).collect();
    let b: Vec<u64> = secondary
        .instructions
        .iter()
        .map(|i| i.pattern_hash)
        .collect();
    if a.is_empty() || b.is_empty() {
        return Vec::new();
    }

    let mut table = vec![vec![0u32; b.len() + 1]; a.len() + 1];
    for i in (0..a.len()).rev() {
        for j in (0..b.len()).rev() {
            table[i][j] = if a[i] == b[j] {
                table[i + 1][j + 1] + 1
            } else {
                table[i + 1][j].max(table[i][j + 1])
            };
        }
    }

    let (mut i, mut j) = (0, 0);
    let mut matches = Vec::new();
    while i < a.len() && j < b.len() {
        if a[i] == b[j] {
            matches.push((
                primary.instructions[i].address,
                secondary.instructions[j].address,
            ));
            i += 1;
            j += 1;
        } else if table[i + 1][j] >= table[i][j + 1] {
            i += 1;
        } else {
            j += 1;
        }
    }
    matches
}
