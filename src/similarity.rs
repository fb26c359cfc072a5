//! Confidence and similarity scoring over counts and histograms.

use crate::call_graph::Program;
use crate::counts::{count_fixed_point, DiffCounts, Histogram};
use crate::diff::FixedPoint;
use crate::flow_graph::FlowGraph;
use crate::matching::MatchingRegistry;

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

fn average(a: u64, b: u64) -> f64 {
    0.5 * (a as f64 + b as f64)
}

/// Squashed weighted mean of per-step confidences, weighted by the
/// histogram's match counts. An empty histogram yields zero.
pub fn confidence(histogram: &Histogram, registry: &MatchingRegistry) -> f64 {
    let mut weighted = 0.0;
    let mut matches = 0.0;
    for (name, &count) in histogram {
        weighted += count as f64 * registry.confidence_for(name);
        matches += count as f64;
    }
    if matches == 0.0 {
        return 0.0;
    }
    sigmoid((weighted / matches - 0.5) * 10.0)
}

fn md_index_term(primary: f64, secondary: f64) -> f64 {
    1.0 - (primary - secondary).abs() / (1.0 + primary + secondary)
}

/// Similarity of one matched function pair. Library functions are
/// included at this granularity; the score is damped by the confidence
/// of the pair's own step histogram.
pub fn flow_graph_similarity(
    primary: &FlowGraph,
    secondary: &FlowGraph,
    point: &FixedPoint,
    registry: &MatchingRegistry,
) -> f64 {
    let mut histogram = Histogram::new();
    let matches = count_fixed_point(point, primary, secondary, &mut histogram);

    let basic_block_matches = matches.total_basic_blocks();
    let instruction_matches = matches.total_instructions();
    let edge_matches = matches.total_edges();
    let basic_blocks_primary = primary.basic_block_count() as u64;
    let basic_blocks_secondary = secondary.basic_block_count() as u64;
    let instructions_primary = primary.instruction_count() as u64;
    let instructions_secondary = secondary.instruction_count() as u64;
    let edges_primary = primary.edge_count() as u64;
    let edges_secondary = secondary.edge_count() as u64;

    if basic_block_matches == basic_blocks_primary
        && basic_block_matches == basic_blocks_secondary
        && instruction_matches == instructions_primary
        && instruction_matches == instructions_secondary
    {
        return 1.0;
    }

    let mut similarity = 0.0;
    similarity +=
        0.55 * edge_matches as f64 / average(edges_primary, edges_secondary).max(1.0);
    similarity += 0.30 * basic_block_matches as f64
        / average(basic_blocks_primary, basic_blocks_secondary).max(1.0);
    similarity += 0.15 * instruction_matches as f64
        / average(instructions_primary, instructions_secondary).max(1.0);
    similarity = similarity.min(1.0);
    similarity += md_index_term(primary.md_index(), secondary.md_index());
    similarity /= 2.0;
    similarity * confidence(&histogram, registry)
}

/// Whole-program similarity over non-library counts, damped by the
/// whole-diff confidence. Library functions are excluded so they do not
/// inflate the score. A fully matched pair of programs scores exactly
/// 1.0.
pub fn program_similarity(
    primary: &Program,
    secondary: &Program,
    counts: &DiffCounts,
    confidence: f64,
) -> f64 {
    let matches = &counts.matches;
    let p = &counts.primary;
    let s = &counts.secondary;

    if matches.functions == p.functions
        && matches.functions == s.functions
        && matches.basic_blocks == p.basic_blocks
        && matches.basic_blocks == s.basic_blocks
        && matches.instructions == p.instructions
        && matches.instructions == s.instructions
        && matches.edges == p.edges
        && matches.edges == s.edges
    {
        return 1.0;
    }

    let mut similarity = 0.0;
    similarity += 0.35 * matches.edges as f64 / average(p.edges, s.edges).max(1.0);
    similarity +=
        0.25 * matches.basic_blocks as f64 / average(p.basic_blocks, s.basic_blocks).max(1.0);
    similarity += 0.10 * matches.functions as f64 / average(p.functions, s.functions).max(1.0);
    similarity +=
        0.10 * matches.instructions as f64 / average(p.instructions, s.instructions).max(1.0);
    similarity += 0.20
        * md_index_term(
            primary.call_graph.md_index(),
            secondary.call_graph.md_index(),
        );
    similarity = similarity.min(1.0);
    similarity * confidence
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_histogram_has_zero_confidence() {
        let registry = MatchingRegistry::default();
        assert_eq!(confidence(&Histogram::new(), &registry), 0.0);
    }

    #[test]
    fn pure_high_confidence_matches_saturate() {
        let registry = MatchingRegistry::default();
        let mut histogram = Histogram::new();
        histogram.insert("function: hash matching".to_owned(), 10);
        let value = confidence(&histogram, &registry);
        assert!(value > 0.99, "got {value}");
    }

    #[test]
    fn more_high_confidence_matches_increase_confidence() {
        let registry = MatchingRegistry::default();
        let mut mixed = Histogram::new();
        mixed.insert("function: hash matching".to_owned(), 3);
        mixed.insert("function: name prefix matching".to_owned(), 5);
        let before = confidence(&mixed, &registry);

        mixed.insert("function: hash matching".to_owned(), 4);
        let after = confidence(&mixed, &registry);
        assert!(after > before, "{after} <= {before}");
    }

    #[test]
    fn md_index_term_is_one_for_equal_indices() {
        assert_eq!(md_index_term(2.5, 2.5), 1.0);
        assert!(md_index_term(2.5, 5.0) < 1.0);
    }
}
