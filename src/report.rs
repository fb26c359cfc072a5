//! Plain-text summary of a finished diff, rendered by the CLI.

use std::fmt::Write as _;

use crate::matching::MatchingRegistry;
use crate::similarity;
use crate::DiffOutcome;

/// Renders the human-readable report: summary scores, step histogram,
/// and the per-function match table in ascending primary address order.
pub fn generate_text_report(outcome: &DiffOutcome, registry: &MatchingRegistry) -> String {
    let mut report = String::new();
    let rule = "=".repeat(60);

    let _ = writeln!(report, "{rule}");
    let _ = writeln!(report, "                 BINARY DIFF RESULTS");
    let _ = writeln!(report, "{rule}");
    let _ = writeln!(report);
    let _ = writeln!(
        report,
        "Primary:   {} ({})",
        outcome.primary.call_graph.exe_filename(),
        outcome.primary.call_graph.exe_hash()
    );
    let _ = writeln!(
        report,
        "Secondary: {} ({})",
        outcome.secondary.call_graph.exe_filename(),
        outcome.secondary.call_graph.exe_hash()
    );
    let _ = writeln!(report);
    let _ = writeln!(report, "Similarity: {:.4}", outcome.similarity);
    let _ = writeln!(report, "Confidence: {:.4}", outcome.confidence);
    let _ = writeln!(
        report,
        "Matches:    {} of {} primary / {} secondary functions",
        outcome.fixed_points.len(),
        outcome.primary.function_count(),
        outcome.secondary.function_count()
    );
    let _ = writeln!(report);

    let _ = writeln!(report, "MATCHING STEPS:");
    for (step, count) in &outcome.histogram {
        let _ = writeln!(report, "  {count:>6}  {step}");
    }
    let _ = writeln!(report);

    let _ = writeln!(report, "COUNTS:");
    for (name, value) in outcome.counts.to_map() {
        let _ = writeln!(report, "  {value:>8}  {name}");
    }
    let _ = writeln!(report);

    let _ = writeln!(report, "FUNCTION MATCHES:");
    let _ = writeln!(report, "{}", "-".repeat(60));
    for point in outcome.fixed_points.iter() {
        let primary = outcome.primary.call_graph.vertex(point.primary);
        let secondary = outcome.secondary.call_graph.vertex(point.secondary);
        let primary_flow = outcome.primary.flow_graph_of(point.primary);
        let secondary_flow = outcome.secondary.flow_graph_of(point.secondary);
        let pair_similarity =
            similarity::flow_graph_similarity(primary_flow, secondary_flow, point, registry);
        let change = point
            .change
            .map(|change| change.to_string())
            .unwrap_or_else(|| "unclassified".to_owned());
        let _ = writeln!(
            report,
            "{:#012x} <-> {:#012x}  {:.4}  {:<20}  {}",
            primary.address,
            secondary.address,
            pair_similarity,
            change,
            primary.display_name()
        );
        let _ = writeln!(
            report,
            "    {} blocks, {} instructions via {}",
            point.basic_blocks.len(),
            point.instruction_match_count(),
            point.step_name
        );
    }
    report
}
