//! End-to-end diff scenarios over synthetic exports.

mod common;

use std::collections::BTreeSet;
use std::path::Path;

use graphdiff::reader::ExportFile;
use graphdiff::{CancelToken, ChangeKind, DiffEngine, DiffError, DiffOutcome};

use common::{block, flow_graph, instr, sample_export, vertex, write_new_format};

fn store_snapshot(outcome: &DiffOutcome) -> Vec<(u64, u64, String, Vec<(u64, u64, usize)>)> {
    outcome
        .fixed_points
        .iter()
        .map(|point| {
            let primary = outcome.primary.call_graph.vertex(point.primary).address;
            let secondary = outcome.secondary.call_graph.vertex(point.secondary).address;
            let primary_flow = outcome.primary.flow_graph_of(point.primary);
            let secondary_flow = outcome.secondary.flow_graph_of(point.secondary);
            let blocks = point
                .basic_blocks
                .iter()
                .map(|pair| {
                    (
                        primary_flow.block(pair.primary).address,
                        secondary_flow.block(pair.secondary).address,
                        pair.instruction_matches.len(),
                    )
                })
                .collect();
            (primary, secondary, point.step_name.to_owned(), blocks)
        })
        .collect()
}

fn renamed_export() -> ExportFile {
    let mut export = sample_export();
    for vertex in &mut export.call_graph.vertices {
        vertex.name = match vertex.name.as_str() {
            "main" => "entry".to_owned(),
            "helper" => "assist".to_owned(),
            "leaf" => "tiny".to_owned(),
            other => other.to_owned(),
        };
    }
    export
}

fn extended_export() -> ExportFile {
    let mut export = sample_export();
    export.call_graph.vertices.push(vertex(0x6000, "extra_fn"));
    export.flow_graphs.push(flow_graph(
        0x6000,
        vec![
            block(
                0x6000,
                vec![instr(0x6000, &[0x41, 0x57]), instr(0x6002, &[0x41, 0x56])],
            ),
            block(
                0x6010,
                vec![instr(0x6010, &[0x41, 0x5e]), instr(0x6012, &[0xc3])],
            ),
        ],
        &[(0, 1)],
    ));
    // main calls the new function.
    export.call_graph.edges.push(graphdiff::reader::CallGraphEdgeRecord {
        source: 0,
        target: 4,
    });
    export
}

fn disjoint_primary() -> ExportFile {
    ExportFile {
        meta: graphdiff::reader::MetaRecord {
            input_binary: "alpha.bin".to_owned(),
            input_hash: "aaaa".to_owned(),
        },
        call_graph: common::call_graph(vec![vertex(0x1000, "aa")], &[]),
        flow_graphs: vec![flow_graph(
            0x1000,
            vec![
                block(0x1000, vec![instr(0x1000, &[0x11]), instr(0x1001, &[0x22])]),
                block(0x1010, vec![instr(0x1010, &[0x33])]),
            ],
            &[(0, 1)],
        )],
    }
}

fn disjoint_secondary() -> ExportFile {
    ExportFile {
        meta: graphdiff::reader::MetaRecord {
            input_binary: "beta.bin".to_owned(),
            input_hash: "bbbb".to_owned(),
        },
        call_graph: common::call_graph(vec![vertex(0x9000, "zz")], &[]),
        flow_graphs: vec![flow_graph(
            0x9000,
            vec![
                block(0x9000, vec![instr(0x9000, &[0xaa, 0xbb])]),
                block(0x9010, vec![instr(0x9010, &[0xcc])]),
                block(
                    0x9020,
                    vec![instr(0x9020, &[0xdd]), instr(0x9021, &[0xee])],
                ),
            ],
            &[(0, 1), (1, 2)],
        )],
    }
}

fn run(primary: &Path, secondary: &Path) -> DiffOutcome {
    DiffEngine::new().run(primary, secondary).expect("diff run")
}

#[test]
fn self_diff_is_the_identity() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = write_new_format(dir.path(), "sample.export", &sample_export());
    let outcome = run(&path, &path);

    assert_eq!(outcome.similarity, 1.0);
    assert!(outcome.confidence > 0.9);
    assert_eq!(outcome.fixed_points.len(), outcome.primary.function_count());
    assert_eq!(
        outcome.counts.matches.total_basic_blocks(),
        outcome.counts.primary.total_basic_blocks()
    );
    assert_eq!(
        outcome.counts.matches.total_instructions(),
        outcome.counts.primary.total_instructions()
    );
    for point in outcome.fixed_points.iter() {
        assert_eq!(point.change, Some(ChangeKind::Identical));
    }
}

#[test]
fn fixed_points_are_unique_per_side() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = write_new_format(dir.path(), "sample.export", &sample_export());
    let outcome = run(&path, &path);

    let primaries: BTreeSet<_> = outcome.fixed_points.iter().map(|p| p.primary).collect();
    let secondaries: BTreeSet<_> = outcome.fixed_points.iter().map(|p| p.secondary).collect();
    assert_eq!(primaries.len(), outcome.fixed_points.len());
    assert_eq!(secondaries.len(), outcome.fixed_points.len());

    for point in outcome.fixed_points.iter() {
        let by_primary = outcome.fixed_points.lookup_by_primary(point.primary);
        assert_eq!(by_primary.map(|p| p.secondary), Some(point.secondary));
        let by_secondary = outcome.fixed_points.lookup_by_secondary(point.secondary);
        assert_eq!(by_secondary.map(|p| p.primary), Some(point.primary));
    }
}

#[test]
fn renamed_functions_still_match_structurally() {
    let dir = tempfile::TempDir::new().unwrap();
    let primary = write_new_format(dir.path(), "primary.export", &sample_export());
    let secondary = write_new_format(dir.path(), "secondary.export", &renamed_export());
    let outcome = run(&primary, &secondary);

    assert_eq!(outcome.fixed_points.len(), outcome.primary.function_count());
    assert!(outcome.confidence >= 0.9, "confidence {}", outcome.confidence);
    assert_eq!(outcome.similarity, 1.0);
    // The bodies are byte-identical, so hash matching claims them.
    assert_eq!(outcome.histogram.get("function: hash matching"), Some(&3));
}

#[test]
fn added_function_leaves_other_matches_intact() {
    let dir = tempfile::TempDir::new().unwrap();
    let primary = write_new_format(dir.path(), "primary.export", &sample_export());
    let secondary = write_new_format(dir.path(), "secondary.export", &extended_export());
    let outcome = run(&primary, &secondary);

    assert_eq!(outcome.primary.function_count(), 4);
    assert_eq!(outcome.secondary.function_count(), 5);
    assert_eq!(outcome.fixed_points.len(), 4);
    assert!(outcome.similarity < 1.0);
    assert!(outcome.similarity > 0.5, "similarity {}", outcome.similarity);
}

#[test]
fn disjoint_programs_share_nothing() {
    let dir = tempfile::TempDir::new().unwrap();
    let primary = write_new_format(dir.path(), "alpha.export", &disjoint_primary());
    let secondary = write_new_format(dir.path(), "beta.export", &disjoint_secondary());
    let outcome = run(&primary, &secondary);

    assert!(outcome.fixed_points.is_empty());
    assert_eq!(outcome.confidence, 0.0);
    assert_eq!(outcome.similarity, 0.0);
}

#[test]
fn identical_inputs_give_identical_stores() {
    let dir = tempfile::TempDir::new().unwrap();
    let primary = write_new_format(dir.path(), "primary.export", &sample_export());
    let secondary = write_new_format(dir.path(), "secondary.export", &renamed_export());

    let first = run(&primary, &secondary);
    let second = run(&primary, &secondary);
    assert_eq!(store_snapshot(&first), store_snapshot(&second));
    assert_eq!(first.histogram, second.histogram);
    assert_eq!(first.similarity, second.similarity);
    assert_eq!(first.confidence, second.confidence);
}

#[test]
fn cancellation_aborts_between_rigor_levels() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = write_new_format(dir.path(), "sample.export", &sample_export());

    let token = CancelToken::new();
    token.cancel();
    let err = DiffEngine::new()
        .run_with_cancel(&path, &path, Some(&token))
        .unwrap_err();
    assert!(matches!(err, DiffError::Cancelled), "{err}");
}

#[test]
fn match_database_round_trips_through_bin_format() {
    let dir = tempfile::TempDir::new().unwrap();
    let primary = write_new_format(dir.path(), "primary.export", &sample_export());
    let secondary = write_new_format(dir.path(), "secondary.export", &renamed_export());

    let engine = DiffEngine::new();
    let outcome = engine.run(&primary, &secondary).expect("diff run");
    let out_dir = dir.path().join("results");
    let written = graphdiff::writer::write_match_database(
        &outcome,
        engine.registry(),
        &out_dir,
        graphdiff::OutputFormat::Bin,
    )
    .expect("write database");

    assert_eq!(
        written.file_name().and_then(|n| n.to_str()),
        Some("primary_vs_secondary.matchdb")
    );
    let bytes = std::fs::read(&written).expect("read database");
    let database: graphdiff::writer::MatchDatabase =
        bincode::deserialize(&bytes).expect("decode database");
    assert_eq!(database.matches.len(), 4);
    assert_eq!(database.similarity, outcome.similarity);
    assert_eq!(database.metadata.primary_binary, "sample.bin");
    for record in &database.matches {
        assert!(record.similarity > 0.0);
        assert_eq!(record.change, "identical");
    }
}
