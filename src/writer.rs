//! Match database writer. Consumes a finished diff outcome; the engine
//! itself never persists anything.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use log::info;
use serde::{Deserialize, Serialize};

use crate::counts::Histogram;
use crate::error::{DiffError, DiffResult};
use crate::matching::MatchingRegistry;
use crate::similarity;
use crate::DiffOutcome;

/// Serialization format of the match database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Compact binary codec, the default the host launcher requests.
    Bin,
    /// Pretty-printed JSON for human inspection and tooling.
    Json,
}

impl OutputFormat {
    fn extension(self) -> &'static str {
        match self {
            OutputFormat::Bin => "matchdb",
            OutputFormat::Json => "json",
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "bin" => Ok(OutputFormat::Bin),
            "json" => Ok(OutputFormat::Json),
            other => Err(format!("unknown output format '{other}', expected bin or json")),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OutputFormat::Bin => "bin",
            OutputFormat::Json => "json",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchDatabaseMeta {
    pub created_at: String,
    pub tool_version: String,
    pub primary_binary: String,
    pub primary_hash: String,
    pub secondary_binary: String,
    pub secondary_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionMatchRecord {
    pub primary_address: u64,
    pub secondary_address: u64,
    pub primary_name: String,
    pub secondary_name: String,
    pub step: String,
    pub similarity: f64,
    pub confidence: f64,
    pub change: String,
    pub basic_block_matches: u64,
    pub instruction_matches: u64,
}

/// Everything a downstream consumer needs to render or re-score a diff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchDatabase {
    pub metadata: MatchDatabaseMeta,
    pub matches: Vec<FunctionMatchRecord>,
    pub counts: std::collections::BTreeMap<String, u64>,
    pub histogram: Histogram,
    pub similarity: f64,
    pub confidence: f64,
}

/// Builds the serializable match database from a finished outcome,
/// scoring each pair individually.
pub fn build_match_database(outcome: &DiffOutcome, registry: &MatchingRegistry) -> MatchDatabase {
    let primary_graph = &outcome.primary.call_graph;
    let secondary_graph = &outcome.secondary.call_graph;

    let mut matches = Vec::with_capacity(outcome.fixed_points.len());
    for point in outcome.fixed_points.iter() {
        let primary_flow = outcome.primary.flow_graph_of(point.primary);
        let secondary_flow = outcome.secondary.flow_graph_of(point.secondary);
        let mut pair_histogram = Histogram::new();
        crate::counts::count_fixed_point(
            point,
            primary_flow,
            secondary_flow,
            &mut pair_histogram,
        );
        matches.push(FunctionMatchRecord {
            primary_address: primary_graph.vertex(point.primary).address,
            secondary_address: secondary_graph.vertex(point.secondary).address,
            primary_name: primary_graph.vertex(point.primary).display_name().to_owned(),
            secondary_name: secondary_graph
                .vertex(point.secondary)
                .display_name()
                .to_owned(),
            step: point.step_name.to_owned(),
            similarity: similarity::flow_graph_similarity(
                primary_flow,
                secondary_flow,
                point,
                registry,
            ),
            confidence: similarity::confidence(&pair_histogram, registry),
            change: point
                .change
                .map(|change| change.to_string())
                .unwrap_or_else(|| "unclassified".to_owned()),
            basic_block_matches: point.basic_blocks.len() as u64,
            instruction_matches: point.instruction_match_count() as u64,
        });
    }

    MatchDatabase {
        metadata: MatchDatabaseMeta {
            created_at: chrono::Utc::now().to_rfc3339(),
            tool_version: env!("CARGO_PKG_VERSION").to_owned(),
            primary_binary: primary_graph.exe_filename().to_owned(),
            primary_hash: primary_graph.exe_hash().to_owned(),
            secondary_binary: secondary_graph.exe_filename().to_owned(),
            secondary_hash: secondary_graph.exe_hash().to_owned(),
        },
        matches,
        counts: outcome.counts.to_map(),
        histogram: outcome.histogram.clone(),
        similarity: outcome.similarity,
        confidence: outcome.confidence,
    }
}

fn database_stem(path: &Path, fallback: &str) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| fallback.to_owned())
}

/// Writes the match database into `output_dir`, named
/// `<primary>_vs_<secondary>` with a format-specific extension. Returns
/// the written path.
pub fn write_match_database(
    outcome: &DiffOutcome,
    registry: &MatchingRegistry,
    output_dir: &Path,
    format: OutputFormat,
) -> DiffResult<PathBuf> {
    let database = build_match_database(outcome, registry);
    let file_name = format!(
        "{}_vs_{}.{}",
        database_stem(&outcome.primary_path, "primary"),
        database_stem(&outcome.secondary_path, "secondary"),
        format.extension()
    );
    let path = output_dir.join(file_name);

    let io_error = |source| DiffError::Io {
        path: path.clone(),
        source,
    };
    fs::create_dir_all(output_dir).map_err(|source| DiffError::Io {
        path: output_dir.to_path_buf(),
        source,
    })?;
    let serialization_error = |err: String| {
        DiffError::InvariantViolation(format!("match database serialization failed: {err}"))
    };
    let bytes = match format {
        OutputFormat::Bin => {
            bincode::serialize(&database).map_err(|err| serialization_error(err.to_string()))?
        }
        OutputFormat::Json => serde_json::to_vec_pretty(&database)
            .map_err(|err| serialization_error(err.to_string()))?,
    };
    fs::write(&path, bytes).map_err(io_error)?;
    info!("wrote match database to {}", path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_format_parses_known_names() {
        assert_eq!("bin".parse::<OutputFormat>(), Ok(OutputFormat::Bin));
        assert_eq!("json".parse::<OutputFormat>(), Ok(OutputFormat::Json));
        assert!("xml".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn database_stem_falls_back_for_bare_paths() {
        assert_eq!(database_stem(Path::new("a/b/one.export"), "x"), "one");
        assert_eq!(database_stem(Path::new(""), "fallback"), "fallback");
    }
}
