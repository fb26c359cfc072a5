//! graphdiff compares two disassembled-binary exports and produces a
//! structural matching between their functions, basic blocks, and
//! instructions, together with a confidence-weighted similarity score.
//!
//! The library reads two export files into program models (call graphs
//! owning flow graphs), runs the staged matching algorithm over them,
//! and summarizes the resulting fixed-point set. A separate writer
//! serializes the match database; the engine itself persists nothing.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};

pub mod call_graph;
pub mod counts;
pub mod diff;
pub mod error;
pub mod flow_graph;
pub mod matching;
pub mod reader;
pub mod report;
pub mod similarity;
pub mod writer;

pub use call_graph::{CallEdge, CallGraph, FunctionVertex, Program};
pub use counts::{DiffCounts, GraphCounts, Histogram, MatchCounts};
pub use diff::{
    CancelToken, ChangeKind, BasicBlockFixedPoint, FixedPoint, FixedPointStore, MatchingContext,
};
pub use error::{DiffError, DiffResult};
pub use flow_graph::{Address, BasicBlock, FlowGraph, Instruction, InstructionCache};
pub use matching::MatchingRegistry;
pub use reader::{read_export, FlowGraphInfo, FlowGraphInfos};
pub use writer::OutputFormat;

/// Everything a diff run produces: both program models, the fixed-point
/// store, the aggregated counts and histogram, and the summary scores.
#[derive(Debug)]
pub struct DiffOutcome {
    pub primary: Program,
    pub secondary: Program,
    pub primary_path: PathBuf,
    pub secondary_path: PathBuf,
    pub primary_infos: FlowGraphInfos,
    pub secondary_infos: FlowGraphInfos,
    pub fixed_points: FixedPointStore,
    pub counts: DiffCounts,
    pub histogram: Histogram,
    pub confidence: f64,
    pub similarity: f64,
}

/// Owns the matching registry and the shared instruction cache, and
/// drives read + diff + score for a pair of export files.
///
/// The cache is cleared when the engine is dropped, on success and
/// failure alike.
pub struct DiffEngine {
    registry: MatchingRegistry,
    instruction_cache: Arc<InstructionCache>,
}

impl DiffEngine {
    pub fn new() -> Self {
        Self::with_registry(MatchingRegistry::default())
    }

    pub fn with_registry(registry: MatchingRegistry) -> Self {
        Self {
            registry,
            instruction_cache: Arc::new(InstructionCache::new()),
        }
    }

    pub fn registry(&self) -> &MatchingRegistry {
        &self.registry
    }

    pub fn instruction_cache(&self) -> &Arc<InstructionCache> {
        &self.instruction_cache
    }

    /// Reads both exports, diffs them, and summarizes the result.
    pub fn run(&self, primary: &Path, secondary: &Path) -> DiffResult<DiffOutcome> {
        self.run_with_cancel(primary, secondary, None)
    }

    /// Like [`DiffEngine::run`] with cooperative cancellation, checked
    /// between rigor levels.
    pub fn run_with_cancel(
        &self,
        primary_path: &Path,
        secondary_path: &Path,
        cancel: Option<&CancelToken>,
    ) -> DiffResult<DiffOutcome> {
        // The two files are independent; load them in parallel against
        // the shared instruction cache.
        let cache = self.instruction_cache.as_ref();
        let (primary_result, secondary_result) = rayon::join(
            || read_export(primary_path, cache),
            || read_export(secondary_path, cache),
        );
        let (primary, primary_infos) = primary_result?;
        let (secondary, secondary_infos) = secondary_result?;
        info!(
            "loaded {} primary and {} secondary functions",
            primary.function_count(),
            secondary.function_count()
        );

        let mut context = MatchingContext::new(&primary, &secondary);
        diff::diff(&mut context, &self.registry, cancel)?;

        let (counts, histogram) = counts::gather_counts(&context);
        let confidence = similarity::confidence(&histogram, &self.registry);
        let similarity =
            similarity::program_similarity(&primary, &secondary, &counts, confidence);
        info!(
            "diff finished: {} fixed points, similarity {:.4}, confidence {:.4}",
            context.fixed_points.len(),
            similarity,
            confidence
        );

        let MatchingContext { fixed_points, .. } = context;
        Ok(DiffOutcome {
            primary,
            secondary,
            primary_path: primary_path.to_path_buf(),
            secondary_path: secondary_path.to_path_buf(),
            primary_infos,
            secondary_infos,
            fixed_points,
            counts,
            histogram,
            confidence,
            similarity,
        })
    }
}

impl Default for DiffEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DiffEngine {
    fn drop(&mut self) {
        debug!(
            "clearing instruction cache ({} patterns)",
            self.instruction_cache.len()
        );
        self.instruction_cache.clear();
    }
}
