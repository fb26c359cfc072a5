use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use graphdiff::writer::{self, OutputFormat};
use graphdiff::{report, DiffEngine};

/// Structural diff for disassembled-binary exports.
///
/// The binary is intentionally thin: it parses arguments, runs the diff
/// engine from the library, prints the report, and optionally writes the
/// match database for downstream consumers.
#[derive(Parser, Debug)]
#[command(
    name = "graphdiff",
    version,
    about = "Structural diff for disassembled-binary exports",
    long_about = None
)]
struct Args {
    /// Primary (older) export file.
    #[arg(long)]
    primary: PathBuf,

    /// Secondary (newer) export file.
    #[arg(long)]
    secondary: PathBuf,

    /// Directory receiving the match database. Nothing is written when
    /// omitted.
    #[arg(long = "output_dir")]
    output_dir: Option<PathBuf>,

    /// Match database format: bin or json.
    #[arg(long = "output_format", default_value = "bin")]
    output_format: OutputFormat,

    /// Suppress the version banner.
    #[arg(long)]
    nologo: bool,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    if !args.nologo {
        println!("graphdiff {}", env!("CARGO_PKG_VERSION"));
    }

    let engine = DiffEngine::new();
    let outcome = engine
        .run(&args.primary, &args.secondary)
        .with_context(|| {
            format!(
                "diffing {} vs {}",
                args.primary.display(),
                args.secondary.display()
            )
        })?;

    print!("{}", report::generate_text_report(&outcome, engine.registry()));

    if let Some(output_dir) = &args.output_dir {
        let path = writer::write_match_database(
            &outcome,
            engine.registry(),
            output_dir,
            args.output_format,
        )?;
        println!("Match database: {}", path.display());
    }

    Ok(())
}
