mod bitmaps;
mod report;

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use heapfold_components::ComponentTree;
use heapfold_fold::AnalyzerConfig;
use itertools::Itertools;
use mimalloc::MiMalloc;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

use crate::report::Report;

// The folding passes allocate and drop millions of small maps.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Summarize which components of an application dominate its heap.
///
/// Loads an HPROF heap dump, folds the object graph reachable from the
/// root class down to the objects that carry architectural weight, and
/// reports their sizes by object, by type and by class-name component.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,

    /// Heap dump to analyze (HPROF)
    snapshot: PathBuf,

    /// JSON analyzer configuration overriding the defaults
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Class whose instances are the roots of the analysis
    #[arg(short, long)]
    root_class: Option<String>,

    /// Report format
    #[arg(long, value_enum, default_value_t = Format::Text)]
    format: Format,

    /// List the N largest surviving objects
    #[arg(long, value_name = "N", default_value_t = 0)]
    objects: usize,

    /// Limit the component tree to this many levels below the root
    #[arg(long)]
    depth: Option<usize>,

    /// Decode bitmaps and write them as PNG files into this directory
    #[arg(long, value_name = "DIR")]
    bitmaps: Option<PathBuf>,

    /// Output file path (writes to stdout if not specified)
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Text,
    Json,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Logs go to stderr so the report on stdout stays clean for piping.
    const CRATES: &[&str] = &[
        "heapfold",
        "heapfold_components",
        "heapfold_fold",
        "heapfold_snapshot",
    ];
    let level = cli.verbose.tracing_level_filter();
    let allowlist = CRATES.iter().map(|c| format!("{c}={level}")).join(",");
    let filter = EnvFilter::new(format!("warn,{allowlist}"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_span_events(FmtSpan::CLOSE)
        .init();

    if !cli.snapshot.is_file() {
        eprintln!("File {} not found", cli.snapshot.display());
        return Ok(ExitCode::FAILURE);
    }

    let mut config = match &cli.config {
        Some(path) => AnalyzerConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => AnalyzerConfig::default(),
    };
    if let Some(root_class) = cli.root_class {
        config.root_class_name = root_class;
    }

    let analysis =
        heapfold_fold::analyze_file(&cli.snapshot, &config, cli.bitmaps.is_some())?;
    let tree = ComponentTree::build(&analysis.graph, &analysis.survivors);

    if let Some(dir) = &cli.bitmaps {
        bitmaps::write_pngs(dir, &analysis.graph, &analysis.bitmaps)?;
    }

    let report = Report::new(
        &analysis,
        &tree,
        cli.objects,
        cli.depth,
        &config.bitmap.class_name,
    );

    // Stdout must outlive the lock, so we bind it here first.
    let stdout = std::io::stdout();
    let mut writer: Box<dyn Write> = match &cli.output {
        Some(path) => Box::new(BufWriter::new(
            File::create(path)
                .with_context(|| format!("failed to create {}", path.display()))?,
        )),
        None => Box::new(stdout.lock()),
    };
    match cli.format {
        Format::Text => report.write_text(&mut *writer)?,
        Format::Json => report.write_json(&mut *writer)?,
    }
    writer.flush()?;

    Ok(ExitCode::SUCCESS)
}
