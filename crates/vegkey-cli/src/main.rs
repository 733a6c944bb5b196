/// Command-line front end for the reclassification engine.
///
/// `run` streams a manifest to its output raster, `check` validates a manifest
/// without reading pixels, `lint` reviews a catalog on its own.
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use vegkey_core::{lint, BlockShape, Catalog, FindingKind, Manifest, RunOptions};

// ── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "vegkey", version, about = "Rule-catalog raster reclassification")]
struct Cli {
    /// Log at debug level (overrides RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Evaluate a manifest and write its output raster
    Run {
        /// Path to the run manifest (JSON)
        manifest: PathBuf,

        /// Override the manifest's block height in pixels
        #[arg(long)]
        block_rows: Option<usize>,

        /// Override the manifest's block width in pixels
        #[arg(long)]
        block_cols: Option<usize>,

        /// Worker threads (default: one per core)
        #[arg(short = 'j', long)]
        threads: Option<usize>,

        /// Process windows one at a time on the calling thread
        #[arg(long)]
        sequential: bool,

        /// Maximum number of progress updates
        #[arg(long, default_value = "100")]
        progress: usize,
    },
    /// Validate a manifest: layers, grid, catalog, mask and output type
    Check {
        manifest: PathBuf,
    },
    /// Report disabled, dead and flagged rules in a catalog
    Lint {
        catalog: PathBuf,

        /// Exit non-zero on dead or unparsable rules
        #[arg(long)]
        strict: bool,

        /// Print findings as a JSON array
        #[arg(long)]
        json: bool,
    },
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

// ── Commands ─────────────────────────────────────────────────────────────────

fn run(
    manifest_path: PathBuf,
    block_rows: Option<usize>,
    block_cols: Option<usize>,
    threads: Option<usize>,
    sequential: bool,
    progress: usize,
) -> Result<()> {
    let manifest = Manifest::load(&manifest_path)
        .with_context(|| format!("Cannot load manifest {}", manifest_path.display()))?;
    let block = BlockShape::new(
        block_rows.unwrap_or(manifest.block.rows),
        block_cols.unwrap_or(manifest.block.cols),
    );

    let mut pipeline = manifest.pipeline().context("Validation failed")?;
    let sink = manifest.sink(&pipeline)?;
    let mut options = RunOptions::default().with_block(block);
    options.threads = threads;
    options.progress_updates = progress;
    if sequential {
        options = options.sequential();
    }

    let summary = pipeline.run(&sink, &options).context("Run failed")?;

    eprintln!(
        "[vegkey] {} windows in {:.2}s → {}",
        summary.windows,
        summary.elapsed.as_secs_f64(),
        manifest.output_path().display()
    );
    let nodata = pipeline.engine().output().nodata_code();
    for (code, count) in &summary.histogram {
        if *code != nodata {
            eprintln!("  {code:>6}  {count}");
        }
    }
    Ok(())
}

fn check(manifest_path: PathBuf) -> Result<()> {
    let manifest = Manifest::load(&manifest_path)
        .with_context(|| format!("Cannot load manifest {}", manifest_path.display()))?;
    let pipeline = manifest.pipeline().context("Validation failed")?;

    let grid = pipeline.registry().reference();
    let catalog = pipeline.engine().catalog();
    info!(
        width = grid.width,
        height = grid.height,
        crs = %grid.crs,
        layers = pipeline.registry().len(),
        slots = catalog.slots.len(),
        rules = catalog.rules.len(),
        enabled = catalog.enabled_rules().count(),
        findings = pipeline.findings().len(),
        "manifest is valid"
    );
    Ok(())
}

fn lint_catalog(path: PathBuf, strict: bool, json: bool) -> Result<()> {
    let catalog = Catalog::load(&path).with_context(|| format!("Cannot load catalog {}", path.display()))?;
    let findings = lint(&catalog);
    if json {
        println!("{}", serde_json::to_string_pretty(&findings)?);
    } else {
        for f in &findings {
            println!("{f}");
        }
    }
    eprintln!("[vegkey] {}: {} rules, {} findings", catalog.name, catalog.rule_count(), findings.len());

    let fatal = findings
        .iter()
        .filter(|f| matches!(f.kind, FindingKind::DeadRule | FindingKind::Syntax))
        .count();
    if strict && fatal > 0 {
        bail!("{fatal} dead or unparsable rules in {}", path.display());
    }
    Ok(())
}

// ── Main ──────────────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Command::Run { manifest, block_rows, block_cols, threads, sequential, progress } => {
            run(manifest, block_rows, block_cols, threads, sequential, progress)
        }
        Command::Check { manifest } => check(manifest),
        Command::Lint { catalog, strict, json } => lint_catalog(catalog, strict, json),
    }
}
