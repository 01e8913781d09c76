//! The `sliceprove` binary: parse the property, prepare the program, run
//! the verification schedule, print the verdict.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sliceprove_adapters::adapter_by_name;
use sliceprove_pipeline::PipelineConfig;
use sliceprove_portfolio::{PortfolioConfig, PortfolioError, PortfolioScheduler};
use sliceprove_process::CancelToken;
use sliceprove_property::{Property, PropertyError};
use sliceprove_result::Verdict;
use sliceprove_witness::{find_error_test, witness_assignments, Ktest};

#[derive(Parser, Debug)]
#[command(
    name = "sliceprove",
    about = "Slice a C program and verify it with a portfolio of backends",
    version
)]
struct Cli {
    /// Property to verify: a keyword, an LTL formula, or a .prp file.
    /// Defaults to assertion reachability.
    #[arg(long = "prp")]
    prp: Option<String>,

    /// Verification backend.
    #[arg(long, default_value = "klee")]
    tool: String,

    /// Wall-clock budget in seconds for the whole run.
    #[arg(long)]
    timeout: Option<u64>,

    /// Verify as a 32-bit program.
    #[arg(long = "32")]
    bit32: bool,

    /// Unroll every loop N times before any other transformation.
    #[arg(long, value_name = "N")]
    bound: Option<u32>,

    /// Skip program slicing.
    #[arg(long)]
    no_slice: bool,

    /// Slice this many times, re-optimizing in between.
    #[arg(long, default_value_t = 1, value_name = "N")]
    repeat_slicing: u32,

    /// Fail instead of falling back to the unsliced program when the slicer
    /// fails.
    #[arg(long)]
    require_slicer: bool,

    /// Keep the scratch directory after the run.
    #[arg(long)]
    save_files: bool,

    /// C sources to verify.
    #[arg(required = true)]
    sources: Vec<PathBuf>,
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Property(#[from] PropertyError),
    #[error("unknown tool `{0}`; expected klee, cbmc or nidhugg")]
    UnknownTool(String),
    #[error("source file {0}: {1}")]
    Source(PathBuf, std::io::Error),
    #[error("cannot create scratch directory: {0}")]
    Scratch(std::io::Error),
    #[error(transparent)]
    Portfolio(#[from] PortfolioError),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(verdict) => {
            println!("RESULT: {verdict}");
            std::process::exit(verdict.exit_code());
        }
        Err(CliError::Portfolio(PortfolioError::Interrupted)) => {
            eprintln!("sliceprove: interrupted");
            std::process::exit(130);
        }
        Err(err) => {
            eprintln!("sliceprove: {err}");
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> Result<Verdict, CliError> {
    let property = Arc::new(match &cli.prp {
        Some(spec) => Property::parse(spec)?,
        None => Property::default_assertions(),
    });
    let adapter = adapter_by_name(&cli.tool, Arc::clone(&property))
        .ok_or_else(|| CliError::UnknownTool(cli.tool.clone()))?;

    // commands run inside the scratch directory, so sources must be absolute
    let mut sources = Vec::with_capacity(cli.sources.len());
    for source in &cli.sources {
        let absolute = std::fs::canonicalize(source)
            .map_err(|err| CliError::Source(source.clone(), err))?;
        sources.push(absolute);
    }

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, terminating");
                cancel.cancel();
            }
        });
    }

    let scratch = tempfile::Builder::new()
        .prefix("sliceprove-")
        .tempdir()
        .map_err(CliError::Scratch)?;
    let work_root = scratch.path().to_path_buf();
    info!(dir = %work_root.display(), tool = %cli.tool, "starting");

    let pipeline = PipelineConfig {
        is_32bit: cli.bit32,
        no_slice: cli.no_slice,
        require_slicer: cli.require_slicer,
        repeat_slicing: cli.repeat_slicing,
        unroll_count: cli.bound.unwrap_or(0),
        ..PipelineConfig::default()
    };
    let config = PortfolioConfig {
        pipeline,
        budget: cli.timeout.map(Duration::from_secs),
        memory_mib: None,
        property_file: property.property_file().map(Path::to_path_buf),
    };

    let verdict = PortfolioScheduler::new(config)
        .with_cancel(cancel)
        .run(adapter, &sources, &work_root)
        .await?;

    if matches!(verdict, Verdict::False(_)) {
        print_witness(&work_root);
    }

    if cli.save_files {
        let kept = scratch.into_path();
        info!(dir = %kept.display(), "scratch directory kept");
    }
    Ok(verdict)
}

/// Dump the KLEE counterexample assignments, when there are any.
fn print_witness(work_root: &Path) {
    let Ok(entries) = std::fs::read_dir(work_root) else {
        return;
    };
    for entry in entries.flatten() {
        let output_dir = entry.path().join("klee-last");
        if !output_dir.is_dir() {
            continue;
        }
        let Some(test) = find_error_test(&output_dir) else {
            continue;
        };
        match Ktest::from_file(&test) {
            Ok(ktest) => {
                let assignments = witness_assignments(&ktest);
                if assignments.is_empty() {
                    continue;
                }
                println!("Error path assignments ({}):", test.display());
                for assignment in assignments {
                    println!(
                        "  {} = {} (line {})",
                        assignment.variable, assignment.value, assignment.line
                    );
                }
                return;
            }
            Err(err) => warn!(test = %test.display(), "cannot decode test case: {err}"),
        }
    }
}
