//! sluice CLI - staged corpus filtering and MinHash deduplication.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{generate, Shell};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use sluice_core::{Compression, HashAlgorithm, HashConfig, LocalStorage, Precision, StorageBackend};
use sluice_dedup::{DedupReport, MinhashConfig, MinhashDedup};
use sluice_pipeline::filters::{FilterStep, TextContainsFilter};
use sluice_pipeline::readers::{JsonlReader, ParquetReader, ReaderOptions};
use sluice_pipeline::writers::JsonlWriter;
use sluice_pipeline::{ExecutionReport, ExecutorConfig, PipelineExecutor, PipelineStep};
use tracing_subscriber::EnvFilter;

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// JSON summary of one stage.
#[derive(Serialize)]
struct StageOutput {
    stage: String,
    tasks: usize,
    executed: usize,
    skipped: usize,
    elapsed_secs: f64,
}

impl From<&ExecutionReport> for StageOutput {
    fn from(report: &ExecutionReport) -> Self {
        Self {
            stage: report.stage.clone(),
            tasks: report.tasks,
            executed: report.executed.len(),
            skipped: report.skipped.len(),
            elapsed_secs: report.elapsed_secs,
        }
    }
}

/// JSON output for a dedup run.
#[derive(Serialize)]
struct MinhashOutput {
    input: String,
    output: String,
    kept: u64,
    removed: u64,
    tokens: u64,
    resumed: bool,
    elapsed_secs: f64,
    stages: Vec<StageOutput>,
}

/// JSON output for a filter run.
#[derive(Serialize)]
struct FilterOutput {
    input: String,
    output: String,
    kept: u64,
    dropped: u64,
    stage: StageOutput,
}

/// Input file format.
#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
enum Format {
    /// Parquet if the folder holds any `.parquet` file, JSONL otherwise
    Auto,
    /// JSON Lines, optionally zstd or lz4 compressed
    Jsonl,
    /// Apache Parquet
    Parquet,
}

/// Staged corpus processing: filtering and MinHash near-duplicate removal.
#[derive(Parser, Debug)]
#[command(name = "sluice")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose (debug) logging. `RUST_LOG` takes precedence.
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Remove near-duplicate documents with the four-stage MinHash pipeline
    Minhash(MinhashArgs),
    /// Keep only documents whose text contains a substring
    Filter(FilterArgs),
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args, Debug, Clone)]
struct InputArgs {
    /// Input folder of JSONL or Parquet files.
    #[arg(value_name = "INPUT")]
    input: PathBuf,

    /// Output folder for JSONL shards.
    #[arg(short, long, value_name = "OUTPUT")]
    output: PathBuf,

    /// Input format.
    #[arg(long, value_enum, default_value = "auto")]
    format: Format,

    /// Field/column holding the document text.
    #[arg(short = 'f', long, default_value = "text")]
    text_key: String,

    /// Field/column holding the document id.
    #[arg(long, default_value = "id")]
    id_key: String,

    /// Maximum documents read per task.
    #[arg(long)]
    limit: Option<usize>,

    /// Number of tasks (input shards).
    #[arg(short, long, default_value = "1")]
    tasks: usize,

    /// Concurrent workers (default: one per task).
    #[arg(short, long)]
    workers: Option<usize>,

    /// Random startup delay per task, in seconds.
    #[arg(long, default_value = "0")]
    jitter: u64,

    /// Output results as JSON.
    #[arg(long)]
    json: bool,

    /// Show a progress spinner.
    #[arg(long)]
    progress: bool,
}

#[derive(Args, Debug)]
struct MinhashArgs {
    #[command(flatten)]
    io: InputArgs,

    /// Folder for signatures, buckets, removal set and logs.
    #[arg(long, value_name = "DIR")]
    work_dir: PathBuf,

    /// Number of LSH buckets (bands).
    #[arg(short = 'b', long, default_value = "14")]
    buckets: usize,

    /// Hashes per bucket.
    #[arg(short = 'r', long, default_value = "8")]
    hashes_per_bucket: usize,

    /// N-gram size for shingling, in words.
    #[arg(short = 'n', long, default_value = "5")]
    ngram: usize,

    /// Seed of the hash permutations.
    #[arg(long, default_value = "1")]
    seed: u64,

    /// Shingle hash function (xxhash or sha1).
    #[arg(long, default_value = "xxhash")]
    hash: HashAlgorithm,

    /// Hash precision in bits (32 or 64).
    #[arg(long, default_value = "64")]
    precision: u32,

    /// Bucket-stage tasks per bucket.
    #[arg(long, default_value = "1")]
    workers_per_bucket: usize,

    /// Write cluster ids and annotate kept documents with them.
    #[arg(long)]
    save_cluster_ids: bool,

    /// Write removed documents to this folder.
    #[arg(long, value_name = "DIR")]
    exclusion_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct FilterArgs {
    #[command(flatten)]
    io: InputArgs,

    /// Substring every kept document must contain.
    #[arg(long)]
    contains: String,

    /// Match case-insensitively.
    #[arg(short = 'i', long)]
    ignore_case: bool,

    /// Logging folder with completion markers (default: OUTPUT/../logs/filter).
    #[arg(long, value_name = "DIR")]
    logging_dir: Option<PathBuf>,

    /// Write dropped documents to this folder.
    #[arg(long, value_name = "DIR")]
    exclusion_dir: Option<PathBuf>,

    /// Output compression (none, zstd, lz4, gzip).
    #[arg(long, default_value = "none")]
    compression: Compression,
}

/// Create a spinner for indeterminate progress.
fn create_spinner(msg: &str) -> CliResult<ProgressBar> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} {msg}")?);
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    Ok(pb)
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()))
        .with_writer(io::stderr)
        .init();
}

fn detect_format(input: &Path, format: Format) -> CliResult<Format> {
    if format != Format::Auto {
        return Ok(format);
    }
    let keys = LocalStorage::new(input)?.list("")?;
    Ok(if keys.iter().any(|k| k.ends_with(".parquet")) {
        Format::Parquet
    } else {
        Format::Jsonl
    })
}

/// A reader step for `args`, built fresh for every executor that needs one.
fn build_reader(
    args: &InputArgs,
    format: Format,
) -> sluice_pipeline::Result<Box<dyn PipelineStep>> {
    let options = ReaderOptions {
        text_key: args.text_key.clone(),
        id_key: args.id_key.clone(),
        limit: args.limit,
        ..ReaderOptions::default()
    };
    Ok(match format {
        Format::Parquet => Box::new(ParquetReader::new(&args.input)?.with_options(options)),
        Format::Auto | Format::Jsonl => {
            Box::new(JsonlReader::new(&args.input)?.with_options(options))
        }
    })
}

fn run_minhash(args: MinhashArgs) -> CliResult<()> {
    let start = Instant::now();
    let format = detect_format(&args.io.input, args.io.format)?;
    let config = MinhashConfig {
        num_buckets: args.buckets,
        hashes_per_bucket: args.hashes_per_bucket,
        n_grams: args.ngram,
        seed: args.seed,
        hash_config: HashConfig::new(args.hash, Precision::try_from(args.precision)?),
    };

    let reader_args = args.io.clone();
    let mut dedup = MinhashDedup::new(
        config,
        move || build_reader(&reader_args, format),
        &args.work_dir,
        &args.io.output,
    )
    .with_tasks(args.io.tasks)
    .with_workers(args.io.workers)
    .with_workers_per_bucket(args.workers_per_bucket)
    .with_cluster_ids(args.save_cluster_ids)
    .with_start_jitter(args.io.jitter);
    if let Some(dir) = &args.exclusion_dir {
        dedup = dedup.with_exclusion_dir(dir);
    }

    let pb = if args.io.progress && !args.io.json {
        Some(create_spinner("Preparing MinHash dedup...")?)
    } else {
        None
    };
    let report = dedup.run_with(|executor| {
        if let Some(pb) = &pb {
            pb.set_message(format!("Running stage '{}'...", executor.config().name));
        }
    });
    if let Some(pb) = pb {
        pb.finish_and_clear();
    }
    let report = report?;

    print_minhash(&args.io, &report, start.elapsed().as_secs_f64())
}

fn print_minhash(args: &InputArgs, report: &DedupReport, elapsed_secs: f64) -> CliResult<()> {
    if args.json {
        let output = MinhashOutput {
            input: args.input.display().to_string(),
            output: args.output.display().to_string(),
            kept: report.kept(),
            removed: report.removed(),
            tokens: report.tokens(),
            resumed: report.fully_resumed(),
            elapsed_secs,
            stages: report.stages.iter().map(StageOutput::from).collect(),
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    eprintln!();
    eprintln!("MinHash Deduplication Results:");
    for stage in &report.stages {
        eprintln!(
            "  {:<12} {} executed, {} skipped ({:.2}s)",
            stage.stage,
            stage.executed.len(),
            stage.skipped.len(),
            stage.elapsed_secs
        );
    }
    eprintln!();
    if report.fully_resumed() {
        eprintln!("All stages were already complete; nothing was rerun.");
    } else {
        eprintln!("  Kept documents:    {}", report.kept());
        eprintln!("  Removed documents: {}", report.removed());
        eprintln!("  Tokens before:     {}", report.tokens());
    }
    eprintln!();
    eprintln!("Total time: {elapsed_secs:.3}s");
    Ok(())
}

fn run_filter(args: FilterArgs) -> CliResult<()> {
    let io_args = &args.io;
    let format = detect_format(&io_args.input, io_args.format)?;

    let mut filter = TextContainsFilter::new(&args.contains);
    if args.ignore_case {
        filter = filter.case_insensitive();
    }
    let mut step = FilterStep::new(filter);
    if let Some(dir) = &args.exclusion_dir {
        step = step.with_exclusion_writer(JsonlWriter::new(dir)?);
    }

    let logging_dir = args.logging_dir.clone().unwrap_or_else(|| {
        io_args
            .output
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("logs")
            .join("filter")
    });
    let executor = PipelineExecutor::new(
        vec![
            build_reader(io_args, format)?,
            Box::new(step),
            Box::new(JsonlWriter::new(&io_args.output)?.with_compression(args.compression)),
        ],
        ExecutorConfig::new("filter", io_args.tasks, logging_dir)
            .with_workers(io_args.workers)
            .with_start_jitter(io_args.jitter),
    );

    let pb = if io_args.progress && !io_args.json {
        Some(create_spinner("Filtering documents...")?)
    } else {
        None
    };
    let report = executor.run();
    if let Some(pb) = pb {
        pb.finish_and_clear();
    }
    let report = report?;

    let counters = report.stats.step("text_contains");
    let kept = counters.map_or(0, |s| s.counter("kept"));
    let dropped = counters.map_or(0, |s| s.counter("dropped"));
    if io_args.json {
        let output = FilterOutput {
            input: io_args.input.display().to_string(),
            output: io_args.output.display().to_string(),
            kept,
            dropped,
            stage: StageOutput::from(&report),
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        eprintln!();
        eprintln!("Filter Results:");
        eprintln!(
            "  Tasks:             {} executed, {} skipped",
            report.executed.len(),
            report.skipped.len()
        );
        eprintln!("  Kept documents:    {kept}");
        eprintln!("  Dropped documents: {dropped}");
        eprintln!("  Processing time:   {:.3}s", report.elapsed_secs);
    }
    Ok(())
}

fn main() -> CliResult<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "sluice", &mut io::stdout());
            Ok(())
        }
        Commands::Minhash(args) => {
            init_logging(cli.verbose);
            run_minhash(args)
        }
        Commands::Filter(args) => {
            init_logging(cli.verbose);
            run_filter(args)
        }
    }
}
