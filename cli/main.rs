#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use eigensweep::shared::files::{
    FileError, RunSummary, ramp_matrix, read_matrix_file, write_matrix_text, write_sorted_indices,
};
use eigensweep::{
    ExecutionMode, JobStatus, PcaConfig, PcaError, PcaJob, PcaProgressObserver, PcaResult,
    PcaStage, run_with_progress,
};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Timeout applied when neither the command line nor the config sets one.
const DEFAULT_TIMEOUT_SECS: u64 = 600;

// ========================================================================================
//                                   Command line
// ========================================================================================

#[derive(Clone, Copy, ValueEnum)]
pub enum ModeCli {
    Auto,
    Dense,
    Streamed,
}

impl From<ModeCli> for ExecutionMode {
    fn from(mode: ModeCli) -> Self {
        match mode {
            ModeCli::Auto => ExecutionMode::Auto,
            ModeCli::Dense => ExecutionMode::Dense,
            ModeCli::Streamed => ExecutionMode::Streamed,
        }
    }
}

#[derive(Args)]
pub struct RunArgs {
    /// Number of rows (variables) in the input matrix
    #[arg(short = 'i', long = "rows", value_name = "R")]
    pub rows: usize,

    /// Number of columns (observations) in the input matrix
    #[arg(short = 'j', long = "cols", value_name = "C")]
    pub cols: usize,

    /// Raw row-major byte file; a counting ramp is generated when omitted
    #[arg(long, value_name = "FILE")]
    pub input: Option<PathBuf>,

    /// TOML configuration file
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Write the final S matrix as text
    #[arg(short = 'S', long = "output-s", value_name = "FILE")]
    pub output_s: Option<PathBuf>,

    /// Write the accumulated U matrix as text
    #[arg(short = 'U', long = "output-u", value_name = "FILE")]
    pub output_u: Option<PathBuf>,

    /// Write the accumulated V matrix as text
    #[arg(short = 'V', long = "output-v", value_name = "FILE")]
    pub output_v: Option<PathBuf>,

    /// Write the ranked eigenvalue indices as text
    #[arg(short = 'E', long = "output-sort", value_name = "FILE")]
    pub output_sort: Option<PathBuf>,

    /// Write a TOML summary of the run
    #[arg(long, value_name = "FILE")]
    pub summary: Option<PathBuf>,

    /// Number of ranked eigenvalues (defaults to the config value, capped at the row count)
    #[arg(long, value_name = "K")]
    pub components: Option<usize>,

    /// Number of Jacobi sweeps
    #[arg(long, value_name = "N")]
    pub sweeps: Option<usize>,

    /// Stop early once the off-diagonal norm drops to this value
    #[arg(long, value_name = "EPS")]
    pub tolerance: Option<f64>,

    #[arg(long, value_enum)]
    pub mode: Option<ModeCli>,

    /// Scratch file for the memory-mapped store used by streamed runs
    #[arg(long, value_name = "FILE")]
    pub scratch: Option<PathBuf>,

    /// Give up after this many seconds
    #[arg(short = 't', long = "timeout", value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Hide progress bars
    #[arg(long)]
    pub quiet: bool,
}

#[derive(Parser)]
#[command(
    name = "eigensweep",
    version,
    about = "Covariance and Jacobi eigendecomposition of byte matrices"
)]
struct Cli {
    /// Enable debug logging
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute covariance, eigendecomposition and ranking for one input matrix
    Run(RunArgs),
    /// Print the default configuration as TOML
    DefaultConfig,
}

#[derive(Error, Debug)]
enum CliError {
    #[error(transparent)]
    Pca(#[from] PcaError),
    #[error(transparent)]
    File(#[from] FileError),
}

// ========================================================================================
//                                      Progress
// ========================================================================================

struct BarProgress {
    bar: Option<ProgressBar>,
    enabled: bool,
}

impl BarProgress {
    fn new(enabled: bool) -> Self {
        Self { bar: None, enabled }
    }
}

fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };
    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    let style = ProgressStyle::with_template(
        "> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("█▉▊▋▌▍▎▏  ");
    pb.set_style(style);
    pb.set_message(message.to_string());
    pb
}

impl PcaProgressObserver for BarProgress {
    fn on_stage_start(&mut self, stage: PcaStage, total: usize) {
        if self.enabled {
            self.bar = Some(create_progress_bar(total as u64, stage.describe()));
        }
    }

    fn on_stage_advance(&mut self, stage: PcaStage, processed: usize) {
        let _ = stage;
        if let Some(bar) = &self.bar {
            bar.set_position(processed as u64);
        }
    }

    fn on_stage_finish(&mut self, stage: PcaStage) {
        let _ = stage;
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }
}

// ========================================================================================
//                                       Driver
// ========================================================================================

fn resolve_config(args: &RunArgs) -> Result<PcaConfig, PcaError> {
    let mut config = match &args.config {
        Some(path) => PcaConfig::load(path)?,
        None => PcaConfig::default(),
    };
    if let Some(sweeps) = args.sweeps {
        config.sweeps = sweeps;
    }
    if let Some(tolerance) = args.tolerance {
        config.tolerance = Some(tolerance);
    }
    if let Some(mode) = args.mode {
        config.execution = mode.into();
    }
    if let Some(scratch) = &args.scratch {
        config.scratch_path = Some(scratch.clone());
    }
    match args.components {
        Some(components) => config.components = components,
        None if config.components > args.rows => {
            log::warn!(
                "Ranking {} eigenvalues instead of {} because the input has only {} rows",
                args.rows,
                config.components,
                args.rows
            );
            config.components = args.rows;
        }
        None => {}
    }
    config.timeout_secs = args
        .timeout
        .or(config.timeout_secs)
        .or(Some(DEFAULT_TIMEOUT_SECS));
    config.validate()?;
    Ok(config)
}

fn write_outputs(args: &RunArgs, result: &PcaResult) -> Result<(), FileError> {
    let matrices = [
        (&args.output_s, &result.s),
        (&args.output_u, &result.u),
        (&args.output_v, &result.v),
    ];
    for (path, matrix) in matrices {
        if let Some(path) = path {
            write_matrix_text(path, matrix.view())?;
        }
    }
    if let Some(path) = &args.output_sort {
        write_sorted_indices(path, &result.ranking.indices)?;
    }
    Ok(())
}

fn write_summary(
    path: &Path,
    args: &RunArgs,
    result: &PcaResult,
    elapsed: Duration,
) -> Result<(), FileError> {
    RunSummary::new(
        args.rows,
        args.cols,
        result.mode,
        &result.report,
        &result.ranking,
        elapsed.as_micros() as u64,
    )
    .save(path)
}

fn run_pca(args: RunArgs) -> Result<(), CliError> {
    let config = resolve_config(&args)?;
    let input = match &args.input {
        Some(path) => read_matrix_file(path, args.rows, args.cols)?,
        None => {
            log::info!("No input file given; using a {}x{} counting ramp", args.rows, args.cols);
            ramp_matrix(args.rows, args.cols)
        }
    };

    let started = Instant::now();
    let job = PcaJob::from_config(input.view(), &config);
    let mut progress = BarProgress::new(!args.quiet);
    let outcome = run_with_progress(job, &config, &mut progress);
    let elapsed = started.elapsed();

    let status = JobStatus::from_result(&outcome);
    println!("PCA finished with {} status, took {} usec", status.label(), elapsed.as_micros());
    let result = outcome?;

    write_outputs(&args, &result)?;
    if let Some(path) = &args.summary {
        write_summary(path, &args, &result, elapsed)?;
    }
    for (rank, (value, index)) in result.ranking.iter().enumerate() {
        println!("  #{:<3} row {index:<6} eigenvalue {value:.6}", rank + 1);
    }
    Ok(())
}

fn print_default_config() -> Result<(), CliError> {
    println!("{}", PcaConfig::default().to_toml()?);
    Ok(())
}

fn main() {
    let Cli { verbose, command } = Cli::parse();
    let default_level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    let result = match command {
        Some(Commands::Run(args)) => run_pca(args),
        Some(Commands::DefaultConfig) => print_default_config(),
        None => {
            if Cli::command().print_help().is_err() {
                process::exit(2);
            }
            println!();
            Ok(())
        }
    };

    if let Err(err) = result {
        eprintln!("\nError: {err}");
        process::exit(JobStatus::Failure.exit_code());
    }
}
