//! scatter CLI - weight-balanced parallel test suite runner.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

use scatter::config::{self, DiscoveryConfig, RunConfig};
use scatter::discovery::{ExplicitSource, GlobSource, SuiteSource};
use scatter::executor::Orchestrator;
use scatter::results::{RecordWriter, SuiteRecord, WORKER_ENV, write_marker};
use scatter::weights::{self, WeightStore};

/// Default configuration file, used when present and `--config` is not
/// given.
const DEFAULT_CONFIG: &str = "scatter.toml";

#[derive(Parser)]
#[command(name = "scatter")]
#[command(about = "Weight-balanced parallel test suite runner", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run test suites across parallel workers
    Run(RunArgs),

    /// Discover suites and show their weights without running them
    Collect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Validate the configuration file
    Validate,

    /// Append one suite result record to the results area
    ///
    /// Intended for reporter integrations running inside a worker
    /// process.
    Record(RecordArgs),

    /// Write a worker's completion marker
    Complete(CompleteArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Override worker count
    #[arg(short, long)]
    workers: Option<usize>,

    /// Exit on the first worker finishing with errors
    #[arg(short, long)]
    bail: bool,

    /// Tolerate collected results not covering every discovered suite
    #[arg(long)]
    no_strict: bool,

    /// Runner script to execute (e.g. an npm script)
    #[arg(short, long)]
    script: Option<String>,

    /// Extra arguments passed through to the runner
    #[arg(short, long)]
    args: Option<String>,

    /// Explicit suite paths, bypassing pattern discovery
    #[arg(long)]
    spec: Vec<String>,

    /// Glob pattern used to find suites
    #[arg(short, long)]
    pattern: Option<String>,

    /// Reporter enabled alongside the stream reporter
    #[arg(short, long)]
    reporter: Option<String>,

    /// User reporter options file merged over the generated configuration
    #[arg(long)]
    reporter_options_path: Option<PathBuf>,

    /// Results area directory
    #[arg(long)]
    report_dir: Option<PathBuf>,

    /// Learned weights file
    #[arg(long)]
    weights_file: Option<PathBuf>,
}

#[derive(Args)]
struct RecordArgs {
    /// Results area directory
    #[arg(long)]
    dir: PathBuf,

    /// Worker index (defaults to $SCATTER_WORKER)
    #[arg(long)]
    worker: Option<usize>,

    /// Suite identity the record belongs to
    #[arg(long)]
    file: String,

    /// Passing test count
    #[arg(long, default_value_t = 0)]
    passes: u64,

    /// Failing test count
    #[arg(long, default_value_t = 0)]
    failures: u64,

    /// Pending test count
    #[arg(long, default_value_t = 0)]
    pending: u64,

    /// Suite duration in milliseconds
    #[arg(long, default_value_t = 0)]
    duration: u64,
}

#[derive(Args)]
struct CompleteArgs {
    /// Results area directory
    #[arg(long)]
    dir: PathBuf,

    /// Worker index (defaults to $SCATTER_WORKER)
    #[arg(long)]
    worker: Option<usize>,

    /// Number of records the worker wrote
    #[arg(long, default_value_t = 0)]
    records: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run(args) => {
            let config = load_or_default(cli.config.as_deref())?;
            run_suites(config, args).await
        }
        Commands::Collect { format } => {
            let config = load_or_default(cli.config.as_deref())?;
            collect_suites(&config, &format).await
        }
        Commands::Validate => {
            let config = load_or_default(cli.config.as_deref())?;
            validate_config(&config)
        }
        Commands::Record(args) => record_result(args).await,
        Commands::Complete(args) => complete_worker(args).await,
    }
}

/// Loads the given configuration file, or `scatter.toml` when present,
/// or built-in defaults.
fn load_or_default(path: Option<&Path>) -> Result<RunConfig> {
    match path {
        Some(path) => {
            let config = config::load_config(path)?;
            info!("Loaded configuration from {}", path.display());
            Ok(config)
        }
        None => {
            let default = Path::new(DEFAULT_CONFIG);
            if default.exists() {
                let config = config::load_config(default)?;
                info!("Loaded configuration from {}", default.display());
                Ok(config)
            } else {
                Ok(RunConfig::default())
            }
        }
    }
}

fn apply_overrides(config: &mut RunConfig, args: &RunArgs) {
    if let Some(workers) = args.workers {
        config.scatter.workers = workers;
    }
    if args.bail {
        config.scatter.bail = true;
    }
    if args.no_strict {
        config.scatter.strict = false;
    }
    if let Some(script) = &args.script {
        config.runner.script = Some(script.clone());
    }
    if let Some(extra) = &args.args {
        config.runner.args = extra.clone();
    }
    if !args.spec.is_empty() {
        config.discovery = DiscoveryConfig::List(config::ListDiscoveryConfig {
            suites: args.spec.clone(),
        });
    } else if let Some(pattern) = &args.pattern {
        config.discovery = DiscoveryConfig::Glob(config::GlobDiscoveryConfig {
            pattern: pattern.clone(),
        });
    }
    if let Some(reporter) = &args.reporter {
        config.report.reporter = Some(reporter.clone());
    }
    if let Some(path) = &args.reporter_options_path {
        config.report.reporter_options_path = Some(path.clone());
    }
    if let Some(dir) = &args.report_dir {
        config.report.results_dir = dir.clone();
    }
    if let Some(path) = &args.weights_file {
        config.scatter.weights_file = path.clone();
    }
}

async fn run_suites(mut config: RunConfig, args: RunArgs) -> Result<()> {
    apply_overrides(&mut config, &args);
    config.validate()?;

    match &config.discovery {
        DiscoveryConfig::Glob(glob) => {
            let source = GlobSource::new(glob.pattern.clone());
            run_with(config.clone(), source).await
        }
        DiscoveryConfig::List(list) => {
            let source = ExplicitSource::new(list.suites.clone());
            run_with(config.clone(), source).await
        }
    }
}

async fn run_with<S>(config: RunConfig, source: S) -> Result<()>
where
    S: SuiteSource + 'static,
{
    let orchestrator = Orchestrator::new(config, source);
    let result = orchestrator.run().await?;
    std::process::exit(result.exit_code());
}

async fn collect_suites(config: &RunConfig, format: &str) -> Result<()> {
    let suites = match &config.discovery {
        DiscoveryConfig::Glob(glob) => GlobSource::new(glob.pattern.clone()).discover().await?,
        DiscoveryConfig::List(list) => ExplicitSource::new(list.suites.clone()).discover().await?,
    };

    let table = WeightStore::new(&config.scatter.weights_file).load();
    let items = weights::estimate(&table, &suites).await;

    match format {
        "json" => {
            let listed: Vec<_> = items
                .iter()
                .map(|item| serde_json::json!({ "file": item.path, "weight": item.weight }))
                .collect();
            println!("{}", serde_json::to_string_pretty(&listed)?);
        }
        _ => {
            println!("Discovered {} suite(s):", items.len());
            for item in &items {
                println!("  {} (weight {:.0})", item.path, item.weight);
            }
        }
    }

    Ok(())
}

fn validate_config(config: &RunConfig) -> Result<()> {
    match config.validate() {
        Ok(()) => {
            println!("Configuration is valid!");
            println!();
            println!("Settings:");
            println!("  Workers: {}", config.scatter.workers);
            println!("  Bail: {}", config.scatter.bail);
            println!("  Strict: {}", config.scatter.strict);
            println!("  Weights file: {}", config.scatter.weights_file.display());
            println!("  Results dir: {}", config.report.results_dir.display());

            let discovery = match &config.discovery {
                DiscoveryConfig::Glob(glob) => format!("glob ({})", glob.pattern),
                DiscoveryConfig::List(list) => format!("list ({} suites)", list.suites.len()),
            };
            println!("  Discovery: {}", discovery);

            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    }
}

fn resolve_worker(explicit: Option<usize>) -> Result<usize> {
    if let Some(worker) = explicit {
        return Ok(worker);
    }
    std::env::var(WORKER_ENV)
        .ok()
        .and_then(|value| value.parse().ok())
        .with_context(|| format!("worker index not given and {WORKER_ENV} is not set"))
}

async fn record_result(args: RecordArgs) -> Result<()> {
    let worker = resolve_worker(args.worker)?;
    let record = SuiteRecord::new(args.file, worker)
        .with_counts(args.passes, args.failures, args.pending)
        .with_duration(args.duration);

    let mut writer = RecordWriter::new(args.dir, worker, Default::default());
    writer
        .write(&record)
        .await
        .context("Failed to write result record")?;
    Ok(())
}

async fn complete_worker(args: CompleteArgs) -> Result<()> {
    let worker = resolve_worker(args.worker)?;
    write_marker(&args.dir, worker, args.records, &Default::default())
        .await
        .context("Failed to write completion marker")?;
    Ok(())
}
