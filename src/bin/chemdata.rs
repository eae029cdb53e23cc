use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use chemdata_collector::batch::{BatchProcessor, ProgressSink, SilentProgress};
use chemdata_collector::cache::ResponseCache;
use chemdata_collector::checkpoint::CheckpointOptions;
use chemdata_collector::config::{ConfigLoader, InputLoader, ResolvedConfig};
use chemdata_collector::context::RunContext;
use chemdata_collector::domain::SourceKind;
use chemdata_collector::error::CollectorError;
use chemdata_collector::merge::Merger;
use chemdata_collector::output::{JsonOutput, OutputFormat, StderrProgress, TsvOutput, print_summary};
use chemdata_collector::providers::http::HttpTransport;
use chemdata_collector::providers::http_clients;
use chemdata_collector::providers::pubchem::PubChemStructureService;
use chemdata_collector::store::CacheStore;

#[derive(Parser)]
#[command(name = "chemdata")]
#[command(about = "Collect and merge chemical compound data from multiple public sources")]
#[command(version, author)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Query every enabled source for each input compound and merge the results")]
    Collect(CollectArgs),
    #[command(about = "Inspect or clear the persistent response cache")]
    Cache(CacheArgs),
}

#[derive(Args)]
struct CollectArgs {
    /// JSON array of compounds, or one CAS number or name per line.
    #[arg(long, short)]
    input: PathBuf,

    #[arg(long)]
    config: Option<String>,

    /// Restrict the run to these sources (repeatable).
    #[arg(long = "source", value_enum)]
    sources: Vec<SourceKind>,

    #[arg(long)]
    workers: Option<usize>,

    #[arg(long, value_enum, default_value = "json")]
    format: OutputFormat,

    /// Keep responses in memory only.
    #[arg(long)]
    no_persist: bool,

    /// Skip structure canonicalization.
    #[arg(long)]
    no_chemistry: bool,

    /// Skip compounds an interrupted run with the same input already merged.
    #[arg(long, conflicts_with = "no_checkpoint")]
    resume: bool,

    /// Do not write batch progress to disk.
    #[arg(long)]
    no_checkpoint: bool,

    /// Cancel outstanding lookups after this many seconds.
    #[arg(long)]
    deadline_secs: Option<u64>,

    #[arg(long)]
    quiet: bool,
}

#[derive(Args)]
struct CacheArgs {
    #[command(subcommand)]
    command: CacheCommand,

    #[arg(long, global = true)]
    config: Option<String>,
}

#[derive(Subcommand)]
enum CacheCommand {
    #[command(about = "Show entry count and size")]
    Stats,
    #[command(about = "Remove every cached response")]
    Clear,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<CollectorError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &CollectorError) -> u8 {
    match error {
        CollectorError::NoSourcesEnabled
        | CollectorError::UnknownSource(_)
        | CollectorError::ConfigRead(_)
        | CollectorError::ConfigParse(_)
        | CollectorError::InvalidConfig(_)
        | CollectorError::InvalidIdentifier { .. } => 2,
        CollectorError::Filesystem(_) | CollectorError::HttpClient(_) => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Collect(args) => run_collect(args),
        Commands::Cache(args) => run_cache(args),
    }
}

fn run_collect(args: CollectArgs) -> miette::Result<()> {
    let resolved =
        ConfigLoader::resolve(args.config.as_deref())?.with_overrides(&args.sources, args.workers)?;
    let queries = InputLoader::load(&args.input)?;
    info!(
        compounds = queries.len(),
        sources = resolved.enabled_sources.len(),
        "loaded input"
    );

    let cache = if args.no_persist || !resolved.cache.persist {
        ResponseCache::in_memory()
    } else {
        ResponseCache::with_store(open_store(&resolved)?)
    };
    let ctx = RunContext::new(&resolved.sources, resolved.retry, cache);
    let http = HttpTransport::new(resolved.request_timeout)?;
    let clients = http_clients(&resolved.enabled_sources, &http);

    let mut processor = BatchProcessor::new(ctx, clients)
        .with_merger(Merger::new(resolved.source_priority.clone()))
        .with_workers(resolved.workers);
    if !args.no_chemistry {
        processor = processor.with_chemistry(Arc::new(PubChemStructureService::new(http)));
    }
    if !args.no_checkpoint {
        processor = processor.with_checkpoint(CheckpointOptions {
            directory: open_store(&resolved)?.checkpoint_dir(),
            resume: args.resume,
        });
    }

    if let Some(secs) = args.deadline_secs {
        let token = processor.cancellation_token();
        thread::spawn(move || {
            thread::sleep(Duration::from_secs(secs));
            warn!(deadline_secs = secs, "deadline reached, cancelling run");
            token.cancel();
        });
    }

    let progress = StderrProgress::new();
    let sink: &dyn ProgressSink = if args.quiet { &SilentProgress } else { &progress };
    let outcome = processor.process(&queries, &resolved.enabled_sources, sink)?;

    match args.format {
        OutputFormat::Json => JsonOutput::print_outcome(&outcome).into_diagnostic()?,
        OutputFormat::Tsv => TsvOutput::new(resolved.max_activity_entries)
            .print(&outcome)
            .into_diagnostic()?,
    }
    if !args.quiet {
        print_summary(&outcome);
    }
    Ok(())
}

fn run_cache(args: CacheArgs) -> miette::Result<()> {
    let resolved = ConfigLoader::resolve(args.config.as_deref())?;
    let store = open_store(&resolved)?;
    match args.command {
        CacheCommand::Stats => {
            let summary = store.summary()?;
            JsonOutput::print_store_summary(&summary).into_diagnostic()?;
        }
        CacheCommand::Clear => {
            store.clear()?;
            eprintln!("cleared {}", store.root());
        }
    }
    Ok(())
}

fn open_store(resolved: &ResolvedConfig) -> Result<CacheStore, CollectorError> {
    match &resolved.cache.directory {
        Some(directory) => Ok(CacheStore::with_root(directory.clone())),
        None => CacheStore::new(),
    }
}
