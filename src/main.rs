//! ctx-probe - Main entry point

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use ctx_probe::catalog::select_models;
use ctx_probe::gpu::detect_gpus;
use ctx_probe::units::format_size;
use ctx_probe::{
    CancelToken, FileCatalog, ModelCatalog, OllamaClient, ProbeConfig, ProbeEngine, ReportFormat,
    ReportWriter, RunStatus, RunSummary, Session, SweepEngine, VramBudget, metrics,
};
use std::future::Future;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::Notify;

#[derive(Parser, Debug)]
#[command(name = "ctx-probe")]
#[command(about = "Measure how large a context window fits in VRAM", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override serving daemon base URL
    #[arg(long)]
    api: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    log_format: String,

    /// Write Prometheus metrics here when the run ends
    #[arg(long)]
    metrics_output: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Find the largest context that fits within the VRAM budget
    Probe(ProbeArgs),
    /// Measure VRAM across power-of-two context sizes
    Usage(RunArgs),
    /// List catalog models and their declared context
    Models {
        /// Read the catalog from a JSON file instead of the daemon
        #[arg(long)]
        catalog: Option<PathBuf>,
    },
    /// List detected GPUs and their free memory
    Gpus,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Only this model
    #[arg(long)]
    model: Option<String>,

    /// Report path (defaults to the configured output directory)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Report format (csv or json)
    #[arg(long, default_value = "csv")]
    format: ReportFormat,

    /// Keep an existing report and skip what it already covers
    #[arg(long)]
    resume: bool,

    /// Read the catalog from a JSON file instead of the daemon
    #[arg(long)]
    catalog: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct ProbeArgs {
    #[command(flatten)]
    run: RunArgs,

    /// VRAM budget: bytes, a size like 8GiB, a ratio like 0.9 or 90%, or auto
    #[arg(long)]
    max_vram: Option<String>,

    /// Smallest context worth reporting
    #[arg(long)]
    min_context: Option<u32>,

    /// Stop bisecting once the bracket is this narrow
    #[arg(long)]
    resolution: Option<u32>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup logging
    match cli.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .json()
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .init();
        }
    }

    match run(cli).await {
        Ok(status) => ExitCode::from(status.exit_code() as u8),
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "Run failed");
            ExitCode::from(RunStatus::Fatal.exit_code() as u8)
        }
    }
}

async fn run(cli: Cli) -> Result<RunStatus> {
    // Load configuration
    let mut config = ProbeConfig::load(cli.config)?;

    // CLI overrides
    if let Some(api) = cli.api {
        config.api_base = api;
    }
    if let Command::Probe(args) = &cli.command {
        if args.max_vram.is_some() {
            config.max_vram = args.max_vram.clone();
        }
        if let Some(min_context) = args.min_context {
            config.search.min_context = min_context;
        }
        if let Some(resolution) = args.resolution {
            config.search.resolution = resolution;
        }
    }

    config.validate()?;

    tracing::debug!(
        api_base = %config.api_base,
        output_dir = ?config.output_dir,
        "Configuration loaded"
    );

    // Setup metrics
    let prometheus_handle = match &cli.metrics_output {
        Some(_) => Some(metrics::setup_metrics()?),
        None => None,
    };

    let status = match cli.command {
        Command::Gpus => {
            list_gpus();
            RunStatus::Complete
        }
        Command::Models { catalog } => {
            let client = Arc::new(OllamaClient::from_config(&config)?);
            let catalog = catalog_for(catalog, client);
            for model in catalog.list_models().await? {
                println!("{}\t{}", model.name, model.declared_max_context);
            }
            RunStatus::Complete
        }
        Command::Probe(args) => probe(&config, args).await?,
        Command::Usage(args) => usage(&config, args).await?,
    };

    if let (Some(handle), Some(path)) = (&prometheus_handle, &cli.metrics_output) {
        metrics::write_snapshot(handle, path)?;
    }

    Ok(status)
}

async fn probe(config: &ProbeConfig, args: ProbeArgs) -> Result<RunStatus> {
    let budget: VramBudget = config.max_vram.as_deref().unwrap_or("auto").parse()?;
    let budget = budget.resolve(&detect_gpus())?;
    tracing::info!(budget = %budget, "VRAM budget");

    let client = Arc::new(OllamaClient::from_config(config)?);
    let cancel = CancelToken::new();
    let session = Session::new(client.clone(), cancel.clone());
    session.preflight().await?;

    let catalog = catalog_for(args.run.catalog.clone(), client);
    let models = select_models(catalog.as_ref(), args.run.model.as_deref()).await?;

    let path = report_path(&args.run, config.probe_output_path());
    let mut report = open_report(&path, &args.run).await?;

    let engine = ProbeEngine::new(
        session.slot().clone(),
        config.sampler.clone(),
        budget,
        config.search.clone(),
    );

    // A named model is always probed again, even when resuming
    let skip_finished = args.run.resume && args.run.model.is_none();
    let abort = watch_signals(cancel);
    until_aborted(
        &session,
        &abort,
        session.run_probe(&models, &engine, &mut report, skip_finished),
    )
    .await
}

async fn usage(config: &ProbeConfig, args: RunArgs) -> Result<RunStatus> {
    let client = Arc::new(OllamaClient::from_config(config)?);
    let cancel = CancelToken::new();
    let session = Session::new(client.clone(), cancel.clone());
    session.preflight().await?;

    let catalog = catalog_for(args.catalog.clone(), client);
    let models = select_models(catalog.as_ref(), args.model.as_deref()).await?;

    let path = report_path(&args, config.usage_output_path());
    let mut report = open_report(&path, &args).await?;

    let engine = SweepEngine::new(
        session.slot().clone(),
        config.sampler.clone(),
        config.sweep.clone(),
    );

    let abort = watch_signals(cancel);
    until_aborted(
        &session,
        &abort,
        session.run_usage(&models, &engine, &mut report, args.resume),
    )
    .await
}

fn catalog_for(path: Option<PathBuf>, client: Arc<OllamaClient>) -> Arc<dyn ModelCatalog> {
    match path {
        Some(path) => Arc::new(FileCatalog::new(path).with_fallback(client)),
        None => client,
    }
}

/// Explicit `--output`, else the configured path with the format's extension
fn report_path(args: &RunArgs, configured: PathBuf) -> PathBuf {
    match (&args.output, args.format) {
        (Some(path), _) => path.clone(),
        (None, ReportFormat::Json) => configured.with_extension("json"),
        (None, ReportFormat::Csv) => configured,
    }
}

async fn open_report<R: ctx_probe::report::ReportRow>(
    path: &std::path::Path,
    args: &RunArgs,
) -> Result<ReportWriter<R>> {
    if args.resume {
        ReportWriter::resume(path, args.format)
            .await
            .with_context(|| format!("Failed to resume from {:?}", path))
    } else {
        Ok(ReportWriter::new(path, args.format))
    }
}

fn list_gpus() {
    let gpus = detect_gpus();
    if gpus.count() == 0 {
        println!("No GPUs detected");
        return;
    }
    for device in &gpus.devices {
        println!(
            "GPU {}: {} free of {}",
            device.index,
            format_size(device.free_bytes),
            format_size(device.total_bytes)
        );
    }
}

/// Run to completion unless a second interrupt arrives
async fn until_aborted(
    session: &Session,
    abort: &Notify,
    run: impl Future<Output = ctx_probe::Result<RunSummary>>,
) -> Result<RunStatus> {
    tokio::select! {
        result = run => Ok(result?.status()),
        _ = abort.notified() => {
            tracing::warn!("Aborting; releasing resident model");
            if session.slot().release().await > 0 {
                tracing::error!("Model may still be resident in the daemon");
            }
            Ok(RunStatus::Aborted)
        }
    }
}

/// First signal requests a stop after the current model, the second aborts
fn watch_signals(cancel: CancelToken) -> Arc<Notify> {
    let abort = Arc::new(Notify::new());
    tokio::spawn({
        let abort = abort.clone();
        async move {
            shutdown_signal().await;
            tracing::warn!("Finishing the current model; signal again to abort");
            cancel.cancel();
            shutdown_signal().await;
            abort.notify_one();
        }
    });
    abort
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM signal");
        },
    }
}
