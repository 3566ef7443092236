//! OmniSky ingest daemon (omnisky-ingest) - Main entry point
//!
//! `run` starts the daemon: discovery, the download → analyze → persist
//! pipeline and the resource-aware control loop. The other subcommands
//! operate on the same root folder from outside the running daemon.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use omnisky_common::config::{resolve_root_folder, RootLayout, ROOT_ENV_VAR};
use omnisky_ingest::config::IngestConfig;
use omnisky_ingest::daemon::{
    recover_previous_run, ControlFile, DaemonControl, DaemonRunner, ProcfsProbe, SystemClock,
};
use omnisky_ingest::db::ArtifactStore;
use omnisky_ingest::discovery::DiscoveryAgent;
use omnisky_ingest::observability::{read_recent_events, read_status_file, Observability};
use omnisky_ingest::pipeline::{PipelineManager, PipelineServices};
use omnisky_ingest::services::{
    Analyzer, CommandAnalyzer, FsCleanup, HttpDownloader, PassthroughAnalyzer,
};
use omnisky_ingest::sources::PluginRegistry;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for omnisky-ingest
#[derive(Parser, Debug)]
#[command(name = "omnisky-ingest")]
#[command(about = "Astronomical dataset ingestion daemon")]
#[command(version)]
struct Args {
    /// Root folder (database, temp cache, observability files)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the ingestion daemon until interrupted
    Run,
    /// Create or upgrade the database schema and exit
    Migrate,
    /// Ask the running daemon to pause
    Pause {
        #[arg(long, default_value = "manual pause")]
        reason: String,
        /// Stop pulling queued items immediately instead of letting them run through
        #[arg(long)]
        abort_current: bool,
    },
    /// Ask the running daemon to resume
    Resume,
    /// Print the status snapshot and artifact counts
    Status {
        /// Also print the newest N event log records
        #[arg(long, default_value_t = 0)]
        events: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = IngestConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let root = resolve_root_folder(args.root.as_deref(), ROOT_ENV_VAR, config.root_folder.as_deref());
    let layout = RootLayout::new(root);
    layout
        .ensure_directories()
        .context("Failed to prepare root folder")?;

    match args.command {
        Command::Run => run(config, layout).await,
        Command::Migrate => migrate(&layout).await,
        Command::Pause {
            reason,
            abort_current,
        } => {
            ControlFile::paused(reason, !abort_current)
                .write(&layout.control_file())
                .await
                .context("Failed to write control file")?;
            println!("Pause requested ({})", layout.control_file().display());
            Ok(())
        }
        Command::Resume => {
            ControlFile::running()
                .write(&layout.control_file())
                .await
                .context("Failed to write control file")?;
            println!("Resume requested ({})", layout.control_file().display());
            Ok(())
        }
        Command::Status { events } => status(&layout, events).await,
    }
}

async fn migrate(layout: &RootLayout) -> Result<()> {
    let store = ArtifactStore::open(&layout.database_path())
        .await
        .context("Failed to open database")?;
    let versions = omnisky_common::db::applied_versions(store.pool()).await?;
    println!(
        "Schema at v{} ({})",
        versions.last().copied().unwrap_or(0),
        layout.database_path().display()
    );
    store.close().await;
    Ok(())
}

async fn status(layout: &RootLayout, events: usize) -> Result<()> {
    match read_status_file(&layout.status_file()).await? {
        Some(status) => println!("{}", serde_json::to_string_pretty(&status)?),
        None => println!("No status snapshot yet ({})", layout.status_file().display()),
    }

    let control = ControlFile::read(&layout.control_file()).await;
    if control.is_paused() {
        println!(
            "Operator pause in effect: {} (finish current job: {})",
            control.reason, control.finish_current_job
        );
    }

    if layout.database_path().exists() {
        let store = ArtifactStore::open(&layout.database_path())
            .await
            .context("Failed to open database")?;
        println!("Artifacts:");
        for (status, count) in store.status_counts().await? {
            println!("  {:<16} {}", status.as_str(), count);
        }
        println!("Events: {}  Families: {}", store.count_events().await?, store.family_count().await?);
        store.close().await;
    }

    if events > 0 {
        for event in read_recent_events(&layout.event_log_file(), events).await? {
            println!("{}", serde_json::to_string(&event)?);
        }
    }

    Ok(())
}

async fn run(config: IngestConfig, layout: RootLayout) -> Result<()> {
    info!("Starting OmniSky ingest daemon");
    info!("Root folder: {}", layout.root().display());

    let store = ArtifactStore::open(&layout.database_path())
        .await
        .context("Failed to open database")?;

    let recovery = recover_previous_run(&store, &layout.temp_dir())
        .await
        .context("Startup recovery failed")?;
    info!(
        downloads_failed = recovery.downloads_failed,
        analyses_abandoned = recovery.analyses_abandoned,
        "Startup recovery complete"
    );

    let session_id = store.start_session(&config.snapshot()).await?;
    info!(session_id = %session_id, "Run session started");

    let plugins = PluginRegistry::with_builtin()
        .build_all(&config.sources)
        .context("Invalid [[sources]] configuration")?;

    let analyzer: Arc<dyn Analyzer> = match &config.analyzer.command {
        Some(program) => {
            info!(program = %program.display(), "Using external analyzer");
            Arc::new(CommandAnalyzer::new(
                program.clone(),
                config.analyzer.args.clone(),
                std::time::Duration::from_secs(config.analyzer.timeout_secs),
            ))
        }
        None => {
            warn!("No analyzer configured, artifacts are recorded UNCLASSIFIED");
            Arc::new(PassthroughAnalyzer)
        }
    };

    let downloader = HttpDownloader::new(
        config.pipeline.download_timeout(),
        config.pipeline.max_download_bytes,
    )
    .context("Failed to build HTTP client")?;

    let observability = Arc::new(Observability::new(&layout.obs_dir()));

    let pipeline = Arc::new(PipelineManager::start(
        &config.pipeline,
        layout.temp_dir(),
        PipelineServices {
            store: store.clone(),
            downloader: Arc::new(downloader),
            analyzer,
            cleanup: Arc::new(FsCleanup::new(layout.quarantine_dir())),
            observability: observability.clone(),
        },
    ));

    let discovery = DiscoveryAgent::new(plugins, store.clone())
        .with_observability(observability.clone())
        .with_queued_urls(pipeline.queued_urls());
    let control = DaemonControl::new(&config.daemon, Arc::new(ProcfsProbe::new()), Arc::new(SystemClock));

    let runner = DaemonRunner::new(
        store.clone(),
        pipeline,
        discovery,
        control,
        observability,
        layout.control_file(),
        config.daemon.clone(),
    )
    .with_session(session_id);

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    runner.run(shutdown).await?;
    store.close().await;

    info!("Daemon shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
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
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
