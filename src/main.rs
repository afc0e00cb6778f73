mod config;
mod error;
mod ingest;
mod models;
mod seed;
mod storage;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::{default_config_toml, load_config, IngestConfig};
use ingest::{start_watcher, FileOutcome, FileProcessor, IngestService, ProcessorSettings, SettlePolicy, TagCatalog};
use storage::SqliteStore;

/// Paths discovered but not yet picked up by a worker
const DISCOVERY_QUEUE: usize = 256;

#[derive(Parser)]
#[command(name = "sensor-ingest")]
#[command(about = "Sensor spreadsheet ingestion service", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the configuration file
    #[arg(long, global = true, default_value = "ingest.toml")]
    config: PathBuf,

    /// Log level filter (e.g. debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch the incoming directory and ingest files until interrupted
    Run,

    /// Ingest the given files once, relocating each afterwards
    Ingest {
        /// Spreadsheet files to process
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Replace the tag catalog from a master workbook
    Seed {
        /// Workbook holding the tbl_* tables
        #[arg(long)]
        workbook: PathBuf,

        /// Sheet the tables live on
        #[arg(long, default_value = seed::DEFAULT_SHEET)]
        sheet: String,
    },

    /// Show or initialize configuration
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write a default configuration file
    Init,
    /// Show path to the config file
    Path,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run => run_service(&cli.config, &cli.log_level),
        Commands::Ingest { files } => handle_ingest(&cli.config, &cli.log_level, files),
        Commands::Seed { workbook, sheet } => handle_seed(&cli.config, &cli.log_level, &workbook, &sheet),
        Commands::Config { action } => handle_config(&cli.config, action),
    }
}

/// JSON for the long-running service unless SENSOR_INGEST_LOG_TEXT=1
fn init_logging(level: &str, json_default: bool) {
    let text_logging = std::env::var("SENSOR_INGEST_LOG_TEXT")
        .map(|v| v == "1" || v == "true")
        .unwrap_or(!json_default);
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("sensor_ingest={level}").into());

    if text_logging {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    }
}

fn cli_runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_multi_thread()
        .thread_name("ingest-worker")
        .enable_all()
        .build()?)
}

async fn open_store(config: &IngestConfig) -> anyhow::Result<SqliteStore> {
    let store = SqliteStore::new(&config.database.path, config.database.max_connections)
        .await
        .with_context(|| format!("failed to open database {}", config.database.path.display()))?;
    store.migrate().await.context("failed to run migrations")?;
    store.health_check().await.context("database health check failed")?;
    Ok(store)
}

/// Store, catalog and processor shared by `run` and `ingest`
async fn build_processor(config: &IngestConfig) -> anyhow::Result<(SqliteStore, Arc<FileProcessor>)> {
    config
        .directories
        .create_all()
        .context("failed to create data directories")?;

    let store = open_store(config).await?;
    let catalog = TagCatalog::load(&store).await?;
    if catalog.is_empty() {
        tracing::warn!("Tag catalog is empty, every column will be skipped");
    }

    let settings = ProcessorSettings::from_config(config).context("invalid sheet layout")?;
    let processor = FileProcessor::new(Arc::new(store.clone()), Arc::new(catalog), settings);
    Ok((store, Arc::new(processor)))
}

async fn shutdown_store(store: &SqliteStore) {
    let (queries, slow, total_ms) = store.metrics().get_stats();
    tracing::info!(queries, slow, total_ms, "Database statistics");
    store.close().await;
}

// === Service ===

fn run_service(config_path: &Path, log_level: &str) -> anyhow::Result<()> {
    init_logging(log_level, true);
    let rt = cli_runtime()?;

    rt.block_on(async {
        tracing::info!(pid = std::process::id(), "sensor-ingest starting");
        let config = load_config(config_path)?;
        let (store, processor) = build_processor(&config).await?;

        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            token.cancel();
        });

        let (task_tx, task_rx) = mpsc::channel(DISCOVERY_QUEUE);
        let service = IngestService::new(processor, config.ingest.max_concurrent_files);
        let service_handle = tokio::spawn(service.run(task_rx, shutdown.clone()));

        // Returns on shutdown; the service then finishes only in-flight files
        let watch_result = start_watcher(
            config.directories.watch.clone(),
            config.ingest.extensions.clone(),
            SettlePolicy::from(&config.watch),
            task_tx,
            shutdown.clone(),
        )
        .await;
        if let Err(e) = &watch_result {
            tracing::error!(error = %e, "File watcher failed");
        }

        let summary = service_handle.await?;
        tracing::info!(
            completed = summary.completed,
            errored = summary.errored,
            ignored = summary.ignored,
            "Shutdown complete"
        );
        shutdown_store(&store).await;
        watch_result
    })
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to register SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("SIGINT received, initiating graceful shutdown");
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("SIGTERM received, initiating graceful shutdown");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("SIGINT received, initiating graceful shutdown");
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Interrupt received, initiating graceful shutdown");
}

// === One-shot commands ===

fn handle_ingest(config_path: &Path, log_level: &str, files: Vec<PathBuf>) -> anyhow::Result<()> {
    init_logging(log_level, false);
    let rt = cli_runtime()?;

    rt.block_on(async {
        let config = load_config(config_path)?;
        let (store, processor) = build_processor(&config).await?;

        let mut failed = 0;
        for file in &files {
            let outcome = processor.handle(file).await;
            let summary = match &outcome {
                FileOutcome::Completed { report, destination } => json!({
                    "file": file,
                    "status": "completed",
                    "destination": destination,
                    "report": report,
                }),
                FileOutcome::Errored { error, destination } => {
                    failed += 1;
                    json!({
                        "file": file,
                        "status": "errored",
                        "kind": error.kind(),
                        "error": error.to_string(),
                        "destination": destination,
                    })
                }
                FileOutcome::AlreadyInFlight => json!({ "file": file, "status": "duplicate" }),
                FileOutcome::Vanished => {
                    failed += 1;
                    json!({ "file": file, "status": "missing" })
                }
            };
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }

        shutdown_store(&store).await;

        if failed > 0 {
            anyhow::bail!("{} of {} files failed", failed, files.len());
        }
        anyhow::Ok(())
    })
}

fn handle_seed(config_path: &Path, log_level: &str, workbook: &Path, sheet: &str) -> anyhow::Result<()> {
    init_logging(log_level, false);
    let rt = cli_runtime()?;

    rt.block_on(async {
        let config = load_config(config_path)?;
        let store = open_store(&config).await?;

        let path = workbook.to_path_buf();
        let sheet_name = sheet.to_string();
        let seed = tokio::task::spawn_blocking(move || seed::read_catalog_seed(&path, &sheet_name))
            .await?
            .with_context(|| format!("failed to read catalog from {}", workbook.display()))?;

        tracing::info!(
            measure_types = seed.measure_types.len(),
            buildings = seed.buildings.len(),
            locations = seed.locations.len(),
            tags = seed.tags.len(),
            "Catalog workbook read"
        );

        store
            .replace_catalog(&seed)
            .await
            .context("catalog seeding failed, previous catalog kept")?;
        println!(
            "Seeded {} measure types, {} buildings, {} locations, {} tags",
            seed.measure_types.len(),
            seed.buildings.len(),
            seed.locations.len(),
            seed.tags.len()
        );

        shutdown_store(&store).await;
        anyhow::Ok(())
    })
}

fn handle_config(config_path: &Path, action: Option<ConfigAction>) -> anyhow::Result<()> {
    match action {
        Some(ConfigAction::Path) => {
            println!("{}", config_path.display());
        }
        Some(ConfigAction::Init) => {
            if config_path.exists() {
                eprintln!("Config already exists: {}", config_path.display());
                return Ok(());
            }
            if let Some(parent) = config_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(config_path, default_config_toml()?)?;
            println!("Created: {}", config_path.display());
        }
        None => {
            let config = load_config(config_path)?;
            println!("# Effective config ({})\n", config_path.display());
            println!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
