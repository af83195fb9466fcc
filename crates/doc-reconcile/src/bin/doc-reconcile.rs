//! doc-reconcile command line
//!
//! Run with: cargo run -p doc-reconcile -- <command>

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use doc_reconcile::config::CONFIG_ENV_VAR;
use doc_reconcile::processing::StuckNotice;
use doc_reconcile::providers::{
    ExtractionJobProvider, HttpExtractionJob, InMemoryExtractionJob, InMemoryMetadataStore,
    InMemoryObjectStore, LocalObjectStore, MetadataStoreProvider, ObjectStoreProvider,
};
use doc_reconcile::storage::SqliteMetadataStore;
use doc_reconcile::{
    IngestService, Notification, ProcessingOutcome, ReconcileConfig, UploadRequest,
};

#[derive(Parser, Debug)]
#[command(name = "doc-reconcile", version, about = "Document ingestion reconciler")]
struct Cli {
    /// TOML configuration file
    #[arg(long, short, env = CONFIG_ENV_VAR)]
    config: Option<PathBuf>,

    /// Use in-memory stores and a no-op extraction job
    #[arg(long)]
    ephemeral: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a document and start its extraction
    Upload {
        path: PathBuf,
        /// Declared content type (guessed from the extension by default)
        #[arg(long)]
        mime: Option<String>,
    },
    /// List documents with their lifecycle state
    List,
    /// Delete a document
    Delete {
        id: Uuid,
        /// Delete even while its job is running
        #[arg(long)]
        force: bool,
    },
    /// Start extraction for an uploaded document
    Process { id: Uuid },
    /// Retry a stuck or failed document
    Retry { id: Uuid },
    /// Create records for orphaned objects
    Sync,
    /// Report documents stuck in processing
    Sweep,
    /// Run the change feed and stuck sweep, printing notifications
    Watch,
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<ReconcileConfig> {
    match path {
        Some(path) => ReconcileConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(ReconcileConfig::default()),
    }
}

fn build_service(config: ReconcileConfig, ephemeral: bool) -> anyhow::Result<IngestService> {
    let (objects, metadata, job): (
        Arc<dyn ObjectStoreProvider>,
        Arc<dyn MetadataStoreProvider>,
        Arc<dyn ExtractionJobProvider>,
    ) = if ephemeral {
        (
            Arc::new(InMemoryObjectStore::new()),
            Arc::new(InMemoryMetadataStore::new()),
            Arc::new(InMemoryExtractionJob::new()),
        )
    } else {
        (
            Arc::new(LocalObjectStore::new(config.storage.root_dir.clone())?),
            Arc::new(SqliteMetadataStore::new(&config.storage.database_path)?),
            Arc::new(HttpExtractionJob::new(&config.extraction)?),
        )
    };
    Ok(IngestService::new(config, objects, metadata, job))
}

fn print_notification(notification: &Notification) {
    match notification {
        Notification::Uploaded { id, display_name } => println!("uploaded    {} {}", id, display_name),
        Notification::ProcessingStarted { id } => println!("processing  {}", id),
        Notification::Completed { id, review } => println!("completed   {} (review: {:?})", id, review),
        Notification::Failed { id, reason } => println!("failed      {} {}", id, reason),
        Notification::Stuck(notice) => print_stuck(notice),
        Notification::Progress(entry) => {
            println!("progress    {} [{}] {}", entry.document_id, entry.level.as_str(), entry.message)
        }
        Notification::Deleted { id } => println!("deleted     {}", id),
    }
}

fn print_stuck(notice: &StuckNotice) {
    println!(
        "stuck       {} {} (processing for {}s)",
        notice.id,
        notice.display_name,
        notice.processing_for.num_seconds()
    );
}

fn print_outcome(id: Uuid, outcome: &ProcessingOutcome) {
    match outcome {
        ProcessingOutcome::Started(record) => {
            println!("Started extraction for {} ({})", id, record.storage_key)
        }
        ProcessingOutcome::AlreadyProcessing => println!("{} is already processing", id),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "doc_reconcile=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    tracing::info!("Configuration loaded");
    tracing::info!("  - Object root: {}", config.storage.root_dir.display());
    tracing::info!("  - Metadata database: {}", config.storage.database_path.display());
    tracing::info!("  - Stuck threshold: {}s", config.lifecycle.stuck_threshold_secs);

    let service = build_service(config, cli.ephemeral)?;

    match cli.command {
        Command::Upload { path, mime } => {
            let data = tokio::fs::read(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let mime = mime.unwrap_or_else(|| {
                mime_guess::from_path(&path)
                    .first_or_octet_stream()
                    .to_string()
            });
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "document".to_string());

            // Wait for the job start; the runtime ends with main
            let (record, outcome) = service
                .upload_and_process(UploadRequest::new(name, mime, data))
                .await
                .map_err(|e| anyhow::anyhow!(e.reason()))?;
            println!("Uploaded {} as {} ({})", record.id, record.storage_key, record.document_kind);
            print_outcome(record.id, &outcome);
        }
        Command::List => {
            let records = service.refresh().await?;
            for record in &records {
                println!(
                    "{}  {:<10}  {:<14}  {}",
                    record.id,
                    service.state_of(record),
                    record.document_kind,
                    record.display_name
                );
            }
            let summary = service.summarize(&records);
            println!(
                "\n{} documents: {} uploaded, {} processing, {} completed, {} failed, {} stuck",
                summary.total(),
                summary.uploaded,
                summary.processing,
                summary.completed,
                summary.failed,
                summary.stuck
            );
        }
        Command::Delete { id, force } => {
            service
                .delete_document(id, force)
                .await
                .map_err(|e| anyhow::anyhow!(e.reason()))?;
            println!("Deleted {}", id);
        }
        Command::Process { id } => {
            let outcome = service
                .begin_processing(id)
                .await
                .map_err(|e| anyhow::anyhow!(e.reason()))?;
            print_outcome(id, &outcome);
        }
        Command::Retry { id } => {
            let outcome = service
                .retry_document(id)
                .await
                .map_err(|e| anyhow::anyhow!(e.reason()))?;
            print_outcome(id, &outcome);
        }
        Command::Sync => {
            let report = service.sync().await?;
            println!(
                "Sync: {} orphans, {} records created, {} failed, {} missing objects, {} tombstoned skipped ({:?})",
                report.orphans.len(),
                report.created,
                report.failed,
                report.missing_objects.len(),
                report.skipped_tombstoned,
                report.duration
            );
            for key in &report.missing_objects {
                println!("  missing object: {}", key);
            }
        }
        Command::Sweep => {
            let notices = service.sweep_stuck().await?;
            if notices.is_empty() {
                println!("No stuck documents");
            }
            for notice in &notices {
                print_stuck(notice);
            }
        }
        Command::Watch => {
            let mut notifications = service.subscribe_notifications();
            let background = service.spawn_background();
            println!("Watching for changes. Press Ctrl+C to stop\n");

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    note = notifications.recv() => match note {
                        Ok(note) => print_notification(&note),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!("Dropped {} notifications", n);
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }

            background.shutdown().await;
        }
    }

    Ok(())
}
