// nc_doc_loader/src/main.rs
// Main entry point for the nc_doc_loader CLI application.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use clap::Parser;
use nc_doc_loader::cli::{Cli, Commands, MongoArgs};
use nc_doc_loader::error::{IngestorError, Result};
use nc_doc_loader::ingestor::{DocumentStore, IngestorConfig};
use nc_doc_loader::mongo::MongoCollection;
use nc_doc_loader::pipeline::{
    NamedScope, PipelineStats, ProgressListener, RowOutcome, RowPipeline,
};
use nc_doc_loader::row::JsonLinesSource;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Serialize,)]
struct ProcessingError {
    path:  String,
    error: String,
}

#[derive(Serialize,)]
struct LoadedFile {
    path:  String,
    stats: PipelineStats,
}

#[derive(Serialize, Default,)]
struct Report {
    total_files:   usize,
    success_count: usize,
    failure_count: usize,
    loaded:        Vec<LoadedFile,>,
    errors:        Vec<ProcessingError,>,
}

struct ProcessingRegistry {
    report: Mutex<Report,>,
    strict: bool,
    cancel: CancellationToken,
}

impl ProcessingRegistry {
    fn new(strict: bool, cancel: CancellationToken,) -> Self {
        Self {
            report: Mutex::new(Report::default(),),
            strict,
            cancel,
        }
    }

    fn record_success(&self, path: &str, stats: PipelineStats,) {
        let mut report = self.report.lock().unwrap_or_else(PoisonError::into_inner,);
        report.total_files += 1;
        report.success_count += 1;
        report.loaded.push(LoadedFile {
            path: path.to_string(),
            stats,
        },);
    }

    fn record_error(&self, path: &str, err: String,) -> Result<(),> {
        let mut report = self.report.lock().unwrap_or_else(PoisonError::into_inner,);
        report.total_files += 1;
        report.failure_count += 1;
        report.errors.push(ProcessingError {
            path:  path.to_string(),
            error: err.clone(),
        },);

        error!("Error at {}: {}", path, err);

        if self.strict {
            self.cancel.cancel();
            return Err(IngestorError::Other(format!(
                "Strict mode enabled. Halting on error at {}: {}",
                path, err
            ),),);
        }
        Ok((),)
    }

    fn failure_count(&self,) -> usize {
        self.report
            .lock()
            .unwrap_or_else(PoisonError::into_inner,)
            .failure_count
    }

    fn save_report(&self,) -> Result<(),> {
        let report = self.report.lock().unwrap_or_else(PoisonError::into_inner,);
        let json = serde_json::to_string_pretty(&*report,).map_err(|e| {
            IngestorError::Other(format!("Failed to serialize loading report: {}", e),)
        },)?;
        std::fs::write("loading_report.json", json,).map_err(|e| {
            IngestorError::Other(format!("Failed to write loading_report.json: {}", e),)
        },)?;
        info!("Loading report saved to loading_report.json");
        Ok((),)
    }
}

/// Logs progress every `every` rows of one input file.
struct ProgressLogger {
    path:  String,
    every: u64,
    rows:  AtomicU64,
}

impl ProgressListener for ProgressLogger {
    fn row_processed(&self, outcome: &RowOutcome,) {
        let rows = self.rows.fetch_add(1, Ordering::Relaxed,) + 1;
        if let RowOutcome::BatchWritten { documents, } = outcome {
            debug!("{}: committed a batch of {} documents", self.path, documents);
        }
        if rows % self.every == 0 {
            info!("{}: {} rows processed", self.path, rows);
        }
    }

    fn stream_complete(&self, stats: &PipelineStats,) {
        info!(
            "{}: stream complete after {} rows ({} skipped)",
            self.path, stats.rows_read, stats.rows_skipped
        );
    }
}

#[tokio::main]
async fn main() -> Result<(),> {
    // Initialize tracing
    let file_appender = tracing_appender::rolling::never(".", "doc_loader.log",);
    let (non_blocking, _guard,) = tracing_appender::non_blocking(file_appender,);

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info",),),)
        .with(fmt::layer().with_writer(std::io::stderr,),)
        .with(fmt::layer().with_writer(non_blocking,).with_ansi(false,),)
        .init();

    let cli = Cli::parse();
    let cancel = CancellationToken::new();
    let registry = Arc::new(ProcessingRegistry::new(cli.strict, cancel.clone(),),);

    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; stopping after in-flight writes");
            ctrl_c.cancel();
        }
    },);

    let res = match &cli.command {
        Commands::Mongo(args,) => {
            handle_loading(args, Arc::clone(&registry,), cli.concurrency, cancel,).await
        },
    };

    if cli.report {
        registry.save_report()?;
    }

    res?;
    match registry.failure_count() {
        0 => Ok((),),
        n => Err(IngestorError::Other(format!("{} input file(s) failed to load", n),),),
    }
}

fn load_config(args: &MongoArgs,) -> Result<IngestorConfig,> {
    let mut config = IngestorConfig::from_path(&args.config,)?;
    if let Some(database,) = &args.database {
        config.database = database.clone();
    }
    if let Some(collection,) = &args.collection {
        config.collection = collection.clone();
    }
    config.validate()?;
    Ok(config,)
}

fn collect_files(path: &Path,) -> Vec<PathBuf,> {
    let mut files = Vec::new();
    if path.is_file() {
        files.push(path.to_path_buf(),);
    } else if path.is_dir() {
        for entry in walkdir::WalkDir::new(path,)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok(),)
        {
            if entry.path().is_file() {
                files.push(entry.path().to_path_buf(),);
            }
        }
    }
    files
}

async fn handle_loading(
    args: &MongoArgs,
    registry: Arc<ProcessingRegistry,>,
    concurrency: usize,
    cancel: CancellationToken,
) -> Result<(),> {
    let mut config = load_config(args,)?;
    let files = collect_files(&args.path,);

    // Parallel instances must not each drop the collection.
    if files.len() > 1 && config.truncate {
        let store = MongoCollection::connect(
            &args.uri,
            &config.database,
            &config.collection,
            config.retry_settings(),
        )
        .await?;
        info!("Truncating collection '{}' before loading", config.collection);
        store.drop_collection().await?;
        store.ensure_collection().await?;
        store.release().await?;
        config.truncate = false;
    }

    info!(
        "Found {} files to load with concurrency {}",
        files.len(),
        concurrency
    );

    let config = Arc::new(config,);
    let mut join_set = tokio::task::JoinSet::new();
    let semaphore = Arc::new(tokio::sync::Semaphore::new(concurrency.max(1,),),);

    for file in files {
        let permit = Arc::clone(&semaphore,)
            .acquire_owned()
            .await
            .map_err(|e| IngestorError::Other(format!("Worker pool closed: {}", e),),)?;
        if cancel.is_cancelled() {
            break;
        }
        let registry_task = Arc::clone(&registry,);
        let config_task = Arc::clone(&config,);
        let cancel_task = cancel.clone();
        let uri = args.uri.clone();
        let principal = args.principal.clone();

        join_set.spawn(async move {
            let _permit = permit; // Hold permit until task is done
            let file_str = file.to_string_lossy().to_string();
            info!("Processing: {}", file_str);

            match load_file(&file, &uri, &config_task, principal, cancel_task,).await {
                Ok(stats,) => {
                    info!("Successfully loaded: {}", file_str);
                    registry_task.record_success(&file_str, stats,);
                },
                Err(e,) => {
                    if let Err(halt,) = registry_task.record_error(&file_str, e.to_string(),) {
                        warn!("{}", halt);
                    }
                },
            }
        },);
    }

    while let Some(res,) = join_set.join_next().await {
        if let Err(e,) = res {
            error!("Task panicked: {}", e);
        }
    }

    if registry.strict && registry.failure_count() > 0 {
        return Err(IngestorError::Other(
            "Strict mode enabled. Loading halted after a failure".to_string(),
        ),);
    }
    Ok((),)
}

/// One pipeline instance with its own connection, fed by one file.
async fn load_file(
    file: &Path,
    uri: &str,
    config: &IngestorConfig,
    principal: Option<String,>,
    cancel: CancellationToken,
) -> Result<PipelineStats,> {
    let store =
        MongoCollection::connect(uri, &config.database, &config.collection, config.retry_settings(),)
            .await?;
    let mut source = match JsonLinesSource::open(file,).await {
        Ok(source,) => source,
        Err(e,) => {
            store.release().await?;
            return Err(e,);
        },
    };
    let listener = ProgressLogger {
        path:  file.to_string_lossy().to_string(),
        every: 10_000,
        rows:  AtomicU64::new(0,),
    };

    match principal {
        Some(principal,) => {
            RowPipeline::with_auth_scope(config.clone(), store, cancel, NamedScope { principal, },)?
                .run(&mut source, &listener,)
                .await
        },
        None => {
            RowPipeline::new(config.clone(), store, cancel,)?
                .run(&mut source, &listener,)
                .await
        },
    }
}
