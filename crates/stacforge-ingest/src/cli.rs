//! Command-line interface
//!
//! Every flag overrides the matching `FORGE_*` environment variable.

use clap::{Args, Parser, Subcommand};
use stacforge_common::PartitionKey;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::catalog::CatalogClient;
use crate::config::PipelineConfig;
use crate::error::{IngestError, Result};
use crate::framework::{
    resolve_partition_for_task, LocalProgressStore, Pipeline, ProgressStore, RemoteProgressStore,
    SourceMode,
};

/// stacforge - resumable, partitioned catalog ingestion
#[derive(Parser, Debug)]
#[command(name = "stacforge")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Verbose output (debug logging)
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Process one partition into chunked and consolidated records
    Run(RunArgs),

    /// Show the checkpoint of a partition
    Status(StatusArgs),

    /// Upsert every record of an NDJSON file into the catalog
    Ingest(IngestArgs),
}

#[derive(Args, Debug, Default, Clone)]
pub struct RunArgs {
    /// Source location, s3://bucket/prefix or a local directory [env: FORGE_SOURCE]
    #[arg(short, long)]
    pub source: Option<String>,

    /// Partition key under the source [env: FORGE_PARTITION]
    #[arg(short, long)]
    pub partition: Option<String>,

    /// Glob matched against partition-relative keys [env: FORGE_PATTERN]
    #[arg(long)]
    pub pattern: Option<String>,

    /// Treat matching objects as manifests listing one identifier per line
    #[arg(long)]
    pub manifest: bool,

    /// Identifiers per batch [env: FORGE_BATCH_SIZE]
    #[arg(short, long)]
    pub batch_size: Option<usize>,

    /// Concurrent generator calls [env: FORGE_WORKERS]
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Upload chunks, checkpoints and outputs to the destination
    #[arg(long)]
    pub sync: bool,

    /// Discard progress and outputs of the partition and start over
    #[arg(long)]
    pub reingest: bool,

    /// Local directory for chunks and outputs [env: FORGE_OUTPUT_DIR]
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,

    /// Remote location for synced artifacts [env: FORGE_DESTINATION]
    #[arg(short, long)]
    pub destination: Option<String>,

    /// Catalog endpoint to upsert records into [env: FORGE_CATALOG_URL]
    #[arg(long)]
    pub catalog_url: Option<String>,

    /// Catalog collection [env: FORGE_COLLECTION]
    #[arg(long)]
    pub collection: Option<String>,

    /// JSON pointer of the date attribute [env: FORGE_TIME_FIELD]
    #[arg(long)]
    pub time_field: Option<String>,

    /// Item generator command; the identifier is appended [env: FORGE_GENERATOR]
    #[arg(short, long)]
    pub generator: Option<String>,

    /// Array task index selecting the partition [env: FORGE_TASK_ID]
    #[arg(long)]
    pub task_id: Option<usize>,
}

impl RunArgs {
    pub fn apply(self, mut config: PipelineConfig) -> PipelineConfig {
        if let Some(source) = self.source {
            config.source = source;
        }
        if let Some(partition) = self.partition {
            config.partition = Some(partition);
        }
        if let Some(pattern) = self.pattern {
            config.pattern = Some(pattern);
        }
        if self.manifest {
            config.source_mode = SourceMode::Manifest;
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        config.sync |= self.sync;
        config.reingest |= self.reingest;
        if let Some(dir) = self.output_dir {
            config.output_dir = dir;
        }
        if let Some(destination) = self.destination {
            config.destination = Some(destination);
        }
        if let Some(url) = self.catalog_url {
            config.catalog_url = Some(url);
        }
        if let Some(collection) = self.collection {
            config.collection = Some(collection);
        }
        if let Some(time_field) = self.time_field {
            config.time_field = time_field;
        }
        if let Some(generator) = self.generator {
            config.generator = Some(generator);
        }
        if let Some(task_id) = self.task_id {
            config.task_id = Some(task_id);
        }
        config
    }
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    /// Partition key [env: FORGE_PARTITION]
    #[arg(short, long)]
    pub partition: Option<String>,

    /// Directory holding the local checkpoint file [env: FORGE_OUTPUT_DIR]
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,

    /// Read the remote checkpoint at the destination instead
    #[arg(long)]
    pub sync: bool,

    /// Remote location of synced artifacts [env: FORGE_DESTINATION]
    #[arg(short, long)]
    pub destination: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct IngestArgs {
    /// NDJSON file with one record per line
    pub file: PathBuf,

    /// Catalog endpoint [env: FORGE_CATALOG_URL]
    #[arg(long)]
    pub catalog_url: Option<String>,

    /// Catalog collection [env: FORGE_COLLECTION]
    #[arg(long)]
    pub collection: Option<String>,

    /// Concurrent requests [env: FORGE_WORKERS]
    #[arg(short, long)]
    pub workers: Option<usize>,
}

impl Cli {
    /// Run the selected command with configuration from the environment
    pub async fn execute(self, cancel: CancellationToken) -> Result<()> {
        let config = PipelineConfig::from_env()?;
        match self.command {
            Commands::Run(args) => run(args.apply(config), cancel).await,
            Commands::Status(args) => status(args, config).await,
            Commands::Ingest(args) => ingest(args, config).await,
        }
    }
}

async fn run(config: PipelineConfig, cancel: CancellationToken) -> Result<()> {
    config.validate_for_run()?;
    let pipeline = Pipeline::from_config(&config).await?;

    let partition = match (&config.partition, config.task_id) {
        (Some(partition), _) => partition.clone(),
        (None, Some(task_id)) => {
            match resolve_partition_for_task(
                pipeline.source().as_ref(),
                config.effective_pattern(),
                task_id,
            )
            .await?
            {
                Some(partition) => partition,
                None => return Ok(()),
            }
        }
        (None, None) => {
            return Err(IngestError::config("no partition or task id given"));
        }
    };

    let partition = PartitionKey::new(partition)?;
    info!(partition = %partition, source = %config.source, "Running partition");

    let summary = pipeline.run_partition(&partition, &cancel).await?;

    println!(
        "{}: {} of {} batches processed, {} skipped, {} failed; {} records written, {} items failed",
        summary.partition,
        summary.processed_batches,
        summary.total_batches,
        summary.skipped_batches,
        summary.failed_batches,
        summary.records_written,
        summary.failed_items,
    );
    for file in &summary.consolidated {
        println!("  {} -> {} ({} records)", file.time_key, file.location, file.records);
    }
    if summary.cancelled {
        warn!("Run interrupted; rerun to resume from the last checkpoint");
    }

    Ok(())
}

async fn status(args: StatusArgs, mut config: PipelineConfig) -> Result<()> {
    if let Some(dir) = args.output_dir {
        config.output_dir = dir;
    }
    if let Some(destination) = args.destination {
        config.destination = Some(destination);
    }
    config.sync |= args.sync;

    let partition = args
        .partition
        .or(config.partition.clone())
        .ok_or_else(|| IngestError::config("a partition is required"))?;
    let partition = PartitionKey::new(partition)?;

    let progress: Arc<dyn ProgressStore> = if config.sync {
        let location = config
            .destination_location()?
            .ok_or_else(|| IngestError::config("sync requires a destination"))?;
        Arc::new(RemoteProgressStore::new(location.open(&config.storage).await?))
    } else {
        Arc::new(LocalProgressStore::in_dir(&config.output_dir))
    };

    match progress.get_last_completed(&partition).await {
        Some(index) => println!(
            "{}: last completed batch {} ({})",
            partition,
            index,
            progress.location()
        ),
        None => println!("{}: no completed batches ({})", partition, progress.location()),
    }

    Ok(())
}

async fn ingest(args: IngestArgs, config: PipelineConfig) -> Result<()> {
    let url = args
        .catalog_url
        .or(config.catalog_url)
        .ok_or_else(|| IngestError::config("a catalog URL is required"))?;
    let collection = args
        .collection
        .or(config.collection)
        .ok_or_else(|| IngestError::config("a collection is required"))?;
    let workers = args.workers.unwrap_or(config.workers).max(1);

    let client = CatalogClient::new(url, collection)?;
    let report = client.ingest_file(&args.file, workers).await?;

    println!(
        "{}: {} created, {} updated, {} unchanged, {} failed",
        args.file.display(),
        report.created,
        report.updated,
        report.unchanged,
        report.failed
    );
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_flags() {
        let cli = Cli::try_parse_from([
            "stacforge",
            "run",
            "--source",
            "s3://its-live-data/velocity_image_pair",
            "-p",
            "N60W040",
            "-b",
            "50",
            "--sync",
            "-d",
            "s3://out/chunks",
            "--manifest",
        ])
        .unwrap();

        let Commands::Run(args) = cli.command else {
            panic!("expected run command");
        };
        let config = args.apply(PipelineConfig::new("./ignored"));
        assert_eq!(config.source, "s3://its-live-data/velocity_image_pair");
        assert_eq!(config.partition.as_deref(), Some("N60W040"));
        assert_eq!(config.batch_size, 50);
        assert!(config.sync);
        assert_eq!(config.source_mode, SourceMode::Manifest);
        assert_eq!(config.destination.as_deref(), Some("s3://out/chunks"));
    }

    #[test]
    fn test_flags_do_not_clear_environment_values() {
        let env_config = PipelineConfig::new("./data")
            .with_partition("from-env")
            .with_sync(true)
            .with_workers(9);
        let config = RunArgs::default().apply(env_config.clone());
        assert_eq!(config, env_config);
    }

    #[test]
    fn test_parse_ingest() {
        let cli = Cli::try_parse_from([
            "stacforge",
            "-v",
            "ingest",
            "2019.ndjson",
            "--catalog-url",
            "http://localhost:8080",
            "--collection",
            "itslive",
        ])
        .unwrap();
        assert!(cli.verbose);
        assert!(matches!(cli.command, Commands::Ingest(ref a) if a.file == PathBuf::from("2019.ndjson")));
    }
}
