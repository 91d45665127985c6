//! Pipeline configuration
//!
//! Values come from `FORGE_*` environment variables (a `.env` file is loaded
//! first by the binary) and can be overridden by CLI flags or the `with_*`
//! builders.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

use crate::error::{IngestError, Result};
use crate::framework::types::{SourceMode, DEFAULT_TIME_FIELD};
use crate::storage::{StorageConfig, StorageLocation};

/// Identifiers per batch (one checkpoint per batch)
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Concurrent item generator calls within a batch
pub const DEFAULT_WORKERS: usize = 4;

/// Local directory for chunks, consolidated files and local checkpoints
pub const DEFAULT_OUTPUT_DIR: &str = "./output";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Where the source objects or manifests live (`s3://...` or a path)
    pub source: String,
    /// Partition key under `source`
    pub partition: Option<String>,
    /// Glob matched against partition-relative keys; defaults per source mode
    pub pattern: Option<String>,
    pub source_mode: SourceMode,
    pub batch_size: usize,
    pub workers: usize,
    /// Upload chunks, checkpoints and outputs to `destination`
    pub sync: bool,
    /// Discard progress and artifacts before running
    pub reingest: bool,
    pub output_dir: PathBuf,
    pub destination: Option<String>,
    pub catalog_url: Option<String>,
    pub collection: Option<String>,
    /// JSON pointer of the date attribute used for time keys
    pub time_field: String,
    /// Command line of the item generator
    pub generator: Option<String>,
    /// Array task index; selects the partition among the matching keys of `source`
    pub task_id: Option<usize>,
    pub storage: StorageConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            source: String::new(),
            partition: None,
            pattern: None,
            source_mode: SourceMode::Keys,
            batch_size: DEFAULT_BATCH_SIZE,
            workers: DEFAULT_WORKERS,
            sync: false,
            reingest: false,
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            destination: None,
            catalog_url: None,
            collection: None,
            time_field: DEFAULT_TIME_FIELD.to_string(),
            generator: None,
            task_id: None,
            storage: StorageConfig::default(),
        }
    }
}

fn var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    var(name)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|e| IngestError::config(format!("{} = '{}': {}", name, raw, e)))
        })
        .transpose()
}

fn flag(name: &str) -> bool {
    var(name)
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

impl PipelineConfig {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            ..Self::default()
        }
    }

    /// Load configuration from `FORGE_*` and `S3_*` environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        // Coiled and AWS Batch array jobs expose the task index under their own names
        let task_id = match parse_var("FORGE_TASK_ID")? {
            Some(id) => Some(id),
            None => parse_var("COILED_BATCH_TASK_ID")?,
        };

        Ok(Self {
            source: var("FORGE_SOURCE").unwrap_or_default(),
            partition: var("FORGE_PARTITION"),
            pattern: var("FORGE_PATTERN"),
            source_mode: parse_var("FORGE_SOURCE_MODE")?.unwrap_or(defaults.source_mode),
            batch_size: parse_var("FORGE_BATCH_SIZE")?.unwrap_or(defaults.batch_size),
            workers: parse_var("FORGE_WORKERS")?.unwrap_or(defaults.workers),
            sync: flag("FORGE_SYNC"),
            reingest: flag("FORGE_REINGEST"),
            output_dir: var("FORGE_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_dir),
            destination: var("FORGE_DESTINATION"),
            catalog_url: var("FORGE_CATALOG_URL"),
            collection: var("FORGE_COLLECTION"),
            time_field: var("FORGE_TIME_FIELD").unwrap_or(defaults.time_field),
            generator: var("FORGE_GENERATOR"),
            task_id,
            storage: StorageConfig::from_env(),
        })
    }

    pub fn with_partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = Some(partition.into());
        self
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    pub fn with_source_mode(mut self, mode: SourceMode) -> Self {
        self.source_mode = mode;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }

    pub fn with_reingest(mut self, reingest: bool) -> Self {
        self.reingest = reingest;
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn with_catalog(mut self, url: impl Into<String>, collection: impl Into<String>) -> Self {
        self.catalog_url = Some(url.into());
        self.collection = Some(collection.into());
        self
    }

    pub fn with_time_field(mut self, pointer: impl Into<String>) -> Self {
        self.time_field = pointer.into();
        self
    }

    pub fn with_generator(mut self, command_line: impl Into<String>) -> Self {
        self.generator = Some(command_line.into());
        self
    }

    pub fn with_task_id(mut self, task_id: usize) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn with_storage(mut self, storage: StorageConfig) -> Self {
        self.storage = storage;
        self
    }

    pub fn effective_pattern(&self) -> &str {
        self.pattern
            .as_deref()
            .unwrap_or_else(|| self.source_mode.default_pattern())
    }

    pub fn source_location(&self) -> Result<StorageLocation> {
        if self.source.trim().is_empty() {
            return Err(IngestError::config("source location is not set (FORGE_SOURCE)"));
        }
        self.source.parse()
    }

    pub fn destination_location(&self) -> Result<Option<StorageLocation>> {
        self.destination
            .as_deref()
            .map(str::parse::<StorageLocation>)
            .transpose()
    }

    /// Check the settings shared by every command
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(IngestError::config("batch size must be greater than 0"));
        }
        if self.workers == 0 {
            return Err(IngestError::config("workers must be greater than 0"));
        }
        if self.sync && self.destination.is_none() {
            return Err(IngestError::config(
                "sync requires a destination (FORGE_DESTINATION)",
            ));
        }
        if self.catalog_url.is_some() && self.collection.is_none() {
            return Err(IngestError::config(
                "a catalog URL requires a collection (FORGE_COLLECTION)",
            ));
        }
        if !self.time_field.is_empty() && !self.time_field.starts_with('/') {
            return Err(IngestError::config(format!(
                "time field '{}' must be a JSON pointer such as /properties/datetime",
                self.time_field
            )));
        }
        self.destination_location()?;
        Ok(())
    }

    /// Check what a pipeline run needs on top of [`validate`](Self::validate)
    pub fn validate_for_run(&self) -> Result<()> {
        self.validate()?;
        self.source_location()?;
        if self.partition.is_none() && self.task_id.is_none() {
            return Err(IngestError::config(
                "either a partition (FORGE_PARTITION) or a task id (FORGE_TASK_ID) is required",
            ));
        }
        if self.generator.is_none() {
            return Err(IngestError::config(
                "an item generator command (FORGE_GENERATOR) is required",
            ));
        }
        Ok(())
    }
}
