//! Batch executor and resume loop
//!
//! Drives one partition: read the checkpoint, optionally reset it, run every
//! batch past the checkpoint through the worker pool, and consolidate the
//! checkpointed chunks once the input is exhausted or the run is cancelled.
//! Batches run strictly one after another; within a batch every item must
//! come back before anything is written, checkpointed or rotated.
//!
//! The checkpoint only moves over contiguous completed batches. After a
//! failed batch the run keeps going, but later completions are not recorded
//! and the next run redoes them.

use futures::stream::{self, StreamExt};
use stacforge_common::PartitionKey;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::checkpoint::{LocalProgressStore, ProgressStore, RemoteProgressStore};
use super::chunk_writer::ChunkWriter;
use super::enumerator::enumerate_batches;
use super::hygiene::{MallocTrim, ResourceHygiene};
use super::reingest::reingest_partition;
use super::types::{
    Batch, BatchOutcome, ItemGenerator, PartitionSummary, Record, SourceMode, TimeKeyExtractor,
    YearTimeKey,
};
use crate::catalog::CatalogClient;
use crate::config::PipelineConfig;
use crate::error::{IngestError, Result};
use crate::generator::CommandGenerator;
use crate::storage::ObjectStore;

/// Per-run knobs of the executor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    pub pattern: String,
    pub source_mode: SourceMode,
    pub batch_size: usize,
    pub workers: usize,
    pub sync: bool,
    pub reingest: bool,
    pub output_dir: PathBuf,
}

impl RunOptions {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            pattern: config.effective_pattern().to_string(),
            source_mode: config.source_mode,
            batch_size: config.batch_size,
            workers: config.workers,
            sync: config.sync,
            reingest: config.reingest,
            output_dir: config.output_dir.clone(),
        }
    }
}

pub struct Pipeline {
    options: RunOptions,
    source: Arc<dyn ObjectStore>,
    destination: Option<Arc<dyn ObjectStore>>,
    progress: Arc<dyn ProgressStore>,
    generator: Arc<dyn ItemGenerator>,
    time_keys: Arc<dyn TimeKeyExtractor>,
    catalog: Option<CatalogClient>,
    hygiene: Arc<dyn ResourceHygiene>,
}

impl Pipeline {
    /// Pipeline with local checkpoints in `options.output_dir`, year time
    /// keys and the malloc-trim hygiene hook
    pub fn new(
        options: RunOptions,
        source: Arc<dyn ObjectStore>,
        generator: Arc<dyn ItemGenerator>,
    ) -> Self {
        Self {
            progress: Arc::new(LocalProgressStore::in_dir(&options.output_dir)),
            options,
            source,
            destination: None,
            generator,
            time_keys: Arc::new(YearTimeKey::default()),
            catalog: None,
            hygiene: Arc::new(MallocTrim),
        }
    }

    /// Open stores and collaborators described by `config`
    pub async fn from_config(config: &PipelineConfig) -> Result<Self> {
        config.validate()?;

        let source = config.source_location()?.open(&config.storage).await?;
        let generator = CommandGenerator::parse(config.generator.as_deref().unwrap_or_default())?;
        let mut pipeline = Self::new(RunOptions::from_config(config), source, Arc::new(generator))
            .with_time_keys(Arc::new(YearTimeKey::new(config.time_field.clone())));

        if let Some(location) = config.destination_location()? {
            let destination = location.open(&config.storage).await?;
            if config.sync {
                pipeline = pipeline
                    .with_progress_store(Arc::new(RemoteProgressStore::new(Arc::clone(&destination))));
            }
            pipeline = pipeline.with_destination(destination);
        }

        if let (Some(url), Some(collection)) = (&config.catalog_url, &config.collection) {
            pipeline = pipeline.with_catalog(CatalogClient::new(url.clone(), collection.clone())?);
        }

        Ok(pipeline)
    }

    pub fn with_destination(mut self, destination: Arc<dyn ObjectStore>) -> Self {
        self.destination = Some(destination);
        self
    }

    pub fn with_progress_store(mut self, progress: Arc<dyn ProgressStore>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_time_keys(mut self, time_keys: Arc<dyn TimeKeyExtractor>) -> Self {
        self.time_keys = time_keys;
        self
    }

    pub fn with_catalog(mut self, catalog: CatalogClient) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn with_hygiene(mut self, hygiene: Arc<dyn ResourceHygiene>) -> Self {
        self.hygiene = hygiene;
        self
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    pub fn source(&self) -> &Arc<dyn ObjectStore> {
        &self.source
    }

    pub fn progress(&self) -> &Arc<dyn ProgressStore> {
        &self.progress
    }

    fn chunk_writer(&self, partition: &PartitionKey) -> ChunkWriter {
        let writer = ChunkWriter::new(
            partition.clone(),
            &self.options.output_dir,
            Arc::clone(&self.time_keys),
        );
        match &self.destination {
            Some(destination) => writer.with_remote(Arc::clone(destination)),
            None => writer,
        }
    }

    /// Process one partition until its input is exhausted or `cancel` fires.
    ///
    /// Only enumeration and local setup failures are returned as errors;
    /// item, batch, persist and consolidation failures are logged and
    /// counted in the summary.
    #[instrument(skip(self, partition, cancel), fields(partition = %partition))]
    pub async fn run_partition(
        &self,
        partition: &PartitionKey,
        cancel: &CancellationToken,
    ) -> Result<PartitionSummary> {
        let started = Instant::now();
        let options = &self.options;
        let mut summary = PartitionSummary {
            partition: partition.to_string(),
            ..Default::default()
        };

        let mut last = self.progress.get_last_completed(partition).await;
        let mut writer = self.chunk_writer(partition);

        if options.reingest {
            reingest_partition(self.progress.as_ref(), &writer).await?;
            last = None;
        }

        let plan = enumerate_batches(
            self.source.as_ref(),
            partition.as_str(),
            &options.pattern,
            options.source_mode,
            options.batch_size,
        )
        .await?;
        summary.total_batches = plan.total_batches();

        let start = last.map_or(0, |index| index + 1);
        let start_sequence = u32::try_from(start)
            .map_err(|_| IngestError::config(format!("batch index {} out of range", start)))?;
        writer.prepare(start_sequence, options.sync).await?;

        info!(
            last_completed = ?last,
            batches = summary.total_batches,
            batch_size = options.batch_size,
            workers = options.workers,
            sync = options.sync,
            "Starting partition"
        );

        // Chunks below this sequence belong to checkpointed batches
        let mut committed = start_sequence;
        let mut checkpoint_held = false;

        for batch in plan.iter() {
            if last.is_some_and(|last| batch.index <= last) {
                summary.skipped_batches += 1;
                debug!(batch = batch.index, "Batch already completed, skipping");
                if batch.items.len() < plan.batch_size() {
                    info!(batch = batch.index, "All batches processed");
                }
                continue;
            }

            if cancel.is_cancelled() {
                warn!(next_batch = batch.index, "Cancellation requested, stopping before batch");
                summary.cancelled = true;
                break;
            }

            let record_progress = !checkpoint_held;
            match self
                .execute_batch(&mut writer, partition, &batch, record_progress)
                .await
            {
                Ok(outcome) => {
                    if record_progress {
                        committed = writer.sequence();
                    } else {
                        info!(
                            batch = outcome.index,
                            "Checkpoint held at an earlier failed batch, completion not recorded"
                        );
                    }
                    summary.processed_batches += 1;
                    summary.records_written += outcome.written;
                    summary.failed_items += outcome.failed_items;
                    summary.upserted += outcome.upserted;
                    summary.upsert_failures += outcome.upsert_failures;
                    info!(
                        batch = outcome.index,
                        written = outcome.written,
                        failed_items = outcome.failed_items,
                        upserted = outcome.upserted,
                        processed = summary.processed_batches,
                        skipped = summary.skipped_batches,
                        failed = summary.failed_batches,
                        "Batch completed"
                    );
                }
                Err(e) => {
                    writer.abandon_batch().await;
                    checkpoint_held = true;
                    summary.failed_batches += 1;
                    error!(
                        batch = batch.index,
                        error = %e,
                        processed = summary.processed_batches,
                        skipped = summary.skipped_batches,
                        failed = summary.failed_batches,
                        "Batch failed, checkpoint not advanced"
                    );
                }
            }

            self.hygiene.after_batch();
        }

        self.consolidate(&mut writer, committed, &mut summary).await;

        info!(
            total_batches = summary.total_batches,
            processed = summary.processed_batches,
            skipped = summary.skipped_batches,
            failed = summary.failed_batches,
            records = summary.records_written,
            failed_items = summary.failed_items,
            consolidated = summary.consolidated.len(),
            cancelled = summary.cancelled,
            elapsed_secs = started.elapsed().as_secs_f64(),
            "Partition finished"
        );

        Ok(summary)
    }

    /// Merge the chunks of checkpointed batches, those below `committed`.
    /// Anything later is redone by the next run.
    async fn consolidate(
        &self,
        writer: &mut ChunkWriter,
        committed: u32,
        summary: &mut PartitionSummary,
    ) {
        let sync = self.options.sync;
        if sync && writer.pending_uploads() > 0 {
            writer.upload_touched(true).await;
        }

        for time_key in writer.time_keys() {
            match writer.consolidate(&time_key, committed, sync).await {
                Ok(file) if file.chunks_merged > 0 => summary.consolidated.push(file),
                Ok(_) => {}
                Err(e) => error!(time_key = %time_key, error = %e, "Consolidation failed"),
            }
        }
    }

    async fn execute_batch(
        &self,
        writer: &mut ChunkWriter,
        partition: &PartitionKey,
        batch: &Batch,
        record_progress: bool,
    ) -> Result<BatchOutcome> {
        let results = self.dispatch(batch).await?;

        let mut records = Vec::with_capacity(results.len());
        let mut failed_items = 0;
        for (identifier, result) in results {
            match result {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(
                        batch = batch.index,
                        identifier = %identifier,
                        error = %e,
                        "Item generation failed, excluding item"
                    );
                    failed_items += 1;
                }
            }
        }

        let written = writer
            .write_all(&records)
            .await
            .map_err(|e| IngestError::batch_execution(batch.index, e))?;
        writer.upload_touched(self.options.sync).await;

        let (upserted, upsert_failures) = match &self.catalog {
            Some(catalog) => {
                let report = catalog.upsert_all(&records, self.options.workers).await;
                (report.succeeded(), report.failed)
            }
            None => (0, 0),
        };

        if record_progress {
            if let Err(e) = self.progress.mark_completed(partition, batch.index).await {
                warn!(
                    batch = batch.index,
                    error = %e,
                    "Checkpoint not persisted, progress kept in memory"
                );
            }
        }
        writer.rotate();

        Ok(BatchOutcome {
            index: batch.index,
            written,
            failed_items,
            upserted,
            upsert_failures,
        })
    }

    /// Run the generator for every item of `batch` on blocking workers and
    /// wait for all of them. Results come back in enumeration order.
    async fn dispatch(&self, batch: &Batch) -> Result<Vec<(String, Result<Record>)>> {
        let mut joined: Vec<_> = stream::iter(batch.items.iter().cloned().enumerate())
            .map(|(position, identifier)| {
                let generator = Arc::clone(&self.generator);
                async move {
                    let item = identifier.clone();
                    let outcome =
                        tokio::task::spawn_blocking(move || generator.generate(&item)).await;
                    (position, identifier, outcome)
                }
            })
            .buffer_unordered(self.options.workers.max(1))
            .collect()
            .await;

        joined.sort_by_key(|(position, _, _)| *position);

        joined
            .into_iter()
            .map(|(_, identifier, outcome)| match outcome {
                Ok(result) => Ok((identifier, result)),
                Err(e) => Err(IngestError::batch_execution(
                    batch.index,
                    format!("worker for '{}' crashed: {}", identifier, e),
                )),
            })
            .collect()
    }
}
