//! Resumable, partitioned ingestion framework
//!
//! A partition is listed into fixed-size batches, each batch is fanned out
//! over a worker pool, results are buffered into rotating chunk files, and
//! a forward-only checkpoint records every completed batch. Once the input
//! is exhausted the chunks are consolidated into one file per time key.

pub mod checkpoint;
pub mod chunk_writer;
pub mod consolidator;
pub mod enumerator;
pub mod executor;
pub mod hygiene;
pub mod reingest;
pub mod types;

// Re-export commonly used types
pub use checkpoint::{LocalProgressStore, ProgressStore, RemoteProgressStore};
pub use chunk_writer::ChunkWriter;
pub use consolidator::Consolidator;
pub use enumerator::{enumerate_batches, resolve_partition_for_task, BatchPlan};
pub use executor::{Pipeline, RunOptions};
pub use hygiene::{MallocTrim, NoopHygiene, ResourceHygiene};
pub use reingest::{reingest_partition, ReingestReport};
pub use types::{
    Batch, BatchOutcome, ConsolidatedFile, ItemGenerator, PartitionSummary, Record, SourceMode,
    TimeKeyExtractor, YearTimeKey,
};
