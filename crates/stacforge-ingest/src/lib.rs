//! stacforge ingestion library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Turns large collections of source objects into catalog records, one
//! partition at a time, and survives interruption without redoing finished
//! work.
//!
//! # Overview
//!
//! - **Enumeration**: list a partition (objects or text manifests) into
//!   fixed-size batches in a stable order
//! - **Execution**: run the item generator over each batch on a bounded
//!   worker pool, with a barrier at every batch boundary
//! - **Checkpoints**: forward-only "last completed batch" per partition, in a
//!   local file or a remote object
//! - **Chunks**: records buffered into `{year}-chunkNNNN.ndjson` files,
//!   optionally synced to S3, consolidated into `{year}.ndjson` at the end
//! - **Catalog**: optional create-or-update of every record against a
//!   STAC-style endpoint
//!
//! # Example
//!
//! ```no_run
//! use stacforge_common::PartitionKey;
//! use stacforge_ingest::{config::PipelineConfig, framework::Pipeline};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = PipelineConfig::new("s3://its-live-data/velocity_image_pair/landsatOLI/v02")
//!         .with_generator("itslive-generate")
//!         .with_pattern("**/*.nc")
//!         .with_batch_size(50);
//!
//!     let pipeline = Pipeline::from_config(&config).await?;
//!     let summary = pipeline
//!         .run_partition(&PartitionKey::new("N60W040")?, &CancellationToken::new())
//!         .await?;
//!     println!("{} records written", summary.records_written);
//!     Ok(())
//! }
//! ```

pub mod catalog;
pub mod cli;
pub mod config;
pub mod error;
pub mod framework;
pub mod generator;
pub mod storage;

// Re-export commonly used types
pub use cli::Cli;
pub use config::PipelineConfig;
pub use error::{IngestError, Result};
pub use framework::Pipeline;
