//! Error types for the ingestion pipeline
//!
//! Only [`IngestError::SourceAccess`] aborts a partition run. Every other
//! variant is raised at a narrower scope (one item, one batch, one artifact)
//! and the executor logs it and carries on.

use stacforge_common::ForgeError;
use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, IngestError>;

#[derive(Error, Debug)]
pub enum IngestError {
    /// The partition's objects or manifests could not be listed or read
    #[error("Cannot access source '{prefix}': {message}")]
    SourceAccess { prefix: String, message: String },

    /// The item generator failed for one identifier
    #[error("Item generation failed for '{identifier}': {message}")]
    ItemGeneration { identifier: String, message: String },

    /// Something escaped a whole batch (worker crash, chunk write failure)
    #[error("Batch {batch_index} failed: {message}")]
    BatchExecution { batch_index: u64, message: String },

    /// A checkpoint or chunk could not be persisted
    #[error("Failed to persist '{target}': {message}")]
    Persist { target: String, message: String },

    /// A chunk could not be merged into its consolidated file
    #[error("Consolidation of time key '{time_key}' failed: {message}")]
    Consolidation { time_key: String, message: String },

    /// The catalog endpoint answered with an unexpected status
    #[error("Catalog request to {url} failed with status {status}: {body}")]
    Catalog {
        url: String,
        status: u16,
        body: String,
    },

    /// A generated document is not a usable record
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// Configuration is missing or invalid
    #[error("Configuration error: {0}. Check your FORGE_* environment variables or CLI flags.")]
    Config(String),

    #[error(transparent)]
    Common(#[from] ForgeError),

    #[error("File operation failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse JSON: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl IngestError {
    pub fn source_access(prefix: impl Into<String>, message: impl ToString) -> Self {
        Self::SourceAccess {
            prefix: prefix.into(),
            message: message.to_string(),
        }
    }

    pub fn item_generation(identifier: impl Into<String>, message: impl ToString) -> Self {
        Self::ItemGeneration {
            identifier: identifier.into(),
            message: message.to_string(),
        }
    }

    pub fn batch_execution(batch_index: u64, message: impl ToString) -> Self {
        Self::BatchExecution {
            batch_index,
            message: message.to_string(),
        }
    }

    pub fn persist(target: impl Into<String>, message: impl ToString) -> Self {
        Self::Persist {
            target: target.into(),
            message: message.to_string(),
        }
    }

    pub fn consolidation(time_key: impl Into<String>, message: impl ToString) -> Self {
        Self::Consolidation {
            time_key: time_key.into(),
            message: message.to_string(),
        }
    }

    pub fn invalid_record(msg: impl Into<String>) -> Self {
        Self::InvalidRecord(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether this error ends the partition run
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::SourceAccess { .. } | Self::Config(_))
    }
}
