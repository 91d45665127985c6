//! Error types shared across stacforge crates

use thiserror::Error;

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, ForgeError>;

/// Main error type for the shared layer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ForgeError {
    #[error("Invalid partition key '{key}': {reason}")]
    InvalidPartition { key: String, reason: String },

    #[error("Invalid time key '{0}'")]
    InvalidTimeKey(String),
}

impl ForgeError {
    /// Create an invalid partition error
    pub fn invalid_partition(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPartition {
            key: key.into(),
            reason: reason.into(),
        }
    }
}
