//! stacforge common library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared naming rules, error types and logging setup for the stacforge
//! workspace.
//!
//! # Overview
//!
//! - **Naming**: partition keys and the on-disk/on-bucket names of chunk and
//!   consolidated files
//! - **Errors**: `ForgeError` and the `Result` alias
//! - **Logging**: `tracing` subscriber configuration shared by every binary
//!
//! # Example
//!
//! ```
//! use stacforge_common::naming::{chunk_file_name, PartitionKey};
//!
//! let partition = PartitionKey::new("velocity/N60W040").unwrap();
//! assert_eq!(partition.slug(), "velocity_2FN60W040");
//! assert_eq!(chunk_file_name("2019", 3, "ndjson"), "2019-chunk0003.ndjson");
//! ```

pub mod error;
pub mod logging;
pub mod naming;

// Re-export commonly used types
pub use error::{ForgeError, Result};
pub use naming::PartitionKey;
