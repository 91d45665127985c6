//! Shared fixtures for stacforge integration tests
//!
//! Sources and destinations are local directories behind the same
//! `ObjectStore` trait the S3 backend implements, so every scenario runs
//! without network access.

#![allow(dead_code)]

use serde_json::json;
use stacforge_ingest::framework::{Record, RunOptions, SourceMode};
use stacforge_ingest::storage::{LocalStore, ObjectStore};
use stacforge_ingest::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

pub const PARTITION: &str = "N60W040";

/// Source, output and destination directories of one test
pub struct TestWorkspace {
    pub source_dir: TempDir,
    pub output_dir: TempDir,
    pub destination_dir: TempDir,
    pub source: Arc<dyn ObjectStore>,
    pub destination: Arc<dyn ObjectStore>,
}

impl TestWorkspace {
    pub fn new() -> Self {
        let source_dir = TempDir::new().expect("Failed to create source dir");
        let output_dir = TempDir::new().expect("Failed to create output dir");
        let destination_dir = TempDir::new().expect("Failed to create destination dir");
        let source: Arc<dyn ObjectStore> = Arc::new(LocalStore::new(source_dir.path()));
        let destination: Arc<dyn ObjectStore> = Arc::new(LocalStore::new(destination_dir.path()));
        Self {
            source_dir,
            output_dir,
            destination_dir,
            source,
            destination,
        }
    }

    /// Create one empty source object per name under [`PARTITION`]
    pub async fn with_objects(self, names: &[&str]) -> Self {
        for name in names {
            self.source
                .put(&format!("{}/{}", PARTITION, name), Vec::new())
                .await
                .expect("Failed to create source object");
        }
        self
    }

    pub fn options(&self, batch_size: usize) -> RunOptions {
        RunOptions {
            pattern: "**/*".to_string(),
            source_mode: SourceMode::Keys,
            batch_size,
            workers: 2,
            sync: false,
            reingest: false,
            output_dir: self.output_dir.path().to_path_buf(),
        }
    }

    /// Local directory holding chunks and consolidated files of [`PARTITION`]
    pub fn partition_dir(&self) -> PathBuf {
        self.output_dir.path().join(PARTITION)
    }
}

/// Last path segment of a source URI
pub fn item_name(identifier: &str) -> &str {
    identifier.rsplit('/').next().unwrap_or(identifier)
}

/// Record for an identifier, dated in 2019
pub fn record_for(identifier: &str) -> Result<Record> {
    Record::from_value(json!({
        "type": "Feature",
        "id": item_name(identifier),
        "properties": {"datetime": "2019-06-01T12:00:00Z"}
    }))
}

/// Ids of every record in an NDJSON file, in file order
pub fn ids_in(path: &Path) -> Vec<String> {
    let contents = std::fs::read_to_string(path).unwrap_or_default();
    ids_in_bytes(contents.as_bytes())
}

pub fn ids_in_bytes(data: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(data)
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            Record::from_line(line)
                .expect("Consolidated line is not a record")
                .id
        })
        .collect()
}

/// File names in a directory, sorted; empty when it does not exist
pub fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.file_name().to_string_lossy().to_string())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}
