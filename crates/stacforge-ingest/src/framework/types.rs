//! Core types shared by the pipeline components

use chrono::{DateTime, Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::error::{IngestError, Result};

/// Time key for records whose date attribute is missing or unreadable
pub const UNDATED_TIME_KEY: &str = "undated";

/// JSON pointer of the date attribute in a STAC item
pub const DEFAULT_TIME_FIELD: &str = "/properties/datetime";

/// A generated catalog record
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub id: String,
    pub document: Value,
}

impl Record {
    /// Wrap a JSON document; it must carry a string `id`
    pub fn from_value(document: Value) -> Result<Self> {
        let id = document
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| IngestError::invalid_record("document has no string 'id'"))?
            .to_string();

        Ok(Self { id, document })
    }

    pub fn from_line(line: &str) -> Result<Self> {
        Self::from_value(serde_json::from_str(line)?)
    }

    /// One NDJSON line, without the trailing newline
    pub fn to_line(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.document)?)
    }
}

/// Derives the output time key of a record
pub trait TimeKeyExtractor: Send + Sync {
    fn time_key(&self, record: &Record) -> String;
}

/// Year of a date attribute, e.g. `"2019-03-04T10:00:00Z"` -> `"2019"`
#[derive(Debug, Clone)]
pub struct YearTimeKey {
    pointer: String,
}

impl YearTimeKey {
    pub fn new(pointer: impl Into<String>) -> Self {
        Self {
            pointer: pointer.into(),
        }
    }
}

impl Default for YearTimeKey {
    fn default() -> Self {
        Self::new(DEFAULT_TIME_FIELD)
    }
}

impl TimeKeyExtractor for YearTimeKey {
    fn time_key(&self, record: &Record) -> String {
        record
            .document
            .pointer(&self.pointer)
            .and_then(Value::as_str)
            .and_then(extract_year)
            .map(|year| format!("{:04}", year))
            .unwrap_or_else(|| UNDATED_TIME_KEY.to_string())
    }
}

fn extract_year(value: &str) -> Option<i32> {
    let value = value.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.year());
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return Some(date.year());
    }

    // Anything else that at least starts with a year
    let digits = value.get(..4)?;
    if digits.chars().all(|c| c.is_ascii_digit()) {
        digits.parse().ok()
    } else {
        None
    }
}

/// Turns one source identifier into a record.
///
/// Calls run on blocking worker threads, one call per thread at a time.
pub trait ItemGenerator: Send + Sync + 'static {
    fn generate(&self, identifier: &str) -> Result<Record>;
}

impl<F> ItemGenerator for F
where
    F: Fn(&str) -> Result<Record> + Send + Sync + 'static,
{
    fn generate(&self, identifier: &str) -> Result<Record> {
        self(identifier)
    }
}

/// How the work universe of a partition is listed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SourceMode {
    /// Every object under the partition prefix is an item
    #[default]
    Keys,
    /// Objects under the partition are text manifests, one identifier per line
    Manifest,
}

impl SourceMode {
    pub fn default_pattern(self) -> &'static str {
        match self {
            SourceMode::Keys => "**/*",
            SourceMode::Manifest => "**/*.txt",
        }
    }
}

impl FromStr for SourceMode {
    type Err = IngestError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "keys" | "objects" => Ok(SourceMode::Keys),
            "manifest" | "manifests" => Ok(SourceMode::Manifest),
            _ => Err(IngestError::config(format!("unknown source mode '{}'", s))),
        }
    }
}

impl fmt::Display for SourceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SourceMode::Keys => "keys",
            SourceMode::Manifest => "manifest",
        })
    }
}

/// A zero-indexed group of identifiers processed under one barrier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub index: u64,
    pub items: Vec<String>,
}

/// Result of one executed batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub index: u64,
    pub written: usize,
    pub failed_items: usize,
    pub upserted: usize,
    pub upsert_failures: usize,
}

/// A merged output for one time key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsolidatedFile {
    pub time_key: String,
    /// Local path or remote URI of the merged file
    pub location: String,
    pub chunks_merged: usize,
    pub chunks_missing: usize,
    pub records: usize,
}

/// Final accounting for one partition run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionSummary {
    pub partition: String,
    pub total_batches: u64,
    pub processed_batches: u64,
    pub skipped_batches: u64,
    pub failed_batches: u64,
    pub records_written: usize,
    pub failed_items: usize,
    pub upserted: usize,
    pub upsert_failures: usize,
    pub cancelled: bool,
    pub consolidated: Vec<ConsolidatedFile>,
}
