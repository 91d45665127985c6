//! Partition keys and artifact naming
//!
//! Every artifact a pipeline run leaves behind is addressed by its partition
//! and a file name derived from a time key:
//!
//! - chunk files: `{time_key}-chunk{sequence:04}.{ext}`
//! - consolidated files: `{time_key}.{ext}`
//! - merge state of a consolidated file: `{time_key}.{ext}.merged`
//!
//! The same names are used on the local filesystem and in remote object
//! storage, under a per-partition directory/prefix given by [`PartitionKey::slug`].

use crate::error::{ForgeError, Result};
use std::fmt;

/// Default extension for record-per-line artifacts
pub const DEFAULT_EXTENSION: &str = "ndjson";

/// Marker between the time key and the sequence number of a chunk file
const CHUNK_MARKER: &str = "-chunk";

/// Appended to a consolidated file name to name its merge state
const MERGE_STATE_SUFFIX: &str = ".merged";

/// Stable key of a unit of ingestion work (e.g. a source prefix)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey(String);

impl PartitionKey {
    /// Validate and normalise a partition key.
    ///
    /// Leading and trailing `/` are dropped so `velocity/N60/` and
    /// `velocity/N60` address the same partition.
    pub fn new(key: impl AsRef<str>) -> Result<Self> {
        let raw = key.as_ref();
        let trimmed = raw.trim().trim_matches('/');

        if trimmed.is_empty() {
            return Err(ForgeError::invalid_partition(raw, "key is empty"));
        }
        if trimmed.split('/').any(|segment| segment == "..") {
            return Err(ForgeError::invalid_partition(
                raw,
                "parent directory segments are not allowed",
            ));
        }
        if trimmed.chars().any(char::is_control) {
            return Err(ForgeError::invalid_partition(
                raw,
                "control characters are not allowed",
            ));
        }

        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Single path component safe to use as a directory or key prefix.
    ///
    /// ASCII letters, digits, `-` and any non-leading `.` are kept; every
    /// other byte becomes `_XX` (upper-case hex). Since `_` itself is
    /// escaped, distinct keys never share a slug.
    pub fn slug(&self) -> String {
        let mut slug = String::with_capacity(self.0.len());
        for (position, byte) in self.0.bytes().enumerate() {
            let keep = byte.is_ascii_alphanumeric()
                || byte == b'-'
                || (byte == b'.' && position > 0);
            if keep {
                slug.push(char::from(byte));
            } else {
                slug.push_str(&format!("_{:02X}", byte));
            }
        }
        slug
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Check that a time key can be embedded in an artifact name
pub fn validate_time_key(time_key: &str) -> Result<()> {
    let valid = !time_key.is_empty()
        && time_key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'));

    if valid {
        Ok(())
    } else {
        Err(ForgeError::InvalidTimeKey(time_key.to_string()))
    }
}

/// Name of the chunk file for one (time key, sequence) pair
pub fn chunk_file_name(time_key: &str, sequence: u32, extension: &str) -> String {
    format!("{time_key}{CHUNK_MARKER}{sequence:04}.{extension}")
}

/// Name of the consolidated file for a time key
pub fn consolidated_file_name(time_key: &str, extension: &str) -> String {
    format!("{time_key}.{extension}")
}

/// Name of the sidecar recording which chunks a consolidated file contains
pub fn merge_state_file_name(time_key: &str, extension: &str) -> String {
    format!("{time_key}.{extension}{MERGE_STATE_SUFFIX}")
}

/// Whether `file_name` is a consolidated file or its merge state sidecar
pub fn is_consolidated_artifact(file_name: &str, extension: &str) -> bool {
    let name = file_name.strip_suffix(MERGE_STATE_SUFFIX).unwrap_or(file_name);
    if parse_chunk_file_name(name, extension).is_some() {
        return false;
    }
    name.strip_suffix(extension)
        .and_then(|stem| stem.strip_suffix('.'))
        .is_some_and(|stem| validate_time_key(stem).is_ok())
}

/// Split a chunk file name back into its time key and sequence number.
///
/// Returns `None` for anything that is not a chunk file with the given
/// extension, including consolidated files.
pub fn parse_chunk_file_name(file_name: &str, extension: &str) -> Option<(String, u32)> {
    let stem = file_name.strip_suffix(extension)?.strip_suffix('.')?;
    let (time_key, digits) = stem.rsplit_once(CHUNK_MARKER)?;

    if time_key.is_empty() || digits.len() < 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    let sequence = digits.parse().ok()?;
    Some((time_key.to_string(), sequence))
}
