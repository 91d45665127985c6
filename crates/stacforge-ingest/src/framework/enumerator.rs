//! Source enumeration
//!
//! Lists the work universe of a partition once and hands out fixed-size
//! batches in lexicographic identifier order. Listing the same partition
//! again yields the same batches, which is what makes batch indices safe to
//! checkpoint.

use globset::{GlobBuilder, GlobMatcher};
use tracing::{debug, info, warn};

use super::types::{Batch, SourceMode};
use crate::error::{IngestError, Result};
use crate::storage::ObjectStore;

/// The ordered identifiers of a partition, split into batches on demand
#[derive(Debug, Clone)]
pub struct BatchPlan {
    identifiers: Vec<String>,
    batch_size: usize,
}

impl BatchPlan {
    pub fn new(mut identifiers: Vec<String>, batch_size: usize) -> Self {
        identifiers.sort();
        Self {
            identifiers,
            batch_size: batch_size.max(1),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn total_items(&self) -> usize {
        self.identifiers.len()
    }

    pub fn total_batches(&self) -> u64 {
        self.identifiers.len().div_ceil(self.batch_size) as u64
    }

    /// Batches in index order. Each call starts again from batch 0.
    pub fn iter(&self) -> impl Iterator<Item = Batch> + '_ {
        self.identifiers
            .chunks(self.batch_size)
            .enumerate()
            .map(|(index, items)| Batch {
                index: index as u64,
                items: items.to_vec(),
            })
    }
}

fn compile_pattern(pattern: &str) -> Result<GlobMatcher> {
    GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .map(|glob| glob.compile_matcher())
        .map_err(|e| IngestError::config(format!("invalid pattern '{}': {}", pattern, e)))
}

/// Keys at or under `partition` whose partition-relative path matches `matcher`
async fn matching_keys(
    store: &dyn ObjectStore,
    partition: &str,
    matcher: &GlobMatcher,
) -> Result<Vec<String>> {
    let listing = store
        .list(partition)
        .await
        .map_err(|e| IngestError::source_access(store.uri(partition), format!("{:#}", e)))?;

    let dir_prefix = format!("{}/", partition);
    let mut keys: Vec<String> = listing
        .into_iter()
        .filter(|key| {
            let relative = if key == partition {
                key.rsplit('/').next().unwrap_or(key)
            } else if let Some(relative) = key.strip_prefix(&dir_prefix) {
                relative
            } else {
                // Sibling such as "N60W0400/..." for partition "N60W040"
                return false;
            };
            matcher.is_match(relative)
        })
        .collect();

    keys.sort();
    Ok(keys)
}

/// Identifiers listed in a manifest: trimmed, blank lines dropped
pub fn parse_manifest(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// List a partition and split it into batches of `batch_size`.
///
/// In [`SourceMode::Keys`] every matching object is an item, identified by
/// its store URI. In [`SourceMode::Manifest`] every matching object is a
/// manifest and its lines are the items. The partition may name a single
/// manifest object.
pub async fn enumerate_batches(
    store: &dyn ObjectStore,
    partition: &str,
    pattern: &str,
    mode: SourceMode,
    batch_size: usize,
) -> Result<BatchPlan> {
    let matcher = compile_pattern(pattern)?;
    let keys = matching_keys(store, partition, &matcher).await?;

    let identifiers = match mode {
        SourceMode::Keys => keys.iter().map(|key| store.uri(key)).collect(),
        SourceMode::Manifest => {
            let mut identifiers = Vec::new();
            for key in &keys {
                let contents = store
                    .get(key)
                    .await
                    .map_err(|e| IngestError::source_access(store.uri(key), format!("{:#}", e)))?
                    .ok_or_else(|| {
                        IngestError::source_access(store.uri(key), "manifest disappeared")
                    })?;
                let lines = parse_manifest(&String::from_utf8_lossy(&contents));
                debug!(manifest = %key, items = lines.len(), "Read manifest");
                identifiers.extend(lines);
            }
            identifiers
        }
    };

    let plan = BatchPlan::new(identifiers, batch_size);
    info!(
        partition = %partition,
        mode = %mode,
        objects = keys.len(),
        items = plan.total_items(),
        batches = plan.total_batches(),
        "Enumerated partition"
    );

    Ok(plan)
}

/// Pick the partition of an array task: the `task_id`-th matching key
/// under the store root, in sorted order.
pub async fn resolve_partition_for_task(
    store: &dyn ObjectStore,
    pattern: &str,
    task_id: usize,
) -> Result<Option<String>> {
    let matcher = compile_pattern(pattern)?;
    let mut keys: Vec<String> = store
        .list("")
        .await
        .map_err(|e| IngestError::source_access(store.uri(""), format!("{:#}", e)))?
        .into_iter()
        .filter(|key| matcher.is_match(key))
        .collect();
    keys.sort();

    match keys.get(task_id) {
        Some(key) => {
            info!(task_id, partition = %key, "Resolved partition for task");
            Ok(Some(key.clone()))
        }
        None => {
            warn!(
                task_id,
                available = keys.len(),
                "Task id is out of range, nothing to do"
            );
            Ok(None)
        }
    }
}
