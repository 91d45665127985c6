//! Chunk consolidation
//!
//! Concatenates a time key's chunks in sequence order into
//! `{time_key}.ndjson`. An existing consolidated file is kept as the head of
//! the new one, so a resumed partition appends instead of overwriting.
//!
//! Each consolidated file has a `{time_key}.ndjson.merged` sidecar naming the
//! first sequence it does not contain yet. Chunks below that sequence are
//! already part of the file: if one shows up again (a delete failed, or a
//! crash hit between writing and cleanup) it is removed instead of merged a
//! second time. Chunks skipped as corrupt stay in place. The sidecar is written before the file and keeps the
//! previous state, so whichever of the two a crash leaves on disk, the
//! file's length tells which state applies.
//!
//! Merged chunks are deleted afterwards; missing or corrupt chunks are
//! logged and skipped.

use serde::de::IgnoredAny;
use serde::{Deserialize, Serialize};
use stacforge_common::naming::{
    chunk_file_name, consolidated_file_name, merge_state_file_name, parse_chunk_file_name,
};
use stacforge_common::PartitionKey;
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{debug, info, warn};

use super::types::ConsolidatedFile;
use crate::error::{IngestError, Result};
use crate::storage::{local, ObjectStore};

/// Contents of the merge state sidecar
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct MergeState {
    /// Chunks below this sequence are in the consolidated file
    merged_through: u32,
    /// Length of the consolidated file holding exactly those chunks
    length: u64,
    previous_through: u32,
    previous_length: u64,
    /// Corrupt or unreadable chunks below `merged_through`, kept for inspection
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    skipped: BTreeSet<u32>,
}

impl MergeState {
    /// First unmerged sequence for a consolidated file of `length` bytes
    fn base_for(&self, length: u64) -> Option<u32> {
        if length == self.length {
            Some(self.merged_through)
        } else if length == self.previous_length {
            Some(self.previous_through)
        } else {
            None
        }
    }
}

pub struct Consolidator<'a> {
    local_dir: &'a Path,
    remote: Option<&'a dyn ObjectStore>,
    remote_prefix: &'a str,
    extension: &'a str,
}

impl<'a> Consolidator<'a> {
    pub fn new(
        local_dir: &'a Path,
        remote: Option<&'a dyn ObjectStore>,
        remote_prefix: &'a str,
        extension: &'a str,
    ) -> Self {
        Self {
            local_dir,
            remote,
            remote_prefix,
            extension,
        }
    }

    fn remote_key(&self, file_name: &str) -> String {
        format!("{}{}", self.remote_prefix, file_name)
    }

    /// Destination store when consolidating in sync mode
    fn target_remote(&self, sync: bool) -> Option<&'a dyn ObjectStore> {
        self.remote.filter(|_| sync)
    }

    async fn read_local(&self, file_name: &str) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.local_dir.join(file_name)).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Remote copy first when syncing, local copy otherwise or as a fallback
    async fn read_chunk(&self, file_name: &str, sync: bool) -> Result<Option<Vec<u8>>> {
        if let Some(remote) = self.target_remote(sync) {
            if let Some(data) = remote.get(&self.remote_key(file_name)).await? {
                return Ok(Some(data));
            }
        }
        self.read_local(file_name).await
    }

    /// Consolidated output or its sidecar, from wherever the output lives
    async fn read_output(&self, file_name: &str, sync: bool) -> Result<Option<Vec<u8>>> {
        match self.target_remote(sync) {
            Some(remote) => Ok(remote.get(&self.remote_key(file_name)).await?),
            None => self.read_local(file_name).await,
        }
    }

    async fn write_output(&self, file_name: &str, data: Vec<u8>, sync: bool) -> Result<()> {
        match self.target_remote(sync) {
            Some(remote) => Ok(remote.put(&self.remote_key(file_name), data).await?),
            None => Ok(local::write_atomic(&self.local_dir.join(file_name), &data).await?),
        }
    }

    /// Sequences of `time_key` chunks present locally, and remotely when syncing
    async fn present_chunks(&self, time_key: &str, sync: bool) -> Result<BTreeSet<u32>> {
        let mut names = Vec::new();

        match tokio::fs::read_dir(self.local_dir).await {
            Ok(mut entries) => {
                while let Some(entry) = entries.next_entry().await? {
                    names.push(entry.file_name().to_string_lossy().to_string());
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if let Some(remote) = self.target_remote(sync) {
            for key in remote.list(self.remote_prefix).await? {
                names.push(key.strip_prefix(self.remote_prefix).unwrap_or(&key).to_string());
            }
        }

        Ok(names
            .iter()
            .filter_map(|name| parse_chunk_file_name(name, self.extension))
            .filter(|(key, _)| key == time_key)
            .map(|(_, sequence)| sequence)
            .collect())
    }

    /// Delete a chunk everywhere it may live. Failures are only logged.
    async fn remove_chunk(&self, name: &str, sync: bool) {
        if let Some(remote) = self.target_remote(sync) {
            if let Err(e) = remote.delete(&self.remote_key(name)).await {
                warn!(chunk = %name, error = %e, "Failed to delete remote chunk");
            }
        }
        if let Err(e) = local::remove_if_exists(&self.local_dir.join(name)).await {
            warn!(chunk = %name, error = %e, "Failed to delete local chunk");
        }
    }

    /// Merge chunks `0..chunk_count` of `time_key` that the consolidated
    /// file does not contain yet. Chunks at or above `chunk_count` are left
    /// alone.
    ///
    /// With `sync` the result is uploaded and both remote and local chunks
    /// are removed once the upload succeeded; nothing is left locally.
    /// Without it the result is written next to the chunks.
    pub async fn consolidate(
        &self,
        partition: &PartitionKey,
        time_key: &str,
        chunk_count: u32,
        sync: bool,
    ) -> Result<ConsolidatedFile> {
        if sync && self.remote.is_none() {
            return Err(IngestError::config("sync requires a destination store"));
        }
        let fail = |e: IngestError| IngestError::consolidation(time_key, format!("{:#}", e));

        let target = consolidated_file_name(time_key, self.extension);
        let state_name = merge_state_file_name(time_key, self.extension);
        let location = match self.target_remote(sync) {
            Some(remote) => remote.uri(&self.remote_key(&target)),
            None => self.local_dir.join(&target).display().to_string(),
        };

        let mut merged = self
            .read_output(&target, sync)
            .await
            .map_err(fail)?
            .unwrap_or_default();
        let existing_len = merged.len() as u64;

        // Without a sidecar the file, if any, predates merge tracking
        let (base, previous) = match self.read_output(&state_name, sync).await.map_err(fail)? {
            Some(data) => {
                let state = serde_json::from_slice::<MergeState>(&data).map_err(|e| {
                    IngestError::consolidation(time_key, format!("{}: {}", state_name, e))
                })?;
                let base = state.base_for(existing_len).ok_or_else(|| {
                    IngestError::consolidation(
                        time_key,
                        format!(
                            "{} is {} bytes, which matches neither merge state in {}",
                            target, existing_len, state_name
                        ),
                    )
                })?;
                (base, state)
            }
            None => (0, MergeState::default()),
        };

        let present = self.present_chunks(time_key, sync).await.map_err(fail)?;

        let mut already_merged = 0usize;
        for sequence in present.range(..base) {
            if previous.skipped.contains(sequence) {
                continue;
            }
            let name = chunk_file_name(time_key, *sequence, self.extension);
            debug!(partition = %partition, chunk = %name, "Chunk already consolidated, removing");
            self.remove_chunk(&name, sync).await;
            already_merged += 1;
        }

        let mut merged_chunks = Vec::new();
        let mut missing = 0usize;
        let mut skipped = previous.skipped.clone();

        for sequence in base..chunk_count {
            let name = chunk_file_name(time_key, sequence, self.extension);
            if !present.contains(&sequence) {
                debug!(partition = %partition, chunk = %name, "Chunk missing, skipping");
                missing += 1;
                continue;
            }
            let data = match self.read_chunk(&name, sync).await {
                Ok(Some(data)) => data,
                Ok(None) => {
                    debug!(partition = %partition, chunk = %name, "Chunk missing, skipping");
                    missing += 1;
                    continue;
                }
                Err(e) => {
                    let err = IngestError::consolidation(time_key, format!("{}: {}", name, e));
                    warn!(partition = %partition, error = %err, "Unreadable chunk, skipping");
                    skipped.insert(sequence);
                    missing += 1;
                    continue;
                }
            };

            if let Err(reason) = check_chunk(&data) {
                let err = IngestError::consolidation(time_key, format!("{}: {}", name, reason));
                warn!(partition = %partition, error = %err, "Corrupt chunk, skipping");
                skipped.insert(sequence);
                missing += 1;
                continue;
            }

            if !merged.is_empty() && !merged.ends_with(b"\n") {
                merged.push(b'\n');
            }
            merged.extend_from_slice(&data);
            merged_chunks.push(name);
        }

        let records = count_lines(&merged);

        if merged_chunks.is_empty() {
            debug!(partition = %partition, time_key, already_merged, "No chunks to merge");
            return Ok(ConsolidatedFile {
                time_key: time_key.to_string(),
                location,
                chunks_merged: 0,
                chunks_missing: missing,
                records,
            });
        }

        let state = MergeState {
            merged_through: chunk_count.max(base),
            length: merged.len() as u64,
            previous_through: base,
            previous_length: existing_len,
            skipped,
        };
        let state_data = serde_json::to_vec(&state).map_err(|e| fail(e.into()))?;
        self.write_output(&state_name, state_data, sync)
            .await
            .map_err(fail)?;
        self.write_output(&target, merged, sync).await.map_err(fail)?;

        for name in &merged_chunks {
            self.remove_chunk(name, sync).await;
        }

        info!(
            partition = %partition,
            time_key,
            location = %location,
            chunks_merged = merged_chunks.len(),
            chunks_missing = missing,
            already_merged,
            appended_to_existing = existing_len > 0,
            records,
            "Consolidated chunks"
        );

        Ok(ConsolidatedFile {
            time_key: time_key.to_string(),
            location,
            chunks_merged: merged_chunks.len(),
            chunks_missing: missing,
            records,
        })
    }
}

/// Every non-empty line must be a JSON value
fn check_chunk(data: &[u8]) -> std::result::Result<(), String> {
    let text = std::str::from_utf8(data).map_err(|e| format!("not UTF-8: {}", e))?;
    for (number, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        serde_json::from_str::<IgnoredAny>(line)
            .map_err(|e| format!("line {}: {}", number + 1, e))?;
    }
    Ok(())
}

fn count_lines(data: &[u8]) -> usize {
    data.split(|b| *b == b'\n')
        .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
        .count()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::storage::LocalStore;
    use tempfile::TempDir;

    fn partition() -> PartitionKey {
        PartitionKey::new("N60W040").unwrap()
    }

    fn write_chunk(dir: &Path, time_key: &str, sequence: u32, ids: &[&str]) {
        std::fs::create_dir_all(dir).unwrap();
        let body: String = ids.iter().map(|id| format!("{{\"id\":\"{}\"}}\n", id)).collect();
        std::fs::write(dir.join(chunk_file_name(time_key, sequence, "ndjson")), body).unwrap();
    }

    fn ids(data: &str) -> Vec<String> {
        data.lines()
            .map(|l| {
                serde_json::from_str::<serde_json::Value>(l).unwrap()["id"]
                    .as_str()
                    .unwrap()
                    .to_string()
            })
            .collect()
    }

    #[tokio::test]
    async fn test_merges_in_sequence_order_and_skips_gaps() {
        let dir = TempDir::new().unwrap();
        write_chunk(dir.path(), "2019", 0, &["a", "b"]);
        write_chunk(dir.path(), "2019", 2, &["e"]);
        write_chunk(dir.path(), "2019", 1, &["c", "d"]);
        write_chunk(dir.path(), "2019", 4, &["f"]);

        let consolidator = Consolidator::new(dir.path(), None, "N60W040/", "ndjson");
        let file = consolidator
            .consolidate(&partition(), "2019", 5, false)
            .await
            .unwrap();

        assert_eq!(file.chunks_merged, 4);
        assert_eq!(file.chunks_missing, 1);
        assert_eq!(file.records, 6);

        let merged = std::fs::read_to_string(dir.path().join("2019.ndjson")).unwrap();
        assert_eq!(ids(&merged), vec!["a", "b", "c", "d", "e", "f"]);
        assert!(!dir.path().join("2019-chunk0000.ndjson").exists());
    }

    #[tokio::test]
    async fn test_consolidation_is_idempotent() {
        let dir = TempDir::new().unwrap();
        write_chunk(dir.path(), "2019", 0, &["a"]);
        let consolidator = Consolidator::new(dir.path(), None, "N60W040/", "ndjson");

        consolidator.consolidate(&partition(), "2019", 1, false).await.unwrap();
        let again = consolidator.consolidate(&partition(), "2019", 1, false).await.unwrap();

        assert_eq!(again.chunks_merged, 0);
        assert_eq!(again.records, 1);
        let merged = std::fs::read_to_string(dir.path().join("2019.ndjson")).unwrap();
        assert_eq!(ids(&merged), vec!["a"]);
    }

    #[tokio::test]
    async fn test_new_chunks_append_to_existing_output() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("2019.ndjson"), "{\"id\":\"a\"}\n").unwrap();
        write_chunk(dir.path(), "2019", 3, &["b"]);

        let consolidator = Consolidator::new(dir.path(), None, "N60W040/", "ndjson");
        consolidator.consolidate(&partition(), "2019", 4, false).await.unwrap();

        let merged = std::fs::read_to_string(dir.path().join("2019.ndjson")).unwrap();
        assert_eq!(ids(&merged), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_corrupt_chunk_is_skipped() {
        let dir = TempDir::new().unwrap();
        write_chunk(dir.path(), "2019", 0, &["a"]);
        std::fs::write(dir.path().join("2019-chunk0001.ndjson"), "{\"id\":\n").unwrap();
        write_chunk(dir.path(), "2019", 2, &["c"]);

        let consolidator = Consolidator::new(dir.path(), None, "N60W040/", "ndjson");
        let file = consolidator.consolidate(&partition(), "2019", 3, false).await.unwrap();

        assert_eq!(file.chunks_merged, 2);
        assert_eq!(file.chunks_missing, 1);
        let merged = std::fs::read_to_string(dir.path().join("2019.ndjson")).unwrap();
        assert_eq!(ids(&merged), vec!["a", "c"]);
        // Kept for inspection, also by later merges
        assert!(dir.path().join("2019-chunk0001.ndjson").exists());
        write_chunk(dir.path(), "2019", 3, &["d"]);
        consolidator.consolidate(&partition(), "2019", 4, false).await.unwrap();
        assert!(dir.path().join("2019-chunk0001.ndjson").exists());
    }

    #[tokio::test]
    async fn test_reappearing_chunk_is_not_merged_twice() {
        let dir = TempDir::new().unwrap();
        write_chunk(dir.path(), "2019", 0, &["a", "b"]);
        write_chunk(dir.path(), "2019", 1, &["c"]);
        let consolidator = Consolidator::new(dir.path(), None, "N60W040/", "ndjson");
        consolidator.consolidate(&partition(), "2019", 2, false).await.unwrap();

        // Left behind by a failed delete
        write_chunk(dir.path(), "2019", 0, &["a", "b"]);
        let again = consolidator.consolidate(&partition(), "2019", 2, false).await.unwrap();

        assert_eq!(again.chunks_merged, 0);
        assert_eq!(again.records, 3);
        let merged = std::fs::read_to_string(dir.path().join("2019.ndjson")).unwrap();
        assert_eq!(ids(&merged), vec!["a", "b", "c"]);
        assert!(!dir.path().join("2019-chunk0000.ndjson").exists());
        assert!(dir.path().join("2019.ndjson.merged").exists());
    }

    #[tokio::test]
    async fn test_merge_cut_short_after_state_write_is_redone_once() {
        let dir = TempDir::new().unwrap();
        write_chunk(dir.path(), "2019", 0, &["a"]);
        let consolidator = Consolidator::new(dir.path(), None, "N60W040/", "ndjson");
        consolidator.consolidate(&partition(), "2019", 1, false).await.unwrap();
        let length = std::fs::metadata(dir.path().join("2019.ndjson")).unwrap().len();

        // New state recorded, consolidated file not yet replaced
        write_chunk(dir.path(), "2019", 1, &["b"]);
        let state = MergeState {
            merged_through: 2,
            length: length + 11,
            previous_through: 1,
            previous_length: length,
            skipped: BTreeSet::new(),
        };
        std::fs::write(
            dir.path().join("2019.ndjson.merged"),
            serde_json::to_vec(&state).unwrap(),
        )
        .unwrap();

        let file = consolidator.consolidate(&partition(), "2019", 2, false).await.unwrap();

        assert_eq!(file.chunks_merged, 1);
        let merged = std::fs::read_to_string(dir.path().join("2019.ndjson")).unwrap();
        assert_eq!(ids(&merged), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_output_changed_behind_our_back_is_rejected() {
        let dir = TempDir::new().unwrap();
        write_chunk(dir.path(), "2019", 0, &["a"]);
        let consolidator = Consolidator::new(dir.path(), None, "N60W040/", "ndjson");
        consolidator.consolidate(&partition(), "2019", 1, false).await.unwrap();

        std::fs::write(dir.path().join("2019.ndjson"), "{\"id\":\"x\"}\n{\"id\":\"y\"}\n").unwrap();
        write_chunk(dir.path(), "2019", 1, &["b"]);

        let err = consolidator
            .consolidate(&partition(), "2019", 2, false)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Consolidation { .. }));
        assert!(dir.path().join("2019-chunk0001.ndjson").exists());
    }

    #[tokio::test]
    async fn test_chunks_at_or_above_count_are_left_alone() {
        let dir = TempDir::new().unwrap();
        write_chunk(dir.path(), "2019", 0, &["a"]);
        write_chunk(dir.path(), "2019", 2, &["c"]);
        let consolidator = Consolidator::new(dir.path(), None, "N60W040/", "ndjson");

        let file = consolidator.consolidate(&partition(), "2019", 1, false).await.unwrap();
        assert_eq!(file.chunks_merged, 1);
        assert!(dir.path().join("2019-chunk0002.ndjson").exists());

        write_chunk(dir.path(), "2019", 1, &["b"]);
        consolidator.consolidate(&partition(), "2019", 3, false).await.unwrap();
        let merged = std::fs::read_to_string(dir.path().join("2019.ndjson")).unwrap();
        assert_eq!(ids(&merged), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_sync_uploads_and_cleans_both_sides() {
        let local_dir = TempDir::new().unwrap();
        let remote_dir = TempDir::new().unwrap();
        let remote = LocalStore::new(remote_dir.path());

        // Chunk 0 only remote, chunk 1 only local (its upload failed)
        remote
            .put("N60W040/2019-chunk0000.ndjson", b"{\"id\":\"a\"}\n".to_vec())
            .await
            .unwrap();
        write_chunk(local_dir.path(), "2019", 0, &["a"]);
        write_chunk(local_dir.path(), "2019", 1, &["b"]);

        let consolidator = Consolidator::new(
            local_dir.path(),
            Some(&remote as &dyn ObjectStore),
            "N60W040/",
            "ndjson",
        );
        let file = consolidator.consolidate(&partition(), "2019", 2, true).await.unwrap();

        assert_eq!(file.chunks_merged, 2);
        assert!(file.location.ends_with("2019.ndjson"));

        let merged = remote.get("N60W040/2019.ndjson").await.unwrap().unwrap();
        assert_eq!(ids(&String::from_utf8(merged).unwrap()), vec!["a", "b"]);
        assert!(remote.list("N60W040/2019-chunk").await.unwrap().is_empty());
        assert!(remote.get("N60W040/2019.ndjson.merged").await.unwrap().is_some());
        assert!(!local_dir.path().join("2019-chunk0000.ndjson").exists());
        assert!(!local_dir.path().join("2019-chunk0001.ndjson").exists());
        assert!(!local_dir.path().join("2019.ndjson").exists());
        assert!(!local_dir.path().join("2019.ndjson.merged").exists());
    }

    #[tokio::test]
    async fn test_sync_without_remote_is_rejected() {
        let dir = TempDir::new().unwrap();
        let consolidator = Consolidator::new(dir.path(), None, "N60W040/", "ndjson");
        assert!(consolidator
            .consolidate(&partition(), "2019", 1, true)
            .await
            .is_err());
    }
}
