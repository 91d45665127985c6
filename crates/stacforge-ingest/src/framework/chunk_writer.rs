//! Chunked result writer
//!
//! Records land in append-only chunk files named
//! `{time_key}-chunk{sequence:04}.ndjson` under `{output_dir}/{partition_slug}/`.
//! All time keys share one sequence counter. The driver keeps it equal to the
//! index of the batch being written: [`ChunkWriter::rotate`] after a batch
//! completes, [`ChunkWriter::abandon_batch`] after one fails. A chunk with a
//! sequence past the checkpoint therefore always belongs to an unfinished
//! batch and is safe to delete on resume.

use stacforge_common::naming::{
    chunk_file_name, parse_chunk_file_name, validate_time_key, DEFAULT_EXTENSION,
};
use stacforge_common::PartitionKey;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::consolidator::Consolidator;
use super::types::{ConsolidatedFile, Record, TimeKeyExtractor};
use crate::error::{IngestError, Result};
use crate::storage::{local, ObjectStore};

/// What [`ChunkWriter::prepare`] found on disk and in remote storage
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrepareReport {
    pub time_keys: usize,
    pub kept_chunks: usize,
    pub stale_chunks_removed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadReport {
    pub uploaded: usize,
    pub failed: usize,
}

pub struct ChunkWriter {
    partition: PartitionKey,
    local_dir: PathBuf,
    remote: Option<Arc<dyn ObjectStore>>,
    remote_prefix: String,
    extension: String,
    time_keys: Arc<dyn TimeKeyExtractor>,
    seen: BTreeSet<String>,
    sequence: u32,
    touched: BTreeSet<String>,
    pending_uploads: BTreeSet<(String, u32)>,
}

impl ChunkWriter {
    pub fn new(
        partition: PartitionKey,
        output_dir: impl AsRef<Path>,
        time_keys: Arc<dyn TimeKeyExtractor>,
    ) -> Self {
        let slug = partition.slug();
        Self {
            local_dir: output_dir.as_ref().join(&slug),
            remote_prefix: format!("{}/", slug),
            partition,
            remote: None,
            extension: DEFAULT_EXTENSION.to_string(),
            time_keys,
            seen: BTreeSet::new(),
            sequence: 0,
            touched: BTreeSet::new(),
            pending_uploads: BTreeSet::new(),
        }
    }

    /// Durable storage for chunks and consolidated files
    pub fn with_remote(mut self, remote: Arc<dyn ObjectStore>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn partition(&self) -> &PartitionKey {
        &self.partition
    }

    pub fn local_dir(&self) -> &Path {
        &self.local_dir
    }

    pub fn remote(&self) -> Option<&Arc<dyn ObjectStore>> {
        self.remote.as_ref()
    }

    /// Key prefix of this partition in the remote store, ending with `/`
    pub fn remote_prefix(&self) -> &str {
        &self.remote_prefix
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Sequence the next record will be written to
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Every time key seen by this writer, including ones rediscovered on resume
    pub fn time_keys(&self) -> Vec<String> {
        self.seen.iter().cloned().collect()
    }

    pub fn pending_uploads(&self) -> usize {
        self.pending_uploads.len()
    }

    fn chunk_path(&self, time_key: &str, sequence: u32) -> PathBuf {
        self.local_dir
            .join(chunk_file_name(time_key, sequence, &self.extension))
    }

    fn remote_key(&self, file_name: &str) -> String {
        format!("{}{}", self.remote_prefix, file_name)
    }

    /// Set the starting sequence and reconcile existing chunks with it.
    ///
    /// Chunks below `start_sequence` were written by completed batches: their
    /// time keys are remembered so they get consolidated. Chunks at or above
    /// it are leftovers of an unfinished batch and are deleted. Remote chunks
    /// are only considered when `sync` is set.
    pub async fn prepare(&mut self, start_sequence: u32, sync: bool) -> Result<PrepareReport> {
        self.sequence = start_sequence;
        self.touched.clear();

        let mut report = PrepareReport::default();

        for name in self.local_file_names().await? {
            let Some((time_key, sequence)) = parse_chunk_file_name(&name, &self.extension) else {
                continue;
            };
            if sequence >= start_sequence {
                local::remove_if_exists(&self.local_dir.join(&name))
                    .await
                    .map_err(|e| IngestError::persist(name.clone(), format!("{:#}", e)))?;
                report.stale_chunks_removed += 1;
            } else {
                self.seen.insert(time_key);
                report.kept_chunks += 1;
            }
        }

        if let (true, Some(remote)) = (sync, self.remote.clone()) {
            match remote.list(&self.remote_prefix).await {
                Ok(keys) => {
                    for key in keys {
                        let name = key.strip_prefix(&self.remote_prefix).unwrap_or(&key);
                        let Some((time_key, sequence)) =
                            parse_chunk_file_name(name, &self.extension)
                        else {
                            continue;
                        };
                        if sequence >= start_sequence {
                            if let Err(e) = remote.delete(&key).await {
                                warn!(key = %remote.uri(&key), error = %e, "Failed to delete stale remote chunk");
                                continue;
                            }
                            report.stale_chunks_removed += 1;
                        } else {
                            self.seen.insert(time_key);
                            report.kept_chunks += 1;
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        partition = %self.partition,
                        error = %e,
                        "Could not list remote chunks, continuing with local state"
                    );
                }
            }
        }

        report.time_keys = self.seen.len();
        if report.kept_chunks > 0 || report.stale_chunks_removed > 0 {
            info!(
                partition = %self.partition,
                start_sequence,
                time_keys = report.time_keys,
                kept = report.kept_chunks,
                stale_removed = report.stale_chunks_removed,
                "Reconciled existing chunks"
            );
        }

        Ok(report)
    }

    async fn local_file_names(&self) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.local_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn append(&self, time_key: &str, payload: &[u8]) -> Result<()> {
        let path = self.chunk_path(time_key, self.sequence);
        let to_persist_error =
            |e: std::io::Error| IngestError::persist(path.display().to_string(), e);

        tokio::fs::create_dir_all(&self.local_dir)
            .await
            .map_err(to_persist_error)?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(to_persist_error)?;
        file.write_all(payload).await.map_err(to_persist_error)?;
        file.flush().await.map_err(to_persist_error)?;
        Ok(())
    }

    /// Append one record to the chunk of its time key at the current sequence
    pub async fn write(&mut self, record: &Record) -> Result<()> {
        self.write_all(std::slice::from_ref(record)).await.map(|_| ())
    }

    /// Append records, opening each touched chunk once. Returns the number written.
    pub async fn write_all(&mut self, records: &[Record]) -> Result<usize> {
        let mut grouped: BTreeMap<String, Vec<u8>> = BTreeMap::new();
        for record in records {
            let time_key = self.time_keys.time_key(record);
            validate_time_key(&time_key)?;

            let buffer = grouped.entry(time_key).or_default();
            buffer.extend_from_slice(record.to_line()?.as_bytes());
            buffer.push(b'\n');
        }

        for (time_key, payload) in &grouped {
            self.append(time_key, payload).await?;
            self.seen.insert(time_key.clone());
            self.touched.insert(time_key.clone());
        }

        debug!(
            partition = %self.partition,
            sequence = self.sequence,
            records = records.len(),
            time_keys = grouped.len(),
            "Wrote records to chunks"
        );
        Ok(records.len())
    }

    /// Copy chunks touched in this batch, plus any earlier failed uploads, to
    /// remote storage. Failures keep the local chunk and are retried by the
    /// next call.
    pub async fn upload_touched(&mut self, sync: bool) -> UploadReport {
        let mut report = UploadReport::default();
        if !sync {
            return report;
        }
        let Some(remote) = self.remote.clone() else {
            warn!(partition = %self.partition, "Sync requested without a destination store");
            return report;
        };

        let sequence = self.sequence;
        let mut targets: BTreeSet<(String, u32)> = self
            .touched
            .iter()
            .map(|time_key| (time_key.clone(), sequence))
            .collect();
        targets.extend(self.pending_uploads.iter().cloned());

        for (time_key, sequence) in targets {
            let name = chunk_file_name(&time_key, sequence, &self.extension);
            let path = self.local_dir.join(&name);

            let data = match tokio::fs::read(&path).await {
                Ok(data) => data,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    self.pending_uploads.remove(&(time_key, sequence));
                    continue;
                }
                Err(e) => {
                    warn!(chunk = %path.display(), error = %e, "Failed to read chunk for upload");
                    self.pending_uploads.insert((time_key, sequence));
                    report.failed += 1;
                    continue;
                }
            };

            let key = self.remote_key(&name);
            match remote.put(&key, data).await {
                Ok(()) => {
                    self.pending_uploads.remove(&(time_key, sequence));
                    report.uploaded += 1;
                }
                Err(e) => {
                    let err = IngestError::persist(remote.uri(&key), format!("{:#}", e));
                    warn!(error = %err, "Chunk upload failed, keeping local copy");
                    self.pending_uploads.insert((time_key, sequence));
                    report.failed += 1;
                }
            }
        }

        if report.uploaded > 0 || report.failed > 0 {
            debug!(
                partition = %self.partition,
                uploaded = report.uploaded,
                failed = report.failed,
                pending = self.pending_uploads.len(),
                "Uploaded chunks"
            );
        }
        report
    }

    /// Close the current sequence after a completed batch
    pub fn rotate(&mut self) {
        self.touched.clear();
        self.sequence += 1;
    }

    /// Drop everything a failed batch wrote and move past its sequence
    pub async fn abandon_batch(&mut self) {
        let sequence = self.sequence;
        let touched = std::mem::take(&mut self.touched);

        for time_key in touched {
            let name = chunk_file_name(&time_key, sequence, &self.extension);
            if let Err(e) = local::remove_if_exists(&self.local_dir.join(&name)).await {
                warn!(chunk = %name, error = %e, "Failed to discard chunk of failed batch");
            }
            if self.pending_uploads.remove(&(time_key, sequence)) {
                continue;
            }
            if let Some(remote) = &self.remote {
                if let Err(e) = remote.delete(&self.remote_key(&name)).await {
                    warn!(chunk = %name, error = %e, "Failed to discard remote chunk of failed batch");
                }
            }
        }

        self.sequence += 1;
    }

    /// Merge chunks of `time_key` below `chunk_count` into its consolidated
    /// file. Pass [`ChunkWriter::sequence`] to merge everything written so far.
    pub async fn consolidate(
        &mut self,
        time_key: &str,
        chunk_count: u32,
        sync: bool,
    ) -> Result<ConsolidatedFile> {
        let consolidator = Consolidator::new(
            &self.local_dir,
            self.remote.as_deref(),
            &self.remote_prefix,
            &self.extension,
        );
        let file = consolidator
            .consolidate(&self.partition, time_key, chunk_count, sync)
            .await?;

        self.pending_uploads
            .retain(|(key, sequence)| key != time_key || *sequence >= chunk_count);
        Ok(file)
    }
}
