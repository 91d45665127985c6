//! Reingest: wipe a partition's progress and artifacts so it is redone

use stacforge_common::naming::{is_consolidated_artifact, parse_chunk_file_name};
use tracing::{info, warn};

use super::checkpoint::ProgressStore;
use super::chunk_writer::ChunkWriter;
use crate::error::{IngestError, Result};
use crate::storage::local;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReingestReport {
    pub local_removed: usize,
    pub remote_removed: usize,
}

/// A chunk, consolidated file or merge state of this writer's naming scheme
fn is_artifact(file_name: &str, extension: &str) -> bool {
    parse_chunk_file_name(file_name, extension).is_some()
        || is_consolidated_artifact(file_name, extension)
}

/// Clear the checkpoint and delete every local and remote chunk and
/// consolidated file of the writer's partition.
pub async fn reingest_partition(
    progress: &dyn ProgressStore,
    writer: &ChunkWriter,
) -> Result<ReingestReport> {
    let partition = writer.partition();
    let mut report = ReingestReport::default();

    progress.reset(partition).await?;

    match tokio::fs::read_dir(writer.local_dir()).await {
        Ok(mut entries) => {
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().to_string();
                if !is_artifact(&name, writer.extension()) {
                    continue;
                }
                if local::remove_if_exists(&entry.path())
                    .await
                    .map_err(|e| IngestError::persist(name.clone(), format!("{:#}", e)))?
                {
                    report.local_removed += 1;
                }
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    if let Some(remote) = writer.remote() {
        let prefix = writer.remote_prefix();
        let keys = remote
            .list(prefix)
            .await
            .map_err(|e| IngestError::persist(remote.uri(prefix), format!("{:#}", e)))?;

        for key in keys {
            let name = key.strip_prefix(prefix).unwrap_or(&key);
            if !is_artifact(name, writer.extension()) {
                continue;
            }
            match remote.delete(&key).await {
                Ok(()) => report.remote_removed += 1,
                Err(e) => warn!(key = %remote.uri(&key), error = %e, "Failed to delete remote artifact"),
            }
        }
    }

    info!(
        partition = %partition,
        local_removed = report.local_removed,
        remote_removed = report.remote_removed,
        "Partition reset for reingest"
    );

    Ok(report)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::framework::checkpoint::LocalProgressStore;
    use crate::framework::types::YearTimeKey;
    use crate::storage::{LocalStore, ObjectStore};
    use stacforge_common::PartitionKey;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_is_artifact() {
        assert!(is_artifact("2019-chunk0003.ndjson", "ndjson"));
        assert!(is_artifact("2019.ndjson", "ndjson"));
        assert!(is_artifact("2019.ndjson.merged", "ndjson"));
        assert!(!is_artifact("checkpoints.json", "ndjson"));
        assert!(!is_artifact(".ndjson", "ndjson"));
        assert!(!is_artifact("sub/2019.ndjson", "ndjson"));
    }

    #[tokio::test]
    async fn test_reingest_wipes_progress_and_artifacts() {
        let output = TempDir::new().unwrap();
        let remote_dir = TempDir::new().unwrap();
        let remote: Arc<dyn ObjectStore> = Arc::new(LocalStore::new(remote_dir.path()));
        let partition = PartitionKey::new("N60W040").unwrap();

        let progress = LocalProgressStore::in_dir(output.path());
        progress.mark_completed(&partition, 4).await.unwrap();
        progress
            .mark_completed(&PartitionKey::new("other").unwrap(), 1)
            .await
            .unwrap();

        let local_dir = output.path().join("N60W040");
        std::fs::create_dir_all(&local_dir).unwrap();
        std::fs::write(local_dir.join("2019-chunk0000.ndjson"), "{}\n").unwrap();
        std::fs::write(local_dir.join("2018.ndjson"), "{}\n").unwrap();
        std::fs::write(local_dir.join("notes.txt"), "keep").unwrap();
        remote.put("N60W040/2019-chunk0001.ndjson", b"{}\n".to_vec()).await.unwrap();
        remote.put("N60W040/2019.ndjson", b"{}\n".to_vec()).await.unwrap();
        remote.put("other/2019.ndjson", b"{}\n".to_vec()).await.unwrap();

        let writer = ChunkWriter::new(partition.clone(), output.path(), Arc::new(YearTimeKey::default()))
            .with_remote(Arc::clone(&remote));
        let report = reingest_partition(&progress, &writer).await.unwrap();

        assert_eq!(report, ReingestReport { local_removed: 2, remote_removed: 2 });
        assert_eq!(progress.get_last_completed(&partition).await, None);
        assert_eq!(
            progress
                .get_last_completed(&PartitionKey::new("other").unwrap())
                .await,
            Some(1)
        );
        assert!(local_dir.join("notes.txt").exists());
        assert!(remote.list("N60W040/").await.unwrap().is_empty());
        assert_eq!(remote.list("other/").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reingest_leaves_partitions_with_similar_keys_alone() {
        let output = TempDir::new().unwrap();
        let remote_dir = TempDir::new().unwrap();
        let remote: Arc<dyn ObjectStore> = Arc::new(LocalStore::new(remote_dir.path()));
        let progress = LocalProgressStore::in_dir(output.path());
        let nested = PartitionKey::new("a/b").unwrap();
        let flat = PartitionKey::new("a_b").unwrap();

        let writer_for = |partition: &PartitionKey| {
            ChunkWriter::new(partition.clone(), output.path(), Arc::new(YearTimeKey::default()))
                .with_remote(Arc::clone(&remote))
        };
        let (nested_writer, flat_writer) = (writer_for(&nested), writer_for(&flat));
        assert_ne!(nested_writer.local_dir(), flat_writer.local_dir());
        assert_ne!(nested_writer.remote_prefix(), flat_writer.remote_prefix());

        for writer in [&nested_writer, &flat_writer] {
            std::fs::create_dir_all(writer.local_dir()).unwrap();
            std::fs::write(writer.local_dir().join("2019.ndjson"), "{}\n").unwrap();
            remote
                .put(&format!("{}2019.ndjson", writer.remote_prefix()), b"{}\n".to_vec())
                .await
                .unwrap();
        }

        reingest_partition(&progress, &nested_writer).await.unwrap();

        assert!(!nested_writer.local_dir().join("2019.ndjson").exists());
        assert!(flat_writer.local_dir().join("2019.ndjson").exists());
        assert_eq!(
            remote.list(flat_writer.remote_prefix()).await.unwrap(),
            vec![format!("{}2019.ndjson", flat_writer.remote_prefix())]
        );
    }
}
