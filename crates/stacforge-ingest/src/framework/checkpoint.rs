//! Progress checkpoints
//!
//! One JSON document maps every partition key to the index of its last
//! completed batch. Both backends keep the document in memory after the
//! first read and rewrite it whole on every change.

use anyhow::Context;
use async_trait::async_trait;
use stacforge_common::PartitionKey;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{IngestError, Result};
use crate::storage::{local, ObjectStore};

/// File / object name of the checkpoint document
pub const CHECKPOINT_FILE: &str = "checkpoints.json";

#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Last completed batch, or `None`. Read failures are logged and
    /// reported as `None`.
    async fn get_last_completed(&self, partition: &PartitionKey) -> Option<u64>;

    /// Record `batch_index` as completed. The in-memory value advances even
    /// when persisting fails; the error is returned for logging only.
    async fn mark_completed(&self, partition: &PartitionKey, batch_index: u64) -> Result<()>;

    /// Forget a partition's progress
    async fn reset(&self, partition: &PartitionKey) -> Result<()>;

    /// Human-readable location of the document
    fn location(&self) -> String;
}

/// The serialized mapping `{partition_key: last_index}`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointDocument {
    entries: BTreeMap<String, u64>,
}

impl CheckpointDocument {
    pub fn parse(data: &[u8]) -> Result<Self> {
        Ok(Self {
            entries: serde_json::from_slice(data)?,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(&self.entries)?)
    }

    pub fn get(&self, partition: &PartitionKey) -> Option<u64> {
        self.entries.get(partition.as_str()).copied()
    }

    /// Move the partition forward. Returns false if `batch_index` is not
    /// beyond the stored value.
    pub fn advance(&mut self, partition: &PartitionKey, batch_index: u64) -> bool {
        match self.entries.get(partition.as_str()) {
            Some(&current) if current >= batch_index => false,
            _ => {
                self.entries.insert(partition.to_string(), batch_index);
                true
            }
        }
    }

    pub fn remove(&mut self, partition: &PartitionKey) -> bool {
        self.entries.remove(partition.as_str()).is_some()
    }
}

/// Where a checkpoint document is read from and written to
#[async_trait]
trait DocumentBackend: Send + Sync {
    async fn load(&self) -> anyhow::Result<Option<Vec<u8>>>;
    async fn save(&self, data: Vec<u8>) -> anyhow::Result<()>;
    fn location(&self) -> String;
}

/// Shared logic of both stores: lazy load, forward-only update, whole rewrite
struct CachedCheckpoints<B> {
    backend: B,
    document: Mutex<Option<CheckpointDocument>>,
}

impl<B: DocumentBackend> CachedCheckpoints<B> {
    fn new(backend: B) -> Self {
        Self {
            backend,
            document: Mutex::new(None),
        }
    }

    async fn read_document(&self) -> Result<CheckpointDocument> {
        match self.backend.load().await? {
            Some(data) => CheckpointDocument::parse(&data),
            None => Ok(CheckpointDocument::default()),
        }
    }

    /// Load the document into `slot` if it is not there yet. A failed load
    /// starts from an empty document.
    async fn ensure_loaded<'a>(
        &self,
        slot: &'a mut Option<CheckpointDocument>,
    ) -> &'a mut CheckpointDocument {
        if slot.is_none() {
            let document = match self.read_document().await {
                Ok(document) => document,
                Err(e) => {
                    warn!(
                        location = %self.backend.location(),
                        error = %e,
                        "Checkpoint document unreadable, starting from scratch"
                    );
                    CheckpointDocument::default()
                }
            };
            *slot = Some(document);
        }
        slot.get_or_insert_with(CheckpointDocument::default)
    }

    async fn persist(&self, document: &CheckpointDocument) -> Result<()> {
        let data = document.to_bytes()?;
        self.backend
            .save(data)
            .await
            .map_err(|e| IngestError::persist(self.backend.location(), format!("{:#}", e)))
    }

    async fn get_last_completed(&self, partition: &PartitionKey) -> Option<u64> {
        let mut slot = self.document.lock().await;
        let last = self.ensure_loaded(&mut slot).await.get(partition);
        debug!(partition = %partition, last = ?last, "Read checkpoint");
        last
    }

    async fn mark_completed(&self, partition: &PartitionKey, batch_index: u64) -> Result<()> {
        let mut slot = self.document.lock().await;
        let document = self.ensure_loaded(&mut slot).await;

        if !document.advance(partition, batch_index) {
            debug!(
                partition = %partition,
                batch = batch_index,
                "Checkpoint already at or beyond batch"
            );
            return Ok(());
        }

        let snapshot = document.clone();
        drop(slot);
        self.persist(&snapshot).await
    }

    async fn reset(&self, partition: &PartitionKey) -> Result<()> {
        let mut slot = self.document.lock().await;
        // A reset must not wipe other partitions because of a transient read error
        let mut document = self.read_document().await?;
        document.remove(partition);
        *slot = Some(document.clone());
        drop(slot);

        self.persist(&document).await?;
        info!(partition = %partition, location = %self.backend.location(), "Checkpoint reset");
        Ok(())
    }
}

struct FileBackend {
    path: PathBuf,
}

#[async_trait]
impl DocumentBackend for FileBackend {
    async fn load(&self) -> anyhow::Result<Option<Vec<u8>>> {
        match tokio::fs::read(&self.path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", self.path.display())),
        }
    }

    async fn save(&self, data: Vec<u8>) -> anyhow::Result<()> {
        local::write_atomic(&self.path, &data).await
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

struct ObjectBackend {
    store: Arc<dyn ObjectStore>,
    key: String,
}

#[async_trait]
impl DocumentBackend for ObjectBackend {
    async fn load(&self) -> anyhow::Result<Option<Vec<u8>>> {
        self.store.get(&self.key).await
    }

    async fn save(&self, data: Vec<u8>) -> anyhow::Result<()> {
        self.store.put(&self.key, data).await
    }

    fn location(&self) -> String {
        self.store.uri(&self.key)
    }
}

/// Checkpoints in a local JSON file, replaced with write-temp-then-rename
pub struct LocalProgressStore {
    inner: CachedCheckpoints<FileBackend>,
}

impl LocalProgressStore {
    /// Store `checkpoints.json` inside `dir`
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(dir.as_ref().join(CHECKPOINT_FILE))
    }

    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: CachedCheckpoints::new(FileBackend { path: path.into() }),
        }
    }
}

/// Checkpoints in one object of a remote store, replaced by a single put
pub struct RemoteProgressStore {
    inner: CachedCheckpoints<ObjectBackend>,
}

impl RemoteProgressStore {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self::with_key(store, CHECKPOINT_FILE)
    }

    pub fn with_key(store: Arc<dyn ObjectStore>, key: impl Into<String>) -> Self {
        Self {
            inner: CachedCheckpoints::new(ObjectBackend {
                store,
                key: key.into(),
            }),
        }
    }
}

macro_rules! delegate_progress_store {
    ($store:ty) => {
        #[async_trait]
        impl ProgressStore for $store {
            async fn get_last_completed(&self, partition: &PartitionKey) -> Option<u64> {
                self.inner.get_last_completed(partition).await
            }

            async fn mark_completed(
                &self,
                partition: &PartitionKey,
                batch_index: u64,
            ) -> Result<()> {
                self.inner.mark_completed(partition, batch_index).await
            }

            async fn reset(&self, partition: &PartitionKey) -> Result<()> {
                self.inner.reset(partition).await
            }

            fn location(&self) -> String {
                self.inner.backend.location()
            }
        }
    };
}

delegate_progress_store!(LocalProgressStore);
delegate_progress_store!(RemoteProgressStore);

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::storage::LocalStore;
    use tempfile::TempDir;

    fn key(s: &str) -> PartitionKey {
        PartitionKey::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_missing_document_means_no_progress() {
        let dir = TempDir::new().unwrap();
        let store = LocalProgressStore::in_dir(dir.path());
        assert_eq!(store.get_last_completed(&key("p")).await, None);
    }

    #[tokio::test]
    async fn test_mark_persists_and_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let store = LocalProgressStore::in_dir(dir.path());

        store.mark_completed(&key("p"), 0).await.unwrap();
        store.mark_completed(&key("p"), 1).await.unwrap();
        store.mark_completed(&key("q"), 4).await.unwrap();

        let reopened = LocalProgressStore::in_dir(dir.path());
        assert_eq!(reopened.get_last_completed(&key("p")).await, Some(1));
        assert_eq!(reopened.get_last_completed(&key("q")).await, Some(4));

        let raw: BTreeMap<String, u64> =
            serde_json::from_slice(&std::fs::read(dir.path().join(CHECKPOINT_FILE)).unwrap())
                .unwrap();
        assert_eq!(raw.get("p"), Some(&1));
    }

    #[tokio::test]
    async fn test_checkpoint_never_moves_backwards() {
        let dir = TempDir::new().unwrap();
        let store = LocalProgressStore::in_dir(dir.path());

        store.mark_completed(&key("p"), 5).await.unwrap();
        store.mark_completed(&key("p"), 3).await.unwrap();
        assert_eq!(store.get_last_completed(&key("p")).await, Some(5));
    }

    #[tokio::test]
    async fn test_corrupt_document_fails_open() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(CHECKPOINT_FILE), b"{not json").unwrap();

        let store = LocalProgressStore::in_dir(dir.path());
        assert_eq!(store.get_last_completed(&key("p")).await, None);

        // The next mark rewrites a valid document
        store.mark_completed(&key("p"), 0).await.unwrap();
        let reopened = LocalProgressStore::in_dir(dir.path());
        assert_eq!(reopened.get_last_completed(&key("p")).await, Some(0));
    }

    #[tokio::test]
    async fn test_persist_failure_still_advances_in_memory() {
        let dir = TempDir::new().unwrap();
        // A file where the checkpoint directory should be makes every write fail
        let blocker = dir.path().join("blocked");
        std::fs::write(&blocker, b"").unwrap();

        let store = LocalProgressStore::in_dir(&blocker);
        let err = store.mark_completed(&key("p"), 2).await.unwrap_err();
        assert!(matches!(err, IngestError::Persist { .. }));
        assert_eq!(store.get_last_completed(&key("p")).await, Some(2));
    }

    #[tokio::test]
    async fn test_reset_only_clears_one_partition() {
        let dir = TempDir::new().unwrap();
        let store = LocalProgressStore::in_dir(dir.path());
        store.mark_completed(&key("p"), 3).await.unwrap();
        store.mark_completed(&key("q"), 7).await.unwrap();

        store.reset(&key("p")).await.unwrap();

        assert_eq!(store.get_last_completed(&key("p")).await, None);
        assert_eq!(store.get_last_completed(&key("q")).await, Some(7));

        // Progress restarts from zero after a reset
        store.mark_completed(&key("p"), 0).await.unwrap();
        assert_eq!(store.get_last_completed(&key("p")).await, Some(0));
    }

    #[tokio::test]
    async fn test_remote_store_uses_object_backend() {
        let dir = TempDir::new().unwrap();
        let objects: Arc<dyn ObjectStore> = Arc::new(LocalStore::new(dir.path()));
        let store = RemoteProgressStore::new(Arc::clone(&objects));

        store.mark_completed(&key("velocity/N60W040"), 9).await.unwrap();
        assert!(store.location().ends_with(CHECKPOINT_FILE));

        let data = objects.get(CHECKPOINT_FILE).await.unwrap().unwrap();
        let document = CheckpointDocument::parse(&data).unwrap();
        assert_eq!(document.get(&key("velocity/N60W040")), Some(9));

        let reopened = RemoteProgressStore::new(objects);
        assert_eq!(reopened.get_last_completed(&key("velocity/N60W040")).await, Some(9));
    }
}
