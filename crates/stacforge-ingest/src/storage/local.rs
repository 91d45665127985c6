//! Local filesystem store
//!
//! Keys map onto paths under a root directory. Writes go to a hidden
//! temporary file in the target directory and are renamed into place.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};
use uuid::Uuid;
use walkdir::WalkDir;

use super::ObjectStore;

const TEMP_PREFIX: &str = ".stacforge-";

#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        key.split('/')
            .filter(|segment| !segment.is_empty())
            .fold(self.root.clone(), |path, segment| path.join(segment))
    }
}

/// Write `data` to `path` through a temporary sibling and a rename
pub(crate) async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("Path has no parent directory: {}", path.display()))?;
    tokio::fs::create_dir_all(parent)
        .await
        .with_context(|| format!("Failed to create directory {}", parent.display()))?;

    let tmp = parent.join(format!("{}{}", TEMP_PREFIX, Uuid::new_v4()));
    tokio::fs::write(&tmp, data)
        .await
        .with_context(|| format!("Failed to write {}", tmp.display()))?;

    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e).with_context(|| format!("Failed to move file into {}", path.display()));
    }

    Ok(())
}

/// Remove a file, treating "not found" as success. Returns whether it existed.
pub(crate) async fn remove_if_exists(path: &Path) -> Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).with_context(|| format!("Failed to delete {}", path.display())),
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    #[instrument(skip(self), fields(root = %self.root.display()))]
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        // Walk only the deepest directory named by the prefix
        let dir_part = prefix.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("");
        let base = self.path_for(dir_part);
        let root = self.root.clone();
        let prefix = prefix.to_string();

        tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            if !base.exists() {
                return Ok(Vec::new());
            }

            let mut keys = Vec::new();
            for entry in WalkDir::new(&base).follow_links(true) {
                let entry =
                    entry.with_context(|| format!("Failed to list {}", base.display()))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                if entry.file_name().to_string_lossy().starts_with(TEMP_PREFIX) {
                    continue;
                }

                let relative = entry
                    .path()
                    .strip_prefix(&root)
                    .with_context(|| format!("{} escapes the store root", entry.path().display()))?;
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");

                if key.starts_with(&prefix) {
                    keys.push(key);
                }
            }

            keys.sort();
            debug!(count = keys.len(), "Listed local objects");
            Ok(keys)
        })
        .await
        .context("Listing task panicked")?
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key);
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    #[instrument(skip(self, data), fields(bytes = data.len()))]
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<()> {
        write_atomic(&self.path_for(key), &data).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        remove_if_exists(&self.path_for(key)).await.map(|_| ())
    }

    fn uri(&self, key: &str) -> String {
        self.path_for(key).display().to_string()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_put_get_delete() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::new(dir.path());

        store.put("a/b/item.json", b"{}".to_vec()).await.unwrap();
        assert_eq!(store.get("a/b/item.json").await.unwrap(), Some(b"{}".to_vec()));

        store.delete("a/b/item.json").await.unwrap();
        assert_eq!(store.get("a/b/item.json").await.unwrap(), None);

        // Deleting twice is fine
        store.delete("a/b/item.json").await.unwrap();
    }

    #[tokio::test]
    async fn test_list_is_sorted_and_prefix_filtered() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::new(dir.path());

        for key in ["p1/z.nc", "p1/a.nc", "p1/sub/m.nc", "p10/x.nc", "p2/y.nc"] {
            store.put(key, Vec::new()).await.unwrap();
        }

        let keys = store.list("p1/").await.unwrap();
        assert_eq!(keys, vec!["p1/a.nc", "p1/sub/m.nc", "p1/z.nc"]);

        let keys = store.list("p1").await.unwrap();
        assert_eq!(keys.len(), 4);
    }

    #[tokio::test]
    async fn test_list_missing_directory_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::new(dir.path().join("nothing-here"));
        assert!(store.list("partition/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_put_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::new(dir.path());

        store.put("checkpoints.json", b"{\"a\":1}".to_vec()).await.unwrap();
        store.put("checkpoints.json", b"{\"a\":2}".to_vec()).await.unwrap();

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["checkpoints.json"]);
        assert_eq!(
            store.get("checkpoints.json").await.unwrap(),
            Some(b"{\"a\":2}".to_vec())
        );
    }

    #[test]
    fn test_uri() {
        let store = LocalStore::new("/data/source");
        assert_eq!(
            store.uri("N60W040/granule.nc"),
            PathBuf::from("/data/source/N60W040/granule.nc").display().to_string()
        );
    }
}
