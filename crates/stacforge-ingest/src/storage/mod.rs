//! Object storage abstraction
//!
//! Sources, chunk uploads, remote checkpoints and consolidated outputs all
//! go through [`ObjectStore`]. Keys are `/`-separated and relative to the
//! root the store was opened at, so the same layout works on a local
//! directory and under an S3 prefix.

use anyhow::Result;
use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

pub mod config;
pub mod local;
pub mod s3;

pub use config::StorageConfig;
pub use local::LocalStore;
pub use s3::S3Store;

use crate::error::IngestError;

#[async_trait]
pub trait ObjectStore: Send + Sync + fmt::Debug {
    /// Every key starting with `prefix`, sorted lexicographically
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Object contents, or `None` if the key does not exist
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Replace the object atomically
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<()>;

    /// Remove the object; removing a missing key succeeds
    async fn delete(&self, key: &str) -> Result<()>;

    /// Absolute address of a key, as handed to item generators and logs
    fn uri(&self, key: &str) -> String;
}

/// Where a store lives: `s3://bucket/prefix` or a local directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageLocation {
    Local(PathBuf),
    S3 { bucket: String, prefix: String },
}

impl StorageLocation {
    pub fn is_remote(&self) -> bool {
        matches!(self, StorageLocation::S3 { .. })
    }

    pub async fn open(&self, config: &StorageConfig) -> Result<Arc<dyn ObjectStore>> {
        match self {
            StorageLocation::Local(root) => Ok(Arc::new(LocalStore::new(root.clone()))),
            StorageLocation::S3 { bucket, prefix } => Ok(Arc::new(
                S3Store::new(config, bucket.clone(), prefix.clone()).await?,
            )),
        }
    }
}

impl FromStr for StorageLocation {
    type Err = IngestError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(IngestError::config("storage location is empty"));
        }

        match s.strip_prefix("s3://") {
            Some(rest) => {
                let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
                if bucket.is_empty() {
                    return Err(IngestError::config(format!(
                        "storage location '{}' has no bucket",
                        s
                    )));
                }
                Ok(StorageLocation::S3 {
                    bucket: bucket.to_string(),
                    prefix: prefix.trim_matches('/').to_string(),
                })
            }
            None if s.contains("://") => Err(IngestError::config(format!(
                "unsupported storage scheme in '{}', expected s3:// or a local path",
                s
            ))),
            None => Ok(StorageLocation::Local(PathBuf::from(s))),
        }
    }
}

impl fmt::Display for StorageLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageLocation::Local(path) => write!(f, "{}", path.display()),
            StorageLocation::S3 { bucket, prefix } if prefix.is_empty() => {
                write!(f, "s3://{}", bucket)
            }
            StorageLocation::S3 { bucket, prefix } => write!(f, "s3://{}/{}", bucket, prefix),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_s3_location() {
        let loc: StorageLocation = "s3://its-live-data/velocity_image_pair/landsatOLI/v02/"
            .parse()
            .unwrap();
        assert_eq!(
            loc,
            StorageLocation::S3 {
                bucket: "its-live-data".to_string(),
                prefix: "velocity_image_pair/landsatOLI/v02".to_string(),
            }
        );
        assert!(loc.is_remote());
        assert_eq!(
            loc.to_string(),
            "s3://its-live-data/velocity_image_pair/landsatOLI/v02"
        );
    }

    #[test]
    fn test_parse_bucket_only() {
        let loc: StorageLocation = "s3://bucket".parse().unwrap();
        assert_eq!(loc.to_string(), "s3://bucket");
    }

    #[test]
    fn test_parse_local_location() {
        let loc: StorageLocation = "./output/chunks".parse().unwrap();
        assert_eq!(loc, StorageLocation::Local(PathBuf::from("./output/chunks")));
        assert!(!loc.is_remote());
    }

    #[test]
    fn test_parse_invalid_location() {
        assert!("".parse::<StorageLocation>().is_err());
        assert!("s3:///prefix".parse::<StorageLocation>().is_err());
        assert!("gs://bucket/prefix".parse::<StorageLocation>().is_err());
    }
}
