//! S3 round trips against a running S3-compatible service
//!
//! Skipped unless `S3_ENDPOINT` is set. The bucket (`S3_TEST_BUCKET`,
//! default `stacforge-test`) must already exist:
//!
//! ```bash
//! export S3_ENDPOINT=http://localhost:9000
//! export S3_ACCESS_KEY=minioadmin S3_SECRET_KEY=minioadmin S3_PATH_STYLE=true
//! cargo test --test s3_tests
//! ```

mod common;

use common::{record_for, TestWorkspace, PARTITION};
use serial_test::serial;
use stacforge_common::PartitionKey;
use stacforge_ingest::framework::{NoopHygiene, Pipeline, ProgressStore, RemoteProgressStore};
use stacforge_ingest::storage::{ObjectStore, S3Store, StorageConfig};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

async fn test_store() -> Option<Arc<dyn ObjectStore>> {
    if std::env::var("S3_ENDPOINT").is_err() {
        eprintln!("S3_ENDPOINT not set, skipping");
        return None;
    }
    let bucket = std::env::var("S3_TEST_BUCKET").unwrap_or_else(|_| "stacforge-test".to_string());
    let prefix = format!("run-{}", uuid::Uuid::new_v4());
    let store = S3Store::new(&StorageConfig::from_env(), bucket, prefix)
        .await
        .expect("Failed to create S3 client");
    Some(Arc::new(store))
}

#[tokio::test]
#[serial]
async fn test_s3_object_round_trip() {
    let Some(store) = test_store().await else {
        return;
    };

    store.put("p/a.json", b"{}".to_vec()).await.unwrap();
    store.put("p/b.json", b"[]".to_vec()).await.unwrap();

    assert_eq!(store.list("p/").await.unwrap(), vec!["p/a.json", "p/b.json"]);
    assert_eq!(store.get("p/a.json").await.unwrap(), Some(b"{}".to_vec()));
    assert_eq!(store.get("p/missing.json").await.unwrap(), None);

    store.delete("p/a.json").await.unwrap();
    store.delete("p/a.json").await.unwrap();
    assert_eq!(store.list("p/").await.unwrap(), vec!["p/b.json"]);
    store.delete("p/b.json").await.unwrap();
}

#[tokio::test]
#[serial]
async fn test_sync_run_against_s3() {
    let Some(destination) = test_store().await else {
        return;
    };

    let ws = TestWorkspace::new().with_objects(&["a", "b", "c"]).await;
    let mut options = ws.options(2);
    options.sync = true;
    let pipeline = Pipeline::new(options, Arc::clone(&ws.source), Arc::new(record_for))
        .with_destination(Arc::clone(&destination))
        .with_progress_store(Arc::new(RemoteProgressStore::new(Arc::clone(&destination))))
        .with_hygiene(Arc::new(NoopHygiene));
    let partition = PartitionKey::new(PARTITION).unwrap();

    let summary = pipeline
        .run_partition(&partition, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(summary.processed_batches, 2);

    let key = format!("{}/2019.ndjson", PARTITION);
    let data = destination.get(&key).await.unwrap().expect("consolidated file");
    assert_eq!(common::ids_in_bytes(&data), vec!["a", "b", "c"]);
    assert_eq!(
        RemoteProgressStore::new(Arc::clone(&destination))
            .get_last_completed(&partition)
            .await,
        Some(1)
    );

    destination.delete(&key).await.unwrap();
    destination.delete(&format!("{}.merged", key)).await.unwrap();
    destination.delete("checkpoints.json").await.unwrap();
}
