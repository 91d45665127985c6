//! Catalog endpoint client
//!
//! Create-or-update of generated records against a STAC-style API:
//! `POST {endpoint}/collections/{collection}/items`, and on 409 a
//! `PUT .../items/{id}`. A 404 on that PUT is accepted.

use futures::stream::{self, StreamExt};
use reqwest::{Client, StatusCode};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{IngestError, Result};
use crate::framework::types::Record;

/// Default timeout for catalog requests in seconds.
pub const DEFAULT_CATALOG_TIMEOUT_SECS: u64 = 60;

/// What an upsert ended up doing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
    /// 409 on create, then 404 on update
    Unchanged,
}

/// Totals of a bulk upsert
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpsertReport {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failed: usize,
}

impl UpsertReport {
    pub fn succeeded(&self) -> usize {
        self.created + self.updated + self.unchanged
    }

    fn add(&mut self, outcome: &Result<UpsertOutcome>) {
        match outcome {
            Ok(UpsertOutcome::Created) => self.created += 1,
            Ok(UpsertOutcome::Updated) => self.updated += 1,
            Ok(UpsertOutcome::Unchanged) => self.unchanged += 1,
            Err(_) => self.failed += 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CatalogClient {
    client: Client,
    endpoint: String,
    collection: String,
}

impl CatalogClient {
    pub fn new(endpoint: impl Into<String>, collection: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_CATALOG_TIMEOUT_SECS))
            .build()?;

        Ok(Self::with_client(client, endpoint, collection))
    }

    pub fn with_client(
        client: Client,
        endpoint: impl Into<String>,
        collection: impl Into<String>,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            collection: collection.into(),
        }
    }

    pub fn items_url(&self) -> String {
        format!("{}/collections/{}/items", self.endpoint, self.collection)
    }

    /// URL of one item, with `id` percent-encoded as a single path segment
    pub fn item_url(&self, id: &str) -> Result<String> {
        let items = self.items_url();
        let mut url = reqwest::Url::parse(&items)
            .map_err(|e| IngestError::config(format!("invalid catalog URL '{}': {}", items, e)))?;
        url.path_segments_mut()
            .map_err(|_| IngestError::config(format!("catalog URL '{}' cannot hold a path", items)))?
            .push(id);
        Ok(url.to_string())
    }

    async fn status_error(url: String, response: reqwest::Response) -> IngestError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        IngestError::Catalog { url, status, body }
    }

    /// Create the record, or update it if it already exists
    pub async fn upsert(&self, record: &Record) -> Result<UpsertOutcome> {
        let url = self.items_url();
        let response = self
            .client
            .post(&url)
            .json(&record.document)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            debug!(id = %record.id, "Created catalog item");
            return Ok(UpsertOutcome::Created);
        }
        if status != StatusCode::CONFLICT {
            return Err(Self::status_error(url, response).await);
        }

        let url = self.item_url(&record.id)?;
        let response = self.client.put(&url).json(&record.document).send().await?;
        let status = response.status();

        if status.is_success() {
            debug!(id = %record.id, "Updated catalog item");
            Ok(UpsertOutcome::Updated)
        } else if status == StatusCode::NOT_FOUND {
            debug!(id = %record.id, "Catalog item unchanged");
            Ok(UpsertOutcome::Unchanged)
        } else {
            Err(Self::status_error(url, response).await)
        }
    }

    /// Upsert records with at most `concurrency` requests in flight.
    /// Failures are logged and counted.
    pub async fn upsert_all(&self, records: &[Record], concurrency: usize) -> UpsertReport {
        let outcomes: Vec<(String, Result<UpsertOutcome>)> = stream::iter(records)
            .map(|record| async move { (record.id.clone(), self.upsert(record).await) })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;

        let mut report = UpsertReport::default();
        for (id, outcome) in &outcomes {
            if let Err(e) = outcome {
                warn!(id = %id, error = %e, "Catalog upsert failed");
            }
            report.add(outcome);
        }
        report
    }

    /// Upsert every record of an NDJSON file
    pub async fn ingest_file(&self, path: &Path, concurrency: usize) -> Result<UpsertReport> {
        let contents = tokio::fs::read_to_string(path).await?;

        let mut records = Vec::new();
        let mut invalid = 0usize;
        for (number, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match Record::from_line(line) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(file = %path.display(), line = number + 1, error = %e, "Skipping invalid record");
                    invalid += 1;
                }
            }
        }

        info!(
            file = %path.display(),
            records = records.len(),
            collection = %self.collection,
            "Ingesting records into catalog"
        );

        let mut report = self.upsert_all(&records, concurrency).await;
        report.failed += invalid;

        info!(
            created = report.created,
            updated = report.updated,
            unchanged = report.unchanged,
            failed = report.failed,
            "Catalog ingestion finished"
        );
        Ok(report)
    }
}
