use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, instrument};

use crate::apify::ApifyClient;
use crate::types::ListingDetail;
use crate::{Result, SleuthError};

/// Receives the report records of a run.
#[async_trait]
pub trait ReportSink: Send + Sync {
    /// Stores `records`. An error here fails the run with `Output`.
    async fn push(&self, records: &[ListingDetail]) -> Result<()>;
}

/// Appends report records to a JSON-lines file, one record per line.
pub struct JsonLinesSink {
    path: PathBuf,
}

impl JsonLinesSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn append(&self, records: &[ListingDetail]) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut buffer = Vec::new();
        for record in records {
            serde_json::to_writer(&mut buffer, record)?;
            buffer.push(b'\n');
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&buffer).await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl ReportSink for JsonLinesSink {
    #[instrument(skip(self, records), fields(path = %self.path.display(), count = records.len()))]
    async fn push(&self, records: &[ListingDetail]) -> Result<()> {
        self.append(records)
            .await
            .map_err(|e| SleuthError::Output(format!("{}: {}", self.path.display(), e)))?;
        info!("Report written");
        Ok(())
    }
}

/// Pushes report records to an Apify dataset.
pub struct ApifyDatasetSink {
    client: ApifyClient,
    dataset_id: String,
}

impl ApifyDatasetSink {
    pub fn new(client: ApifyClient, dataset_id: impl Into<String>) -> Self {
        Self {
            client,
            dataset_id: dataset_id.into(),
        }
    }
}

#[async_trait]
impl ReportSink for ApifyDatasetSink {
    async fn push(&self, records: &[ListingDetail]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        self.client
            .push_dataset_items(&self.dataset_id, records)
            .await
            .map_err(|e| SleuthError::Output(format!("dataset {}: {}", self.dataset_id, e)))?;
        info!(dataset_id = %self.dataset_id, count = records.len(), "Report pushed to dataset");
        Ok(())
    }
}

/// Collects report records in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<ListingDetail>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<ListingDetail> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl ReportSink for MemorySink {
    async fn push(&self, records: &[ListingDetail]) -> Result<()> {
        self.records.lock().await.extend_from_slice(records);
        Ok(())
    }
}
