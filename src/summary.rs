//! Short summaries of reported listings.
//!
//! With an LLM credential each listing is summarized by the model. A call
//! that fails, times out or is cancelled falls back to the structured
//! [`Listing::summary`], so every reported record carries a summary.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::MatcherConfig;
use crate::types::Listing;
use crate::Result;

/// Writes a one-paragraph summary of a listing.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, listing: &Listing) -> Result<String>;
}

/// Summarizes from the structured fields alone.
pub struct BasicSummarizer;

#[async_trait]
impl Summarizer for BasicSummarizer {
    async fn summarize(&self, listing: &Listing) -> Result<String> {
        Ok(listing.summary())
    }
}

pub struct ListingSummaries {
    summarizer: Arc<dyn Summarizer>,
    concurrency: usize,
    timeout: Duration,
}

impl ListingSummaries {
    pub fn new(summarizer: Arc<dyn Summarizer>, config: &MatcherConfig) -> Self {
        Self {
            summarizer,
            concurrency: config.concurrency.max(1),
            timeout: config.timeout(),
        }
    }

    pub fn basic() -> Self {
        Self::new(Arc::new(BasicSummarizer), &MatcherConfig::default())
    }

    /// Summarizes `listings`, returning one summary per listing in the same order.
    pub async fn summarize_all(&self, listings: &[Listing], cancel: &CancellationToken) -> Vec<String> {
        let summarizer = &self.summarizer;
        let timeout = self.timeout;

        let summaries: Vec<Option<String>> = stream::iter(listings)
            .map(|listing| async move {
                let result = tokio::select! {
                    _ = cancel.cancelled() => return None,
                    result = tokio::time::timeout(timeout, summarizer.summarize(listing)) => result,
                };
                match result {
                    Ok(Ok(summary)) => Some(summary),
                    Ok(Err(e)) => {
                        warn!(id = %listing.id, error = %e, "Summary failed");
                        None
                    }
                    Err(_) => {
                        warn!(id = %listing.id, ?timeout, "Summary timed out");
                        None
                    }
                }
            })
            .buffered(self.concurrency)
            .collect()
            .await;

        let fallbacks = summaries.iter().filter(|s| s.is_none()).count();
        if fallbacks > 0 {
            info!(fallbacks, total = listings.len(), "Used basic summaries");
        }

        summaries
            .into_iter()
            .zip(listings)
            .map(|(summary, listing)| summary.unwrap_or_else(|| listing.summary()))
            .collect()
    }
}
