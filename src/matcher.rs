//! Optional semantic refinement of filtered listings by a language model.
//!
//! The matcher only reads the free-text preference note. Calls run with
//! bounded concurrency and each is subject to its own timeout. A failed call
//! never fails the run: the listing is kept or dropped according to the
//! configured [`FailPolicy`] and counted as degraded.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::{stream, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{FailPolicy, MatcherConfig};
use crate::llm::{Judgement, LlmClient};
use crate::prompt::PromptBuilder;
use crate::types::{Listing, ListingId};
use crate::{Result, SleuthError};

/// How the semantic matcher took part in a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MatcherStatus {
    /// No preference note was given.
    Disabled,
    /// A preference note was given but the matcher could not run; listings passed through.
    Unavailable { reason: String },
    Active {
        matched: usize,
        excluded: usize,
        /// Calls that failed or timed out and were settled by the fail policy.
        degraded: usize,
    },
}

/// Listings kept by the matcher together with its status.
#[derive(Debug)]
pub struct Refined {
    pub listings: Vec<Listing>,
    /// The model's verdict on each kept listing it judged a match.
    pub judgements: HashMap<ListingId, Judgement>,
    pub status: MatcherStatus,
}

pub struct SemanticMatcher {
    client: Arc<dyn LlmClient>,
    concurrency: usize,
    timeout: Duration,
    fail_policy: FailPolicy,
}

impl SemanticMatcher {
    pub fn new(client: Arc<dyn LlmClient>, config: &MatcherConfig) -> Self {
        Self {
            client,
            concurrency: config.concurrency.max(1),
            timeout: config.timeout(),
            fail_policy: config.fail_policy,
        }
    }

    /// Keeps the listings the model judges to satisfy `preferences`, in their original order.
    ///
    /// Calls still pending when `cancel` fires are settled by the fail policy.
    pub async fn refine(
        &self,
        listings: Vec<Listing>,
        preferences: &str,
        cancel: &CancellationToken,
    ) -> Refined {
        let total = listings.len();
        let client = &self.client;
        let timeout = self.timeout;

        let verdicts: Vec<(Listing, Result<Judgement>)> = stream::iter(listings)
            .map(|listing| async move {
                let description = PromptBuilder::describe(&listing);
                let verdict = tokio::select! {
                    _ = cancel.cancelled() => {
                        Err(SleuthError::MatcherUnavailable("run cancelled".to_string()))
                    }
                    result = tokio::time::timeout(timeout, client.judge(&description, preferences)) => {
                        result.unwrap_or(Err(SleuthError::MatcherTimeout(timeout)))
                    }
                };
                (listing, verdict)
            })
            .buffered(self.concurrency)
            .collect()
            .await;

        let (mut matched, mut excluded, mut degraded) = (0, 0, 0);
        let mut kept = Vec::with_capacity(total);
        let mut judgements = HashMap::new();

        for (listing, verdict) in verdicts {
            match verdict {
                Ok(judgement) if judgement.is_match => {
                    debug!(id = %listing.id, confidence = judgement.confidence, "Listing matches preferences");
                    matched += 1;
                    judgements.insert(listing.id.clone(), judgement);
                    kept.push(listing);
                }
                Ok(judgement) => {
                    debug!(id = %listing.id, explanation = %judgement.explanation, "Listing excluded by preferences");
                    excluded += 1;
                }
                Err(e) => {
                    warn!(id = %listing.id, error = %e, policy = ?self.fail_policy, "Match call failed");
                    degraded += 1;
                    if self.fail_policy == FailPolicy::FailOpen {
                        kept.push(listing);
                    }
                }
            }
        }

        info!(total, matched, excluded, degraded, "Semantic matching finished");
        Refined {
            listings: kept,
            judgements,
            status: MatcherStatus::Active {
                matched,
                excluded,
                degraded,
            },
        }
    }
}
