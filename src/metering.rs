use std::fmt;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::apify::ApifyClient;

/// A billable usage event of a search run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UsageEvent {
    SearchInitiated,
    /// Charged once per reported listing.
    PropertyFound,
    SearchCompleted,
}

impl UsageEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageEvent::SearchInitiated => "search-initiated",
            UsageEvent::PropertyFound => "property-found",
            UsageEvent::SearchCompleted => "search-completed",
        }
    }
}

impl fmt::Display for UsageEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Records usage events. Metering is best effort: a failed charge is logged
/// and never affects the run.
#[async_trait]
pub trait UsageMeter: Send + Sync {
    async fn charge(&self, event: UsageEvent, count: u32);
}

/// Logs usage events without billing them.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMeter;

#[async_trait]
impl UsageMeter for LogMeter {
    async fn charge(&self, event: UsageEvent, count: u32) {
        info!(%event, count, "Usage event");
    }
}

/// Charges usage events to the current Apify actor run.
pub struct ApifyMeter {
    client: ApifyClient,
    run_id: String,
}

impl ApifyMeter {
    pub fn new(client: ApifyClient, run_id: impl Into<String>) -> Self {
        Self {
            client,
            run_id: run_id.into(),
        }
    }
}

#[async_trait]
impl UsageMeter for ApifyMeter {
    async fn charge(&self, event: UsageEvent, count: u32) {
        if count == 0 {
            return;
        }
        match self.client.charge(&self.run_id, event.as_str(), count).await {
            Ok(()) => info!(%event, count, run_id = %self.run_id, "Charged usage event"),
            Err(e) => warn!(%event, count, error = %e, "Failed to charge usage event"),
        }
    }
}

/// Keeps every charged event in memory.
#[derive(Debug, Default)]
pub struct RecordingMeter {
    events: Mutex<Vec<(UsageEvent, u32)>>,
}

impl RecordingMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(UsageEvent, u32)> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Total count charged for `event`.
    pub fn total(&self, event: UsageEvent) -> u32 {
        self.events()
            .iter()
            .filter(|(e, _)| *e == event)
            .map(|(_, count)| count)
            .sum()
    }
}

#[async_trait]
impl UsageMeter for RecordingMeter {
    async fn charge(&self, event: UsageEvent, count: u32) {
        if let Ok(mut events) = self.events.lock() {
            events.push((event, count));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recording_meter_totals() {
        let meter = RecordingMeter::new();
        meter.charge(UsageEvent::SearchInitiated, 1).await;
        meter.charge(UsageEvent::PropertyFound, 3).await;
        meter.charge(UsageEvent::PropertyFound, 2).await;

        assert_eq!(meter.total(UsageEvent::PropertyFound), 5);
        assert_eq!(meter.total(UsageEvent::SearchCompleted), 0);
        assert_eq!(meter.events()[0], (UsageEvent::SearchInitiated, 1));
    }

    #[tokio::test]
    async fn test_apify_meter_swallows_failures() {
        let mut server = mockito::Server::new_async().await;
        let charge = server
            .mock("POST", "/actor-runs/run1/charge")
            .with_status(500)
            .create_async()
            .await;

        let meter = ApifyMeter::new(ApifyClient::new(server.url(), "t"), "run1");
        meter.charge(UsageEvent::SearchCompleted, 1).await;
        meter.charge(UsageEvent::PropertyFound, 0).await;

        charge.assert_async().await;
    }
}
