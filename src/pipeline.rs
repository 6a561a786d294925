use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{stream, StreamExt};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::apify::ApifyClient;
use crate::config::SleuthConfig;
use crate::filter::{self, Criterion};
use crate::llm::LLMProcessor;
use crate::matcher::{MatcherStatus, SemanticMatcher};
use crate::metering::{ApifyMeter, LogMeter, UsageEvent, UsageMeter};
use crate::normalize::Normalizer;
use crate::report::{ApifyDatasetSink, JsonLinesSink, ReportSink};
use crate::sources::{build_sources, ListingSource};
use crate::summary::ListingSummaries;
use crate::tracker::{ChangeTracker, FileStateStore, StateStore};
use crate::types::{Listing, ListingDetail, RawRecord, SearchCriteria, Source, SourceRequest};
use crate::{Result, SleuthError};

const NO_MATCHER: &str = "no LLM credential configured";

/// What happened to one requested source during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SourceOutcome {
    Completed { records: usize, malformed: usize },
    /// The collaborator failed or timed out.
    Unavailable { reason: String },
    /// The run was cancelled before the fetch finished.
    Cancelled,
    /// No collaborator is registered for the source.
    NotConfigured,
}

impl SourceOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, SourceOutcome::Completed { .. })
    }
}

/// Counts and degradations of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    /// Criteria scope key the run was tracked under.
    pub scope: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: BTreeMap<Source, SourceOutcome>,
    pub normalized: usize,
    pub malformed: usize,
    pub duplicates: usize,
    pub new_listings: usize,
    /// Listings rejected by the structured filter, by the first criterion they failed.
    pub filtered_out: BTreeMap<Criterion, usize>,
    pub matcher: MatcherStatus,
    pub reported: usize,
    pub cancelled: bool,
}

impl RunSummary {
    /// Requested sources that did not complete.
    pub fn degraded_sources(&self) -> Vec<Source> {
        self.sources
            .iter()
            .filter(|(_, outcome)| !outcome.is_completed())
            .map(|(source, _)| *source)
            .collect()
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Search Summary ===")?;
        writeln!(f, "Run: {}", self.run_id)?;
        writeln!(
            f,
            "Duration: {:.2}s",
            (self.finished_at - self.started_at).num_milliseconds() as f64 / 1000.0
        )?;
        writeln!(f, "Sources:")?;
        for (source, outcome) in &self.sources {
            match outcome {
                SourceOutcome::Completed { records, malformed } => {
                    writeln!(f, "  {}: {} records ({} malformed)", source, records, malformed)?
                }
                SourceOutcome::Unavailable { reason } => {
                    writeln!(f, "  {}: unavailable ({})", source, reason)?
                }
                SourceOutcome::Cancelled => writeln!(f, "  {}: cancelled", source)?,
                SourceOutcome::NotConfigured => writeln!(f, "  {}: not configured", source)?,
            }
        }
        writeln!(
            f,
            "Listings: {} reported, {} new, {} duplicates, {} malformed",
            self.reported, self.new_listings, self.duplicates, self.malformed
        )?;
        if !self.filtered_out.is_empty() {
            let counts: Vec<String> = self
                .filtered_out
                .iter()
                .map(|(criterion, count)| format!("{}={}", criterion, count))
                .collect();
            writeln!(f, "Filtered out: {}", counts.join(", "))?;
        }
        match &self.matcher {
            MatcherStatus::Disabled => write!(f, "Matcher: disabled")?,
            MatcherStatus::Unavailable { reason } => write!(f, "Matcher: unavailable ({})", reason)?,
            MatcherStatus::Active {
                matched,
                excluded,
                degraded,
            } => write!(
                f,
                "Matcher: {} matched, {} excluded, {} degraded",
                matched, excluded, degraded
            )?,
        }
        if self.cancelled {
            write!(f, "\nRun was cancelled before completion")?;
        }
        Ok(())
    }
}

/// The result of a run: the reported listings in report order, the detail
/// records handed to the sink in the same order, plus the run summary.
#[derive(Debug, Clone, Serialize)]
pub struct SearchReport {
    pub listings: Vec<Listing>,
    pub records: Vec<ListingDetail>,
    pub summary: RunSummary,
}

type Fetched = std::result::Result<Vec<RawRecord>, SourceOutcome>;

/// The `SearchPipeline` struct fans a search out to the listing sources and
/// runs the results through normalization, change tracking, filtering and
/// semantic matching before handing them to the report sink.
pub struct SearchPipeline {
    sources: HashMap<Source, Arc<dyn ListingSource>>,
    normalizer: Normalizer,
    tracker: ChangeTracker,
    matcher: Option<SemanticMatcher>,
    /// Why there is no matcher, when there is none.
    matcher_unavailable: String,
    summaries: ListingSummaries,
    meter: Arc<dyn UsageMeter>,
    sink: Arc<dyn ReportSink>,
    /// Bounds the number of source fetches in flight across runs.
    fetch_limiter: Arc<Semaphore>,
    source_timeout: Duration,
    max_items: usize,
    progress: Option<MultiProgress>,
}

impl SearchPipeline {
    /// Creates a pipeline with no sources and no matcher, tracking state in
    /// `store`, logging usage events and appending the report to the
    /// configured report path.
    pub fn new(config: &SleuthConfig, store: Arc<dyn StateStore>) -> Self {
        Self {
            sources: HashMap::new(),
            normalizer: Normalizer::new(),
            tracker: ChangeTracker::new(store),
            matcher: None,
            matcher_unavailable: NO_MATCHER.to_string(),
            summaries: ListingSummaries::basic(),
            meter: Arc::new(LogMeter),
            sink: Arc::new(JsonLinesSink::new(&config.report_path)),
            fetch_limiter: Arc::new(Semaphore::new(config.concurrent_sources.max(1))),
            source_timeout: config.source_timeout(),
            max_items: config.max_items,
            progress: None,
        }
    }

    /// Creates a fully wired pipeline from the configuration.
    ///
    /// With an Apify token the sources are the platform actors, usage is
    /// charged to `run_id` and the report goes to the run's dataset when those
    /// are known. Without one, sources return mock listings and the report is
    /// appended to the local report file. The matcher and LLM summaries are
    /// enabled when an LLM API key is configured.
    pub fn from_config(config: &SleuthConfig) -> Self {
        let store = Arc::new(FileStateStore::new(&config.state_dir));
        let mut pipeline = Self::new(config, store);

        for source in build_sources(&config.apify) {
            pipeline = pipeline.with_source(source);
        }

        match LLMProcessor::new(config.matcher.clone()) {
            Ok(processor) => {
                let processor = Arc::new(processor);
                pipeline = pipeline
                    .with_matcher(SemanticMatcher::new(processor.clone(), &config.matcher))
                    .with_summaries(ListingSummaries::new(processor, &config.matcher));
            }
            Err(e) => {
                debug!(error = %e, "Semantic matcher disabled");
                pipeline.matcher_unavailable = match e {
                    SleuthError::MatcherUnavailable(reason) => reason,
                    other => other.to_string(),
                };
            }
        }

        if let Some(token) = config.apify.token.as_deref() {
            let client = ApifyClient::new(&config.apify.base_url, token);
            if let Some(run_id) = config.apify.run_id.as_deref() {
                pipeline = pipeline.with_meter(Arc::new(ApifyMeter::new(client.clone(), run_id)));
            }
            if let Some(dataset_id) = config.apify.dataset_id.as_deref() {
                pipeline = pipeline.with_sink(Arc::new(ApifyDatasetSink::new(client, dataset_id)));
            }
        }

        pipeline
    }

    /// Registers `source`, replacing any collaborator registered for the same platform.
    pub fn with_source(mut self, source: Arc<dyn ListingSource>) -> Self {
        self.sources.insert(source.source(), source);
        self
    }

    pub fn with_matcher(mut self, matcher: SemanticMatcher) -> Self {
        self.matcher = Some(matcher);
        self
    }

    pub fn with_summaries(mut self, summaries: ListingSummaries) -> Self {
        self.summaries = summaries;
        self
    }

    pub fn with_meter(mut self, meter: Arc<dyn UsageMeter>) -> Self {
        self.meter = meter;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Shows a spinner per source fetch.
    pub fn with_progress(mut self, progress: MultiProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Runs one search.
    ///
    /// # Arguments
    ///
    /// * `criteria` - What to search for.
    /// * `cancel` - Abandons the fetches and matcher calls still in flight when fired.
    ///
    /// # Returns
    ///
    /// The report, or an error if the criteria are invalid, the tracking state
    /// is corrupt or the report sink fails. Failing sources, malformed records
    /// and matcher failures are recorded in the summary instead.
    ///
    /// The tracking state is committed only after the sink accepted the
    /// report; until then the scope stays locked against other runs.
    #[instrument(skip(self, criteria, cancel), fields(location = %criteria.location))]
    pub async fn run(&self, criteria: &SearchCriteria, cancel: CancellationToken) -> Result<SearchReport> {
        criteria.validate()?;

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let scope = criteria.scope_key();
        info!(%run_id, %scope, sources = criteria.sources.len(), "Starting search");
        self.meter.charge(UsageEvent::SearchInitiated, 1).await;

        let request = SourceRequest::from_criteria(criteria, self.max_items);
        let fetched = self.fetch_all(&criteria.sources, &request, &cancel).await;

        let mut outcomes = BTreeMap::new();
        let mut completed = BTreeSet::new();
        let mut listings = Vec::new();
        let mut malformed_total = 0;

        for (source, fetch) in fetched {
            let records = match fetch {
                Ok(records) => records,
                Err(outcome) => {
                    outcomes.insert(source, outcome);
                    continue;
                }
            };

            let mut malformed = 0;
            for record in &records {
                match self.normalizer.normalize(source, record) {
                    Ok(listing) => listings.push(listing),
                    Err(e) => {
                        debug!(%source, error = %e, "Skipping malformed record");
                        malformed += 1;
                    }
                }
            }
            if malformed > 0 {
                warn!(%source, malformed, total = records.len(), "Skipped malformed records");
            }

            malformed_total += malformed;
            completed.insert(source);
            outcomes.insert(
                source,
                SourceOutcome::Completed {
                    records: records.len(),
                    malformed,
                },
            );
        }
        let normalized = listings.len();

        let (tracked, pending) = self.tracker.mark(&scope, listings, &completed).await?;
        let new_listings = tracked.new_count();
        let duplicates = tracked.duplicates;

        let mut filtered_out: BTreeMap<Criterion, usize> = BTreeMap::new();
        let survivors: Vec<Listing> = tracked
            .listings
            .into_iter()
            .filter(|listing| match filter::check(listing, criteria) {
                Ok(()) => true,
                Err(criterion) => {
                    debug!(id = %listing.id, %criterion, "Listing filtered out");
                    *filtered_out.entry(criterion).or_default() += 1;
                    false
                }
            })
            .collect();
        info!(kept = survivors.len(), rejected = normalized - duplicates - survivors.len(), "Filtering complete");

        let (mut survivors, judgements, matcher) = match (criteria.preference_note(), &self.matcher) {
            (None, _) => (survivors, HashMap::new(), MatcherStatus::Disabled),
            (Some(note), Some(semantic)) => {
                let refined = semantic.refine(survivors, note, &cancel).await;
                (refined.listings, refined.judgements, refined.status)
            }
            (Some(_), None) => {
                warn!(reason = %self.matcher_unavailable, "Preferences given but semantic matcher unavailable");
                (
                    survivors,
                    HashMap::new(),
                    MatcherStatus::Unavailable {
                        reason: self.matcher_unavailable.clone(),
                    },
                )
            }
        };

        sort_for_report(&mut survivors);

        let summaries = self.summaries.summarize_all(&survivors, &cancel).await;
        let records: Vec<ListingDetail> = survivors
            .iter()
            .zip(summaries)
            .map(|(listing, summary)| {
                let detail = listing.detail().with_summary(summary);
                match judgements.get(&listing.id) {
                    Some(judgement) => {
                        detail.with_match(judgement.confidence, judgement.explanation.as_str())
                    }
                    None => detail,
                }
            })
            .collect();

        if let Err(e) = self.sink.push(&records).await {
            error!(error = %e, "Report sink failed, tracking state left unchanged");
            return Err(match e {
                SleuthError::Output(_) => e,
                other => SleuthError::Output(other.to_string()),
            });
        }
        pending.commit().await?;

        self.meter
            .charge(UsageEvent::PropertyFound, u32::try_from(survivors.len()).unwrap_or(u32::MAX))
            .await;
        self.meter.charge(UsageEvent::SearchCompleted, 1).await;

        let summary = RunSummary {
            run_id,
            scope,
            started_at,
            finished_at: Utc::now(),
            sources: outcomes,
            normalized,
            malformed: malformed_total,
            duplicates,
            new_listings,
            filtered_out,
            matcher,
            reported: survivors.len(),
            cancelled: cancel.is_cancelled(),
        };
        info!(
            %run_id,
            reported = summary.reported,
            new = summary.new_listings,
            degraded = summary.degraded_sources().len(),
            "Search complete"
        );

        Ok(SearchReport {
            listings: survivors,
            records,
            summary,
        })
    }

    /// Fetches every requested source concurrently, bounded by the fetch limiter.
    async fn fetch_all(
        &self,
        sources: &BTreeSet<Source>,
        request: &SourceRequest,
        cancel: &CancellationToken,
    ) -> Vec<(Source, Fetched)> {
        let mut fetches = stream::iter(sources.iter().copied())
            .map(|source| async move { (source, self.fetch_one(source, request, cancel).await) })
            .buffer_unordered(sources.len().max(1))
            .collect::<Vec<_>>()
            .await;
        fetches.sort_by_key(|(source, _)| *source);
        fetches
    }

    async fn fetch_one(
        &self,
        source: Source,
        request: &SourceRequest,
        cancel: &CancellationToken,
    ) -> Fetched {
        let Some(collaborator) = self.sources.get(&source) else {
            warn!(%source, "No collaborator registered for source");
            return Err(SourceOutcome::NotConfigured);
        };

        let spinner = self.spinner(source);
        let timeout = self.source_timeout;

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(SourceOutcome::Cancelled),
            result = async {
                let _permit = self.fetch_limiter.acquire().await;
                tokio::time::timeout(timeout, collaborator.fetch(request)).await
            } => match result {
                Ok(Ok(records)) => Ok(records),
                Ok(Err(e)) => Err(SourceOutcome::Unavailable {
                    reason: match e {
                        SleuthError::SourceUnavailable { reason, .. } => reason,
                        other => other.to_string(),
                    },
                }),
                Err(_) => Err(SourceOutcome::Unavailable {
                    reason: format!("timed out after {}s", timeout.as_secs_f64()),
                }),
            },
        };

        match &outcome {
            Ok(records) => info!(%source, count = records.len(), "Source fetched"),
            Err(SourceOutcome::Cancelled) => warn!(%source, "Source fetch cancelled"),
            Err(other) => warn!(%source, outcome = ?other, "Source unavailable"),
        }

        if let Some(spinner) = spinner {
            spinner.finish_with_message(match &outcome {
                Ok(records) => format!("{}: {} records", source, records.len()),
                Err(SourceOutcome::Cancelled) => format!("{}: cancelled", source),
                Err(_) => format!("{}: unavailable", source),
            });
        }

        outcome
    }

    fn spinner(&self, source: Source) -> Option<ProgressBar> {
        let progress = self.progress.as_ref()?;
        let spinner = progress.add(ProgressBar::new_spinner());
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
            spinner.set_style(style);
        }
        spinner.enable_steady_tick(Duration::from_millis(120));
        spinner.set_message(format!("Fetching {} listings...", source));
        Some(spinner)
    }
}

/// Newest listings first, undated ones last, ties broken by identity.
fn sort_for_report(listings: &mut [Listing]) {
    listings.sort_by(|a, b| {
        b.listed_date
            .cmp(&a.listed_date)
            .then_with(|| a.id.cmp(&b.id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metering::RecordingMeter;
    use crate::report::MemorySink;
    use crate::config::MatcherConfig;
    use crate::llm::{Judgement, LlmClient};
    use crate::sources::StaticSource;
    use crate::summary::Summarizer;
    use crate::tracker::{MemoryStateStore, ScopeLock, ScopeState};
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use serde_json::json;

    struct StalledSource(Source);

    #[async_trait]
    impl ListingSource for StalledSource {
        fn source(&self) -> Source {
            self.0
        }

        async fn fetch(&self, _request: &SourceRequest) -> Result<Vec<RawRecord>> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Vec::new())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl ReportSink for FailingSink {
        async fn push(&self, _records: &[ListingDetail]) -> Result<()> {
            Err(SleuthError::Io(std::io::Error::other("disk full")))
        }
    }

    /// Delays every load so that unserialized runs would overlap.
    struct SlowStore(MemoryStateStore);

    #[async_trait]
    impl StateStore for SlowStore {
        async fn lock(&self, scope: &str) -> ScopeLock {
            self.0.lock(scope).await
        }

        async fn load(&self, scope: &str) -> Result<Option<ScopeState>> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            self.0.load(scope).await
        }

        async fn replace(&self, scope: &str, state: &ScopeState) -> Result<()> {
            self.0.replace(scope, state).await
        }
    }

    /// Matches listings priced under 1500.
    struct BudgetLlm;

    #[async_trait]
    impl LlmClient for BudgetLlm {
        async fn judge(&self, listing: &str, _preferences: &str) -> Result<Judgement> {
            Ok(Judgement {
                is_match: listing.contains("Price: $1000.00"),
                confidence: 0.7,
                explanation: "Fits the budget.".to_string(),
            })
        }
    }

    struct ShoutingSummarizer;

    #[async_trait]
    impl Summarizer for ShoutingSummarizer {
        async fn summarize(&self, listing: &Listing) -> Result<String> {
            Ok(listing.title.to_uppercase())
        }
    }

    fn zillow(id: &str, price: f64, beds: f64, date: &str) -> RawRecord {
        json!({
            "zpid": id,
            "price": price,
            "bedrooms": beds,
            "address": "1 Main St, Austin, TX 78701",
            "url": format!("https://www.zillow.com/homedetails/{}/", id),
            "datePosted": date,
        })
    }

    fn realtor(id: &str, price: f64, beds: f64) -> RawRecord {
        json!({
            "property_id": id,
            "price": price,
            "beds": beds,
            "address": "2 Oak Ave, Austin, TX 78702",
            "url": format!("https://www.realtor.com/realestateandhomes-detail/{}", id),
        })
    }

    fn config() -> SleuthConfig {
        SleuthConfig {
            source_timeout_secs: 1,
            ..SleuthConfig::default()
        }
    }

    fn pipeline(sink: Arc<MemorySink>, meter: Arc<RecordingMeter>) -> SearchPipeline {
        SearchPipeline::new(&config(), Arc::new(MemoryStateStore::new()))
            .with_sink(sink)
            .with_meter(meter)
    }

    #[tokio::test]
    async fn test_passing_and_failing_listing() {
        let sink = Arc::new(MemorySink::new());
        let meter = Arc::new(RecordingMeter::new());
        let pipeline = pipeline(sink.clone(), meter.clone())
            .with_source(Arc::new(StaticSource::new(
                Source::Zillow,
                vec![zillow("z1", 2900.0, 2.0, "2024-05-01")],
            )))
            .with_source(Arc::new(StaticSource::new(
                Source::Realtor,
                vec![realtor("r1", 3200.0, 2.0)],
            )));

        let criteria = SearchCriteria::new("Austin, TX")
            .with_bedrooms(Some(2.0), None)
            .with_price(None, Some(3000.0))
            .with_sources([Source::Zillow, Source::Realtor]);

        let report = pipeline.run(&criteria, CancellationToken::new()).await.unwrap();

        assert_eq!(report.listings.len(), 1);
        assert_eq!(report.listings[0].id.to_string(), "zillow:z1");
        assert!(report.listings[0].is_new);
        assert_eq!(report.summary.filtered_out.get(&Criterion::Price), Some(&1));
        assert_eq!(report.summary.matcher, MatcherStatus::Disabled);
        assert_eq!(sink.records().await.len(), 1);
        assert_eq!(meter.total(UsageEvent::SearchInitiated), 1);
        assert_eq!(meter.total(UsageEvent::PropertyFound), 1);
        assert_eq!(meter.total(UsageEvent::SearchCompleted), 1);
    }

    #[tokio::test]
    async fn test_second_run_has_nothing_new() {
        let pipeline = pipeline(Arc::new(MemorySink::new()), Arc::new(RecordingMeter::new()))
            .with_source(Arc::new(StaticSource::new(
                Source::Zillow,
                vec![zillow("z1", 1000.0, 1.0, "2024-05-01"), zillow("z2", 1100.0, 1.0, "2024-05-02")],
            )));
        let criteria = SearchCriteria::new("Austin, TX").with_sources([Source::Zillow]);

        let first = pipeline.run(&criteria, CancellationToken::new()).await.unwrap();
        let second = pipeline.run(&criteria, CancellationToken::new()).await.unwrap();

        assert!(first.listings.iter().all(|l| l.is_new));
        assert_eq!(second.listings.len(), 2);
        assert!(second.listings.iter().all(|l| !l.is_new));
        assert_eq!(second.summary.new_listings, 0);
    }

    #[tokio::test]
    async fn test_timed_out_source_is_recorded() {
        let pipeline = pipeline(Arc::new(MemorySink::new()), Arc::new(RecordingMeter::new()))
            .with_source(Arc::new(StaticSource::new(
                Source::Zillow,
                vec![zillow("z1", 1000.0, 1.0, "2024-05-01")],
            )))
            .with_source(Arc::new(StaticSource::new(
                Source::Realtor,
                vec![realtor("r1", 1200.0, 1.0)],
            )))
            .with_source(Arc::new(StalledSource(Source::Apartments)));

        let report = pipeline
            .run(&SearchCriteria::new("Austin, TX"), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.listings.len(), 2);
        assert_eq!(report.summary.degraded_sources(), vec![Source::Apartments]);
        assert!(matches!(
            report.summary.sources.get(&Source::Apartments),
            Some(SourceOutcome::Unavailable { reason }) if reason.contains("timed out")
        ));
    }

    #[tokio::test]
    async fn test_unregistered_source_is_not_configured() {
        let pipeline = pipeline(Arc::new(MemorySink::new()), Arc::new(RecordingMeter::new()))
            .with_source(Arc::new(StaticSource::new(Source::Zillow, Vec::new())));

        let report = pipeline
            .run(&SearchCriteria::new("Austin, TX"), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            report.summary.sources.get(&Source::Realtor),
            Some(&SourceOutcome::NotConfigured)
        );
        assert!(report.summary.sources[&Source::Zillow].is_completed());
    }

    #[tokio::test]
    async fn test_malformed_records_are_counted() {
        let pipeline = pipeline(Arc::new(MemorySink::new()), Arc::new(RecordingMeter::new()))
            .with_source(Arc::new(StaticSource::new(
                Source::Zillow,
                vec![
                    zillow("z1", 1000.0, 1.0, "2024-05-01"),
                    json!({"price": 1000}),
                    json!({"zpid": "z9", "url": "https://evil.example.com/z9"}),
                ],
            )));
        let criteria = SearchCriteria::new("Austin, TX").with_sources([Source::Zillow]);

        let report = pipeline.run(&criteria, CancellationToken::new()).await.unwrap();

        assert_eq!(report.listings.len(), 1);
        assert_eq!(report.summary.malformed, 2);
        assert_eq!(
            report.summary.sources[&Source::Zillow],
            SourceOutcome::Completed { records: 3, malformed: 2 }
        );
    }

    #[tokio::test]
    async fn test_report_order_is_newest_first() {
        let pipeline = pipeline(Arc::new(MemorySink::new()), Arc::new(RecordingMeter::new()))
            .with_source(Arc::new(StaticSource::new(
                Source::Zillow,
                vec![
                    zillow("b", 1000.0, 1.0, "2024-05-01"),
                    json!({"zpid": "undated", "url": "https://www.zillow.com/undated"}),
                    zillow("c", 1000.0, 1.0, "2024-06-01"),
                    zillow("a", 1000.0, 1.0, "2024-05-01"),
                ],
            )));
        let criteria = SearchCriteria::new("Austin, TX").with_sources([Source::Zillow]);

        let report = pipeline.run(&criteria, CancellationToken::new()).await.unwrap();
        let order: Vec<&str> = report.listings.iter().map(|l| l.id.native_id.as_str()).collect();

        assert_eq!(order, vec!["c", "a", "b", "undated"]);
        assert_eq!(
            report.listings[0].listed_date,
            NaiveDate::from_ymd_opt(2024, 6, 1)
        );
    }

    #[tokio::test]
    async fn test_invalid_criteria_fails_before_fetch() {
        let meter = Arc::new(RecordingMeter::new());
        let pipeline = pipeline(Arc::new(MemorySink::new()), meter.clone());

        let criteria = SearchCriteria::new("Austin, TX").with_price(Some(5.0), Some(1.0));
        let result = pipeline.run(&criteria, CancellationToken::new()).await;

        assert!(matches!(result, Err(SleuthError::InvalidCriteria(_))));
        assert!(meter.events().is_empty());
    }

    #[tokio::test]
    async fn test_sink_failure_is_fatal() {
        let pipeline = SearchPipeline::new(&config(), Arc::new(MemoryStateStore::new()))
            .with_sink(Arc::new(FailingSink))
            .with_source(Arc::new(StaticSource::new(Source::Zillow, Vec::new())));

        let criteria = SearchCriteria::new("Austin, TX").with_sources([Source::Zillow]);
        let result = pipeline.run(&criteria, CancellationToken::new()).await;

        assert!(matches!(result, Err(SleuthError::Output(_))));
    }

    #[tokio::test]
    async fn test_failed_report_leaves_listings_new() {
        let store = Arc::new(MemoryStateStore::new());
        let criteria = SearchCriteria::new("Austin, TX").with_sources([Source::Zillow]);
        let source = Arc::new(StaticSource::new(
            Source::Zillow,
            vec![zillow("z1", 1000.0, 1.0, "2024-05-01")],
        ));

        let failing = SearchPipeline::new(&config(), store.clone())
            .with_sink(Arc::new(FailingSink))
            .with_source(source.clone());
        assert!(failing.run(&criteria, CancellationToken::new()).await.is_err());
        assert!(store.load(&criteria.scope_key()).await.unwrap().is_none());

        let sink = Arc::new(MemorySink::new());
        let working = SearchPipeline::new(&config(), store.clone())
            .with_sink(sink.clone())
            .with_source(source);
        let report = working.run(&criteria, CancellationToken::new()).await.unwrap();

        assert!(report.listings[0].is_new);
        assert!(sink.records().await[0].overview.is_new);
        let again = working.run(&criteria, CancellationToken::new()).await.unwrap();
        assert!(!again.listings[0].is_new);
    }

    #[tokio::test]
    async fn test_pipelines_sharing_a_store_flag_a_listing_once() {
        let store: Arc<dyn StateStore> = Arc::new(SlowStore(MemoryStateStore::new()));
        let criteria = SearchCriteria::new("Austin, TX").with_sources([Source::Zillow]);
        let build = || {
            SearchPipeline::new(&config(), store.clone())
                .with_sink(Arc::new(MemorySink::new()))
                .with_source(Arc::new(StaticSource::new(
                    Source::Zillow,
                    vec![zillow("z1", 1000.0, 1.0, "2024-05-01")],
                )))
        };
        let (first, second) = (build(), build());

        let (a, b) = tokio::join!(
            first.run(&criteria, CancellationToken::new()),
            second.run(&criteria, CancellationToken::new()),
        );

        let new_total = a.unwrap().summary.new_listings + b.unwrap().summary.new_listings;
        assert_eq!(new_total, 1);
    }

    #[tokio::test]
    async fn test_records_carry_summary_and_match_explanation() {
        let sink = Arc::new(MemorySink::new());
        let matcher_config = MatcherConfig::default();
        let pipeline = SearchPipeline::new(&config(), Arc::new(MemoryStateStore::new()))
            .with_sink(sink.clone())
            .with_matcher(SemanticMatcher::new(Arc::new(BudgetLlm), &matcher_config))
            .with_summaries(ListingSummaries::new(Arc::new(ShoutingSummarizer), &matcher_config))
            .with_source(Arc::new(StaticSource::new(
                Source::Zillow,
                vec![zillow("z1", 1000.0, 1.0, "2024-05-01"), zillow("z2", 2000.0, 1.0, "2024-05-02")],
            )));
        let criteria = SearchCriteria::new("Austin, TX")
            .with_sources([Source::Zillow])
            .with_preferences("cheap please");

        let report = pipeline.run(&criteria, CancellationToken::new()).await.unwrap();

        assert_eq!(report.records.len(), 1);
        let record = &report.records[0];
        assert_eq!(record.overview.id, "zillow:z1");
        assert_eq!(record.summary, report.listings[0].title.to_uppercase());
        assert_eq!(record.match_confidence, Some(0.7));
        assert_eq!(record.match_explanation.as_deref(), Some("Fits the budget."));
        assert_eq!(sink.records().await, report.records);
    }

    #[tokio::test]
    async fn test_records_without_matcher_use_basic_summary() {
        let pipeline = pipeline(Arc::new(MemorySink::new()), Arc::new(RecordingMeter::new()))
            .with_source(Arc::new(StaticSource::new(
                Source::Zillow,
                vec![zillow("z1", 1000.0, 1.0, "2024-05-01")],
            )));
        let criteria = SearchCriteria::new("Austin, TX").with_sources([Source::Zillow]);

        let report = pipeline.run(&criteria, CancellationToken::new()).await.unwrap();

        assert_eq!(report.records[0].summary, report.listings[0].summary());
        assert!(report.records[0].match_confidence.is_none());
    }

    #[tokio::test]
    async fn test_cancelled_run_keeps_state_of_failed_sources() {
        let store = Arc::new(MemoryStateStore::new());
        let criteria = SearchCriteria::new("Austin, TX").with_sources([Source::Zillow]);

        let live = SearchPipeline::new(&config(), store.clone())
            .with_sink(Arc::new(MemorySink::new()))
            .with_source(Arc::new(StaticSource::new(
                Source::Zillow,
                vec![zillow("z1", 1000.0, 1.0, "2024-05-01")],
            )));
        live.run(&criteria, CancellationToken::new()).await.unwrap();

        let stalled = SearchPipeline::new(&config(), store.clone())
            .with_sink(Arc::new(MemorySink::new()))
            .with_source(Arc::new(StalledSource(Source::Zillow)));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = stalled.run(&criteria, cancel).await.unwrap();

        assert!(report.summary.cancelled);
        assert_eq!(report.summary.sources[&Source::Zillow], SourceOutcome::Cancelled);

        let again = live.run(&criteria, CancellationToken::new()).await.unwrap();
        assert!(!again.listings[0].is_new);
    }

    #[test]
    fn test_summary_display() {
        let summary = RunSummary {
            run_id: Uuid::nil(),
            scope: "abc".to_string(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            sources: [
                (Source::Zillow, SourceOutcome::Completed { records: 4, malformed: 1 }),
                (Source::Realtor, SourceOutcome::Unavailable { reason: "timed out after 300s".to_string() }),
            ]
            .into_iter()
            .collect(),
            normalized: 3,
            malformed: 1,
            duplicates: 0,
            new_listings: 2,
            filtered_out: [(Criterion::Price, 1)].into_iter().collect(),
            matcher: MatcherStatus::Unavailable { reason: NO_MATCHER.to_string() },
            reported: 2,
            cancelled: false,
        };

        let text = summary.to_string();
        assert!(text.contains("zillow: 4 records (1 malformed)"));
        assert!(text.contains("realtor: unavailable (timed out after 300s)"));
        assert!(text.contains("Filtered out: price=1"));
        assert!(text.contains("Matcher: unavailable (no LLM credential configured)"));
    }
}
