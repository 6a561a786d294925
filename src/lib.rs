use std::time::Duration;
use thiserror::Error;

pub mod apify;
pub mod config;
pub mod filter;
pub mod html;
pub mod llm;
pub mod matcher;
pub mod metering;
pub mod normalize;
pub mod pipeline;
pub mod prompt;
pub mod report;
pub mod sources;
pub mod summary;
pub mod tracker;
pub mod types;

// Re-export commonly used types
pub use config::SleuthConfig;
pub use pipeline::{SearchPipeline, SearchReport};
pub use types::{Listing, ListingId, PropertyType, SearchCriteria, SearchType, Source};

/// The `SleuthError` enum represents the errors that can occur while aggregating listings.
///
/// `InvalidCriteria`, `StateCorruption` and `Output` abort a run. Every other
/// variant is local to one record, one source or one matcher call and is
/// absorbed into the run summary by the pipeline.
#[derive(Error, Debug)]
pub enum SleuthError {
    /// A raw record is missing its id, url or source, or they cannot be parsed.
    #[error("Malformed {platform} record: {reason}")]
    MalformedRecord { platform: Source, reason: String },
    /// A source collaborator failed or timed out.
    #[error("Source {platform} unavailable: {reason}")]
    SourceUnavailable { platform: Source, reason: String },
    /// The semantic matcher has no credential or the LLM refused the request.
    #[error("Matcher unavailable: {0}")]
    MatcherUnavailable(String),
    /// A semantic matcher call exceeded its timeout.
    #[error("Matcher timed out after {0:?}")]
    MatcherTimeout(Duration),
    /// The persisted identity set of a criteria scope cannot be read or written.
    #[error("State for scope {scope} is corrupt: {reason}")]
    StateCorruption { scope: String, reason: String },
    /// The search criteria are malformed.
    #[error("Invalid search criteria: {0}")]
    InvalidCriteria(String),
    /// The actor platform answered with an error status.
    #[error("Apify API error {status}: {message}")]
    Api { status: u16, message: String },
    /// An actor run ended without succeeding.
    #[error("Actor run {run_id} finished with status {status}")]
    RunFailed { run_id: String, status: String },
    /// The report sink rejected the run's output.
    #[error("Failed to write report: {0}")]
    Output(String),
    /// Represents an error that occurs during an HTTP request.
    #[error("HTTP request failed: {0}")]
    RequestError(#[from] reqwest::Error),
    /// A JSON payload could not be encoded or decoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    /// A filesystem operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// The configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] ::config::ConfigError),
}

/// A type alias for `Result` with the `SleuthError` error type.
pub type Result<T> = std::result::Result<T, SleuthError>;

// Constants

/// The default time a single source collaborator may take.
pub const DEFAULT_SOURCE_TIMEOUT: Duration = Duration::from_secs(300);
/// The default number of sources fetched in parallel.
pub const DEFAULT_CONCURRENT_SOURCES: usize = 3;
/// The default maximum number of raw records read from one source.
pub const DEFAULT_MAX_ITEMS: usize = 100;
/// The default number of semantic matcher calls in flight.
pub const DEFAULT_MATCHER_CONCURRENCY: usize = 4;
/// The default timeout of one semantic matcher call.
pub const DEFAULT_MATCHER_TIMEOUT: Duration = Duration::from_secs(30);
