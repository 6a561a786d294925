use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::types::SearchInput;
use crate::Result;

/// File consulted when no configuration path is given.
pub const DEFAULT_CONFIG_FILE: &str = "sleuth.toml";
/// Prefix of environment variables overriding configuration keys, e.g. `SLEUTH__MATCHER__MODEL`.
pub const ENV_PREFIX: &str = "SLEUTH";

/// The `SleuthConfig` struct holds the configuration settings for a search run.
/// It includes settings for the source collaborators, the semantic matcher, state
/// storage and the report output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SleuthConfig {
    /// The number of sources fetched concurrently.
    pub concurrent_sources: usize,
    /// Seconds a single source may take before it is recorded as unavailable.
    pub source_timeout_secs: u64,
    /// The maximum number of raw records read from one source.
    pub max_items: usize,
    /// Seconds after which the whole run is cancelled. `None` means no deadline.
    pub run_deadline_secs: Option<u64>,
    /// Directory holding the change tracking state.
    pub state_dir: PathBuf,
    /// JSON-lines file the report is appended to.
    pub report_path: PathBuf,
    /// The configuration settings for the Apify platform.
    pub apify: ApifyConfig,
    /// The configuration settings for the semantic matcher.
    pub matcher: MatcherConfig,
}

/// The `ApifyConfig` struct holds the settings of the actor platform that runs the platform scrapers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApifyConfig {
    /// Base URL of the Apify REST API.
    pub base_url: String,
    /// API token. Without one, sources fall back to generated mock listings.
    pub token: Option<String>,
    /// Id of the current actor run, used for usage metering.
    pub run_id: Option<String>,
    /// Dataset receiving report records when running on the platform.
    pub dataset_id: Option<String>,
    pub zillow_actor: String,
    pub realtor_actor: String,
    pub apartments_actor: String,
    /// Seconds the platform waits for a run to finish per polling request.
    pub wait_secs: u64,
}

/// What the matcher does with a listing when the LLM call fails or times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailPolicy {
    /// Keep the listing.
    #[default]
    FailOpen,
    /// Drop the listing.
    FailClosed,
}

/// The `MatcherConfig` struct holds the configuration settings for the Language Model (LLM).
/// It includes the endpoint URL, credentials, sampling settings and call limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    /// The chat-completions endpoint of an OpenAI-compatible API.
    pub endpoint: String,
    /// API key. The matcher is disabled when none is configured.
    pub api_key: Option<String>,
    pub model: String,
    /// The temperature setting for the LLM, controlling the randomness of the output.
    pub temperature: f32,
    /// The maximum number of tokens allowed in the LLM response.
    pub max_tokens: u32,
    /// The number of match calls in flight at once.
    pub concurrency: usize,
    /// Seconds a single match call may take.
    pub timeout_secs: u64,
    pub fail_policy: FailPolicy,
}

impl Default for SleuthConfig {
    /// Provides default values for the `SleuthConfig` struct.
    ///
    /// # Returns
    ///
    /// A `SleuthConfig` instance with default settings.
    fn default() -> Self {
        Self {
            concurrent_sources: crate::DEFAULT_CONCURRENT_SOURCES,
            source_timeout_secs: crate::DEFAULT_SOURCE_TIMEOUT.as_secs(),
            max_items: crate::DEFAULT_MAX_ITEMS,
            run_deadline_secs: None,
            state_dir: PathBuf::from("storage/key_value_stores/sleuth"),
            report_path: PathBuf::from("storage/datasets/default/results.jsonl"),
            apify: ApifyConfig::default(),
            matcher: MatcherConfig::default(),
        }
    }
}

impl Default for ApifyConfig {
    fn default() -> Self {
        Self {
            base_url: String::from("https://api.apify.com/v2"),
            token: None,
            run_id: None,
            dataset_id: None,
            zillow_actor: String::from("maxcopell/zillow-detail-scraper"),
            realtor_actor: String::from("epctex/realtor-scraper"),
            apartments_actor: String::from("epctex/apartments-scraper"),
            wait_secs: 60,
        }
    }
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            endpoint: String::from("https://api.openai.com/v1/chat/completions"),
            api_key: None,
            model: String::from("gpt-3.5-turbo"),
            temperature: 0.0,
            max_tokens: 256,
            concurrency: crate::DEFAULT_MATCHER_CONCURRENCY,
            timeout_secs: crate::DEFAULT_MATCHER_TIMEOUT.as_secs(),
            fail_policy: FailPolicy::FailOpen,
        }
    }
}

impl SleuthConfig {
    /// Loads the configuration.
    ///
    /// Defaults are overlaid with the given file (or `sleuth.toml` if it
    /// exists), then with `SLEUTH__*` environment variables. The platform
    /// secrets are finally taken from `APIFY_TOKEN`, `ACTOR_RUN_ID`,
    /// `ACTOR_DEFAULT_DATASET_ID` and `OPENAI_API_KEY` when not set otherwise.
    ///
    /// # Arguments
    ///
    /// * `path` - An optional configuration file; it must exist when given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let mut loaded: SleuthConfig = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;

        loaded.apply_env_fallbacks(|key| std::env::var(key).ok());
        Ok(loaded)
    }

    fn apply_env_fallbacks(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if self.apify.token.is_none() {
            self.apify.token = lookup("APIFY_TOKEN");
        }
        if self.apify.run_id.is_none() {
            self.apify.run_id = lookup("ACTOR_RUN_ID");
        }
        if self.apify.dataset_id.is_none() {
            self.apify.dataset_id = lookup("ACTOR_DEFAULT_DATASET_ID");
        }
        if self.matcher.api_key.is_none() {
            self.matcher.api_key = lookup("OPENAI_API_KEY");
        }
    }

    /// Applies the per-run settings carried by the search input. An input
    /// LLM token takes precedence over any configured key.
    pub fn apply_input(&mut self, input: &SearchInput) {
        if let Some(token) = input.llm_token() {
            self.matcher.api_key = Some(token.to_string());
        }
    }

    pub fn source_timeout(&self) -> Duration {
        Duration::from_secs(self.source_timeout_secs)
    }

    pub fn run_deadline(&self) -> Option<Duration> {
        self.run_deadline_secs.map(Duration::from_secs)
    }
}

impl MatcherConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}
