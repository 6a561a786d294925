use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::config::MatcherConfig;
use crate::prompt::{PromptBuilder, MATCH_INSTRUCTIONS, SUMMARY_INSTRUCTIONS};
use crate::summary::Summarizer;
use crate::types::Listing;
use crate::{Result, SleuthError};

/// The verdict of the language model on one listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Judgement {
    #[serde(rename = "match")]
    pub is_match: bool,
    #[serde(default)]
    pub confidence: f32,
    #[serde(default)]
    pub explanation: String,
}

/// A language model able to judge a listing against free-text preferences.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn judge(&self, listing: &str, preferences: &str) -> Result<Judgement>;
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// The `LLMProcessor` struct sends match and summary prompts to an
/// OpenAI-compatible chat-completions endpoint.
pub struct LLMProcessor {
    /// The HTTP client used for making requests.
    client: Client,
    /// The configuration settings for the LLM.
    config: MatcherConfig,
    api_key: String,
}

impl LLMProcessor {
    /// Creates a new `LLMProcessor` with the given configuration.
    ///
    /// # Arguments
    ///
    /// * `config` - The configuration settings for the LLM.
    ///
    /// # Returns
    ///
    /// The processor, or `MatcherUnavailable` if no API key is configured.
    pub fn new(config: MatcherConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| SleuthError::MatcherUnavailable("no API key configured".to_string()))?;

        let client = Client::builder().timeout(config.timeout()).gzip(true).build()?;

        Ok(Self {
            client,
            config,
            api_key,
        })
    }

    /// Sends `prompt` as the user message under the `instructions` system
    /// message and returns the model's reply.
    #[instrument(skip(self, instructions, prompt), fields(model = %self.config.model))]
    pub async fn process(&self, instructions: &str, prompt: &str) -> Result<String> {
        let request = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: instructions,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };

        let response = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SleuthError::MatcherUnavailable(format!(
                "LLM endpoint returned {}: {}",
                status, body
            )));
        }

        let reply: ChatResponse = response.json().await?;
        debug!(choices = reply.choices.len(), "Received LLM reply");

        reply
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| SleuthError::MatcherUnavailable("LLM reply had no content".to_string()))
    }
}

#[async_trait]
impl LlmClient for LLMProcessor {
    async fn judge(&self, listing: &str, preferences: &str) -> Result<Judgement> {
        let prompt = PromptBuilder::new(preferences).with_listing(listing).build();
        let reply = self.process(MATCH_INSTRUCTIONS, &prompt).await?;
        parse_judgement(&reply)
    }
}

#[async_trait]
impl Summarizer for LLMProcessor {
    async fn summarize(&self, listing: &Listing) -> Result<String> {
        let reply = self
            .process(SUMMARY_INSTRUCTIONS, &PromptBuilder::summary_request(listing))
            .await?;
        let summary = reply.split_whitespace().collect::<Vec<_>>().join(" ");
        if summary.is_empty() {
            return Err(SleuthError::MatcherUnavailable("LLM summary was empty".to_string()));
        }
        Ok(summary)
    }
}

/// Reads a judgement from a model reply, tolerating prose or code fences around the JSON object.
pub fn parse_judgement(reply: &str) -> Result<Judgement> {
    let start = reply.find('{');
    let end = reply.rfind('}');
    let body = match (start, end) {
        (Some(start), Some(end)) if start < end => &reply[start..=end],
        _ => {
            return Err(SleuthError::MatcherUnavailable(format!(
                "LLM reply is not a JSON object: {}",
                reply.trim()
            )))
        }
    };

    let mut judgement: Judgement = serde_json::from_str(body)?;
    judgement.confidence = if judgement.confidence.is_finite() {
        judgement.confidence.clamp(0.0, 1.0)
    } else {
        0.0
    };
    Ok(judgement)
}
