use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::config::Config;
use crate::core::types::FetchOutcome;
use crate::error::{PipelineError, Result};

#[derive(Debug, Error)]
pub enum FetchError {
    /// `message` is the API's own explanation, or the status reason when the
    /// body carries none.
    #[error("news API returned HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("news API request timed out")]
    Timeout,

    #[error("news API request failed: {0}")]
    Request(String),
}

impl FetchError {
    /// Text suitable for an API caller.
    pub fn upstream_message(&self) -> String {
        match self {
            FetchError::Status { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    pub fn outcome(&self) -> FetchOutcome {
        match self {
            FetchError::Status { status, .. } => FetchOutcome::HttpError(*status),
            FetchError::Timeout => FetchOutcome::Timeout,
            FetchError::Request(_) => FetchOutcome::UnexpectedError,
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout
        } else {
            FetchError::Request(err.to_string())
        }
    }
}

impl From<FetchError> for PipelineError {
    fn from(err: FetchError) -> Self {
        PipelineError::UpstreamFetchFailed(err.to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Article {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TopHeadlines {
    #[serde(default)]
    articles: Option<Vec<Article>>,
}

// {"status": "error", "code": "apiKeyInvalid", "message": "..."}
#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: Option<String>,
}

pub type FetchResult = std::result::Result<Vec<Article>, FetchError>;

/// Maps a fetch result onto the outcome the classifier understands.
pub fn outcome_of(result: &FetchResult) -> FetchOutcome {
    match result {
        Ok(articles) if articles.is_empty() => FetchOutcome::EmptyResult,
        Ok(articles) => FetchOutcome::Success(articles.len()),
        Err(e) => e.outcome(),
    }
}

#[async_trait]
pub trait NewsSource: Send + Sync {
    async fn top_headlines(&self, topic: &str) -> FetchResult;
}

/// Client for the NewsAPI `top-headlines` endpoint.
pub struct NewsApiClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    country: String,
}

impl NewsApiClient {
    pub fn new(base_url: &str, api_key: &str, country: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            country: country.to_string(),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(
            &config.news_api_url,
            &config.news_api_key,
            &config.news_country,
            Duration::from_secs(config.fetch_timeout_secs),
        )
    }
}

#[async_trait]
impl NewsSource for NewsApiClient {
    async fn top_headlines(&self, topic: &str) -> FetchResult {
        let endpoint = format!("{}/top-headlines", self.base_url);
        debug!("Fetching top headlines for '{}'", topic);

        let resp = self
            .client
            .get(&endpoint)
            .query(&[
                ("category", topic),
                ("apiKey", self.api_key.as_str()),
                ("country", self.country.as_str()),
            ])
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp
                .json::<ApiErrorBody>()
                .await
                .ok()
                .and_then(|body| body.message)
                .unwrap_or_else(|| {
                    status
                        .canonical_reason()
                        .unwrap_or("unknown error")
                        .to_string()
                });
            return Err(FetchError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let body: TopHeadlines = resp.json().await?;
        Ok(body.articles.unwrap_or_default())
    }
}
