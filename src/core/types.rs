use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Current time as an ISO-8601 / RFC 3339 string
pub fn now_iso8601() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// A news item handed to the pipeline by the HTTP layer or a poller.
///
/// The topic doubles as the routing key and is not part of the wire payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewsItem {
    pub topic: String,
    pub title: String,
    pub content: String,
    pub timestamp: String,
}

impl NewsItem {
    pub fn new(
        topic: impl Into<String>,
        title: impl Into<String>,
        content: impl Into<String>,
        timestamp: impl Into<String>,
    ) -> Self {
        Self {
            topic: topic.into(),
            title: title.into(),
            content: content.into(),
            timestamp: timestamp.into(),
        }
    }

    pub fn to_message(&self) -> NewsMessage {
        NewsMessage {
            title: self.title.clone(),
            content: self.content.clone(),
            timestamp: self.timestamp.clone(),
        }
    }
}

/// Wire shape of a news item on a topic queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewsMessage {
    pub title: String,
    pub content: String,
    pub timestamp: String,
}

/// Closed set of anomaly kinds understood by the healer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    WorkflowDelay,
    ApiFailure,
    DataError,
    EmptyArticles,
    ApiTimeout,
}

impl AnomalyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyKind::WorkflowDelay => "workflow_delay",
            AnomalyKind::ApiFailure => "api_failure",
            AnomalyKind::DataError => "data_error",
            AnomalyKind::EmptyArticles => "empty_articles",
            AnomalyKind::ApiTimeout => "api_timeout",
        }
    }
}

impl fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record delivered to the remediation queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnomalyRecord {
    pub workflow: String,
    #[serde(rename = "anomaly")]
    pub kind: AnomalyKind,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub timestamp: String,
}

impl AnomalyRecord {
    pub fn reason(&self) -> Option<&str> {
        self.details.get("reason").map(String::as_str)
    }
}

/// Result of one upstream news fetch, as seen by the classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Success(usize),
    HttpError(u16),
    EmptyResult,
    Timeout,
    UnexpectedError,
}

impl FetchOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            FetchOutcome::Success(_) => "success",
            FetchOutcome::HttpError(_) => "http_error",
            FetchOutcome::EmptyResult => "empty_result",
            FetchOutcome::Timeout => "timeout",
            FetchOutcome::UnexpectedError => "unexpected_error",
        }
    }
}

/// Health status for the whole service
#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub healthy: bool,
    pub broker: String,
    pub broker_reachable: bool,
    pub active_subscriptions: usize,
    pub uptime_seconds: u64,
    pub last_check: chrono::DateTime<Utc>,
}
