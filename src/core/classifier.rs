use std::collections::BTreeMap;

use crate::config::Config;

use super::types::{AnomalyKind, AnomalyRecord, FetchOutcome, NewsItem};

/// Content shorter than this (after trimming) is treated as a stalled workflow.
pub const MIN_CONTENT_CHARS: usize = 30;

/// Title keywords that point at an upstream failure being reported as news.
pub const FAILURE_KEYWORDS: [&str; 4] = ["error", "fail", "outage", "crash"];

/// Pure mapping from news items and fetch outcomes to anomaly records.
#[derive(Debug, Clone)]
pub struct AnomalyClassifier {
    workflow: String,
    monitor_workflow: String,
    empty_result_kind: AnomalyKind,
}

impl AnomalyClassifier {
    pub fn new(
        workflow: impl Into<String>,
        monitor_workflow: impl Into<String>,
        empty_result_kind: AnomalyKind,
    ) -> Self {
        Self {
            workflow: workflow.into(),
            monitor_workflow: monitor_workflow.into(),
            empty_result_kind,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            &config.workflow_name,
            &config.monitor_workflow_name,
            config.empty_result_anomaly,
        )
    }

    /// Rules are evaluated in order and the first match wins.
    pub fn classify_news_item(&self, item: &NewsItem) -> Option<AnomalyRecord> {
        let (kind, reason) = if item.content.trim().chars().count() < MIN_CONTENT_CHARS {
            (AnomalyKind::WorkflowDelay, "short or empty content".to_string())
        } else if let Some(keyword) = failure_keyword(&item.title) {
            (
                AnomalyKind::ApiFailure,
                format!("keyword '{keyword}' in title: {}", item.title),
            )
        } else if !starts_uppercase(&item.title) {
            (
                AnomalyKind::DataError,
                "title not properly formatted".to_string(),
            )
        } else {
            return None;
        };

        Some(self.record(&self.workflow, kind, reason, &item.topic, &item.timestamp))
    }

    /// `observed_at` is supplied by the caller so classification stays
    /// deterministic.
    pub fn classify_fetch_outcome(
        &self,
        topic: &str,
        outcome: &FetchOutcome,
        observed_at: &str,
    ) -> Option<AnomalyRecord> {
        let (kind, reason) = match outcome {
            FetchOutcome::Success(_) => return None,
            FetchOutcome::HttpError(status) => (
                AnomalyKind::ApiFailure,
                format!("news API returned HTTP {status}"),
            ),
            FetchOutcome::UnexpectedError => (
                AnomalyKind::ApiFailure,
                "unexpected error while fetching news".to_string(),
            ),
            FetchOutcome::EmptyResult => (
                self.empty_result_kind,
                "no articles returned".to_string(),
            ),
            FetchOutcome::Timeout => (
                AnomalyKind::ApiTimeout,
                "news API request timed out".to_string(),
            ),
        };

        Some(self.record(&self.monitor_workflow, kind, reason, topic, observed_at))
    }

    fn record(
        &self,
        workflow: &str,
        kind: AnomalyKind,
        reason: String,
        source: &str,
        timestamp: &str,
    ) -> AnomalyRecord {
        let mut details = BTreeMap::new();
        details.insert("reason".to_string(), reason);
        AnomalyRecord {
            workflow: workflow.to_string(),
            kind,
            details,
            source: Some(source.to_string()),
            timestamp: timestamp.to_string(),
        }
    }
}

fn failure_keyword(title: &str) -> Option<&'static str> {
    let lowered = title.to_lowercase();
    FAILURE_KEYWORDS
        .iter()
        .copied()
        .find(|keyword| lowered.contains(keyword))
}

// Unicode-aware: 'É' is uppercase, digits/CJK/punctuation are not.
fn starts_uppercase(title: &str) -> bool {
    title.chars().next().is_some_and(char::is_uppercase)
}
