use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::core::classifier::AnomalyClassifier;
use crate::core::types::{now_iso8601, AnomalyKind, AnomalyRecord, FetchOutcome, NewsItem};
use crate::error::Result;
use crate::monitoring::metrics::Metrics;
use crate::publisher::{AnomalyEscalator, NewsPublisher};

/// Outcome of processing one news item
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishReport {
    pub topic: String,
    pub anomaly: Option<AnomalyKind>,
}

/// Classify, publish and escalate. The normal publish and the escalation are
/// independent: a failed escalation never fails the item, and a failed
/// publish still escalates whatever anomaly was detected.
#[derive(Clone)]
pub struct NewsPipeline {
    classifier: AnomalyClassifier,
    publisher: NewsPublisher,
    escalator: AnomalyEscalator,
    metrics: Arc<Metrics>,
}

impl NewsPipeline {
    pub fn new(
        classifier: AnomalyClassifier,
        publisher: NewsPublisher,
        escalator: AnomalyEscalator,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            classifier,
            publisher,
            escalator,
            metrics,
        }
    }

    pub fn classifier(&self) -> &AnomalyClassifier {
        &self.classifier
    }

    pub async fn process_news_item(&self, item: &NewsItem) -> Result<PublishReport> {
        let anomaly = self.classifier.classify_news_item(item);
        if let Some(record) = &anomaly {
            self.metrics.record_anomaly_detected(record.kind);
            debug!(
                "Detected {} for '{}' on topic '{}'",
                record.kind, item.title, item.topic
            );
        }

        let published = self.publisher.publish(&item.topic, &item.to_message()).await;

        if let Some(record) = &anomaly {
            self.escalate_logged(record).await;
        }

        published?;
        Ok(PublishReport {
            topic: item.topic.clone(),
            anomaly: anomaly.map(|record| record.kind),
        })
    }

    /// Escalates the anomaly implied by a fetch outcome, if any, and returns
    /// its kind.
    pub async fn process_fetch_outcome(
        &self,
        topic: &str,
        outcome: &FetchOutcome,
    ) -> Option<AnomalyKind> {
        self.metrics.record_fetch_outcome(outcome.label());

        let record = self
            .classifier
            .classify_fetch_outcome(topic, outcome, &now_iso8601())?;
        self.metrics.record_anomaly_detected(record.kind);
        warn!(
            "Fetch for topic '{}' produced {}: {}",
            topic,
            record.kind,
            record.reason().unwrap_or("-")
        );

        self.escalate_logged(&record).await;
        Some(record.kind)
    }

    async fn escalate_logged(&self, record: &AnomalyRecord) {
        if let Err(e) = self.escalator.escalate(record).await {
            error!(
                "Escalation of {} from '{}' failed: {}",
                record.kind,
                record.source.as_deref().unwrap_or("-"),
                e
            );
        }
    }
}
