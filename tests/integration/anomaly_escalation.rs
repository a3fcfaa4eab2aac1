use crate::helpers::{Fixture, NewsBuilder, QueueAssertions, DEFAULT_TIMESTAMP};
use async_trait::async_trait;
use news_pipeline::core::types::{AnomalyKind, FetchOutcome};
use news_pipeline::fetcher::{Article, FetchError, FetchResult};
use news_pipeline::{Config, InMemoryBroker, NewsMonitor, NewsSource, PipelineError};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_clean_technology_story() {
    let (fixture, broker) = Fixture::in_memory();
    let item = NewsBuilder::new()
        .topic("technology")
        .title("Stocks Rise Today")
        .content("Markets closed higher amid strong earnings reports across tech sector.")
        .build();

    let report = fixture.pipeline.process_news_item(&item).await.unwrap();

    assert_eq!(report.topic, "technology");
    assert_eq!(report.anomaly, None);
    assert_eq!(broker.queue_depth("technology_queue"), Some(1));
    assert_eq!(broker.queue_depth("anomalies_queue").unwrap_or(0), 0);
}

#[tokio::test]
async fn test_outage_headline_with_short_content_is_workflow_delay() {
    let (fixture, broker) = Fixture::in_memory();
    // 20 characters of content: the length rule is checked first
    let item = NewsBuilder::new()
        .topic("technology")
        .title("Server Outage Hits Datacenter")
        .content("Full report pending.")
        .build();

    let report = fixture.pipeline.process_news_item(&item).await.unwrap();
    assert_eq!(report.anomaly, Some(AnomalyKind::WorkflowDelay));

    let records = QueueAssertions::decode_anomalies(&broker.drain("anomalies_queue")).unwrap();
    QueueAssertions::assert_single_anomaly(&records, AnomalyKind::WorkflowDelay, "technology")
        .unwrap();
}

#[tokio::test]
async fn test_outage_headline_is_api_failure() {
    let (fixture, broker) = Fixture::in_memory();
    let item = NewsBuilder::new()
        .topic("technology")
        .title("Server Outage Hits Datacenter")
        .content("Full report pending while engineers restore service.")
        .build();

    let report = fixture.pipeline.process_news_item(&item).await.unwrap();
    assert_eq!(report.anomaly, Some(AnomalyKind::ApiFailure));
    // The news item itself is still published
    assert_eq!(broker.queue_depth("technology_queue"), Some(1));

    let records = QueueAssertions::decode_anomalies(&broker.drain("anomalies_queue")).unwrap();
    QueueAssertions::assert_single_anomaly(&records, AnomalyKind::ApiFailure, "technology")
        .unwrap();
    let reason = records[0].reason().unwrap();
    assert!(reason.to_lowercase().contains("outage"), "reason: {reason}");
    assert_eq!(records[0].workflow, "news_pipeline");
    assert_eq!(records[0].timestamp, DEFAULT_TIMESTAMP);
}

#[tokio::test]
async fn test_empty_content_is_workflow_delay_with_item_timestamp() {
    let (fixture, broker) = Fixture::in_memory();

    let report = fixture
        .pipeline
        .process_news_item(&NewsBuilder::short_content("business"))
        .await
        .unwrap();
    assert_eq!(report.anomaly, Some(AnomalyKind::WorkflowDelay));

    let late = NewsBuilder::new()
        .topic("business")
        .content("   ")
        .timestamp("2025-01-02T03:04:05Z")
        .build();
    fixture.pipeline.process_news_item(&late).await.unwrap();

    let records = QueueAssertions::decode_anomalies(&broker.drain("anomalies_queue")).unwrap();
    assert_eq!(records.len(), 2);
    assert!(records
        .iter()
        .all(|r| r.kind == AnomalyKind::WorkflowDelay));
    assert_eq!(records[0].timestamp, DEFAULT_TIMESTAMP);
    assert_eq!(records[1].timestamp, "2025-01-02T03:04:05Z");
}

#[tokio::test]
async fn test_lowercase_sports_title_is_data_error() {
    let (fixture, broker) = Fixture::in_memory();
    let item = NewsBuilder::new()
        .topic("sports")
        .title("lowkey win")
        .content("Team won 3-1 in a close match last night at the stadium.")
        .build();

    let report = fixture.pipeline.process_news_item(&item).await.unwrap();
    assert_eq!(report.anomaly, Some(AnomalyKind::DataError));

    let records = QueueAssertions::decode_anomalies(&broker.drain("anomalies_queue")).unwrap();
    QueueAssertions::assert_single_anomaly(&records, AnomalyKind::DataError, "sports").unwrap();
}

#[tokio::test]
async fn test_escalation_failure_is_isolated_from_publish() {
    let (fixture, broker) = Fixture::in_memory();
    broker.fail_publishes_to("anomalies_queue");

    let report = fixture
        .pipeline
        .process_news_item(&NewsBuilder::lowercase_title("sports"))
        .await
        .unwrap();

    assert_eq!(report.anomaly, Some(AnomalyKind::DataError));
    assert_eq!(broker.queue_depth("sports_queue"), Some(1));
    assert_eq!(fixture.metrics.get_snapshot().await.total_escalation_failures, 1);
}

#[tokio::test]
async fn test_broker_down_fails_publish() {
    let (fixture, broker) = Fixture::in_memory();
    broker.set_available(false);

    let result = fixture
        .pipeline
        .process_news_item(&NewsBuilder::clean("sports"))
        .await;
    assert!(matches!(result, Err(PipelineError::PublishFailed { .. })));
}

#[tokio::test]
async fn test_http_error_fetch_escalates_api_failure() {
    let (fixture, broker) = Fixture::in_memory();

    let kind = fixture
        .pipeline
        .process_fetch_outcome("business", &FetchOutcome::HttpError(503))
        .await;
    assert_eq!(kind, Some(AnomalyKind::ApiFailure));

    let records = QueueAssertions::decode_anomalies(&broker.drain("anomalies_queue")).unwrap();
    QueueAssertions::assert_single_anomaly(&records, AnomalyKind::ApiFailure, "business").unwrap();
    assert_eq!(records[0].workflow, "news_monitor");
}

#[tokio::test]
async fn test_empty_result_kind_follows_config() {
    let broker = InMemoryBroker::new();
    let config = Config {
        empty_result_anomaly: AnomalyKind::DataError,
        ..Config::default()
    };
    let fixture = Fixture::new(Arc::new(broker.clone()), &config);

    let kind = fixture
        .pipeline
        .process_fetch_outcome("technology", &FetchOutcome::EmptyResult)
        .await;
    assert_eq!(kind, Some(AnomalyKind::DataError));
}

struct OutageSource;

#[async_trait]
impl NewsSource for OutageSource {
    async fn top_headlines(&self, topic: &str) -> FetchResult {
        match topic {
            "business" => Err(FetchError::Status {
                status: 503,
                message: "Service Unavailable".to_string(),
            }),
            _ => Ok(vec![Article {
                title: Some("Markets Open Flat".to_string()),
                ..Default::default()
            }]),
        }
    }
}

#[tokio::test]
async fn test_monitor_escalates_failing_topic() {
    let (fixture, broker) = Fixture::in_memory();
    let monitor = NewsMonitor::new(
        Arc::new(OutageSource),
        fixture.pipeline.clone(),
        vec!["business".to_string(), "technology".to_string()],
        Duration::from_secs(60),
        Duration::from_millis(1),
    );

    let summary = monitor.run_cycle(&CancellationToken::new()).await;
    assert_eq!(summary.topics_checked, 2);
    assert_eq!(
        summary.anomalies,
        vec![("business".to_string(), AnomalyKind::ApiFailure)]
    );

    let records = QueueAssertions::decode_anomalies(&broker.drain("anomalies_queue")).unwrap();
    QueueAssertions::assert_single_anomaly(&records, AnomalyKind::ApiFailure, "business").unwrap();
}
