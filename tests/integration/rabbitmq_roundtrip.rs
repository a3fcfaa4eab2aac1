use crate::helpers::{wait_until, Fixture, NewsBuilder, QueueAssertions, TestHarness};
use async_trait::async_trait;
use news_pipeline::core::types::{AnomalyKind, NewsMessage};
use news_pipeline::{Config, MessageHandler, PipelineError, Result, SubscriptionState};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct Recorder {
    received: Mutex<Vec<NewsMessage>>,
}

#[async_trait]
impl MessageHandler for Recorder {
    async fn handle(&self, _topic: &str, message: NewsMessage) -> Result<()> {
        self.received.lock().unwrap().push(message);
        Ok(())
    }
}

#[tokio::test]
#[ignore] // Run with --ignored flag since it requires containers
async fn test_publish_then_subscribe_roundtrip() {
    let harness = TestHarness::new().await.unwrap();
    let fixture = Fixture::new(Arc::new(harness.broker()), &harness.default_config());

    let item = NewsBuilder::clean("technology");
    let report = fixture.pipeline.process_news_item(&item).await.unwrap();
    assert_eq!(report.anomaly, None);
    assert_eq!(harness.message_count("technology_queue").await.unwrap(), 1);

    let recorder = Arc::new(Recorder::default());
    let id = fixture
        .registry
        .start("technology", recorder.clone())
        .await
        .unwrap();

    wait_until(Duration::from_secs(10), || {
        recorder.received.lock().unwrap().len() == 1
    })
    .await
    .expect("message should be delivered within 10 seconds");

    let status = fixture.registry.stop(id).await.unwrap();
    assert_eq!(status.state, SubscriptionState::Cancelled);
    assert_eq!(recorder.received.lock().unwrap()[0], item.to_message());
    assert_eq!(harness.message_count("technology_queue").await.unwrap(), 0);
}

/// Fails every delivery until `failures` runs out
struct FailingFor {
    failures: AtomicUsize,
    recorder: Recorder,
}

#[async_trait]
impl MessageHandler for FailingFor {
    async fn handle(&self, topic: &str, message: NewsMessage) -> Result<()> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(PipelineError::Handler("not yet".to_string()));
        }
        self.recorder.handle(topic, message).await
    }
}

#[tokio::test]
#[ignore] // Run with --ignored flag since it requires containers
async fn test_failed_delivery_is_requeued_while_consuming() {
    let harness = TestHarness::new().await.unwrap();
    let config = Config {
        prefetch_count: 2,
        requeue_delay_ms: 20,
        ..harness.default_config()
    };
    let fixture = Fixture::new(Arc::new(harness.broker_for(&config)), &config);

    let item = NewsBuilder::clean("business");
    fixture.pipeline.process_news_item(&item).await.unwrap();

    // More failures than the prefetch window
    let handler = Arc::new(FailingFor {
        failures: AtomicUsize::new(5),
        recorder: Recorder::default(),
    });
    let id = fixture
        .registry
        .start("business", handler.clone())
        .await
        .unwrap();

    wait_until(Duration::from_secs(10), || {
        handler.recorder.received.lock().unwrap().len() == 1
    })
    .await
    .expect("requeued message should come back to the same subscription");
    assert_eq!(
        fixture.registry.status(id).await.unwrap().state,
        SubscriptionState::Consuming
    );

    fixture.registry.stop(id).await.unwrap();
    assert_eq!(harness.message_count("business_queue").await.unwrap(), 0);
}

#[tokio::test]
#[ignore] // Run with --ignored flag since it requires containers
async fn test_anomaly_reaches_remediation_queue() {
    let harness = TestHarness::new().await.unwrap();
    let fixture = Fixture::new(Arc::new(harness.broker()), &harness.default_config());

    let report = fixture
        .pipeline
        .process_news_item(&NewsBuilder::failure_title("technology"))
        .await
        .unwrap();
    assert_eq!(report.anomaly, Some(AnomalyKind::ApiFailure));

    let records =
        QueueAssertions::decode_anomalies(&harness.drain("anomalies_queue").await.unwrap())
            .unwrap();
    QueueAssertions::assert_single_anomaly(&records, AnomalyKind::ApiFailure, "technology")
        .unwrap();
}

#[tokio::test]
#[ignore] // Run with --ignored flag since it requires containers
async fn test_topology_declaration_is_idempotent() {
    let harness = TestHarness::new().await.unwrap();
    let fixture = Fixture::new(Arc::new(harness.broker()), &harness.default_config());
    let topology = fixture.layout.topics_topology(["business", "sports"]);

    for _ in 0..3 {
        fixture.broker.ensure(&topology).await.unwrap();
    }
    fixture.broker.ensure(&fixture.layout.anomaly_topology()).await.unwrap();

    // Declaring again leaves queued messages alone
    fixture
        .publisher
        .publish("sports", &NewsBuilder::clean("sports").to_message())
        .await
        .unwrap();
    fixture.broker.ensure(&topology).await.unwrap();
    assert_eq!(harness.message_count("sports_queue").await.unwrap(), 1);
    assert_eq!(harness.message_count("business_queue").await.unwrap(), 0);

    harness.purge("sports_queue").await.unwrap();
    assert_eq!(harness.message_count("sports_queue").await.unwrap(), 0);
}
