use crate::helpers::{wait_until, Fixture, NewsBuilder, QueueAssertions};
use async_trait::async_trait;
use news_pipeline::core::types::NewsMessage;
use news_pipeline::{MessageHandler, PipelineError, Result, SubscriptionState};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct Recorder {
    received: Mutex<Vec<(String, NewsMessage)>>,
}

impl Recorder {
    fn len(&self) -> usize {
        self.received.lock().unwrap().len()
    }
}

#[async_trait]
impl MessageHandler for Recorder {
    async fn handle(&self, topic: &str, message: NewsMessage) -> Result<()> {
        self.received
            .lock()
            .unwrap()
            .push((topic.to_string(), message));
        Ok(())
    }
}

/// Fails the first `failures` deliveries, then records like `Recorder`
struct FlakyHandler {
    failures: AtomicUsize,
    inner: Recorder,
}

#[async_trait]
impl MessageHandler for FlakyHandler {
    async fn handle(&self, topic: &str, message: NewsMessage) -> Result<()> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(PipelineError::Handler("downstream unavailable".to_string()));
        }
        self.inner.handle(topic, message).await
    }
}

#[tokio::test]
async fn test_message_published_before_subscribe_is_delivered_once() {
    let (fixture, broker) = Fixture::in_memory();
    let item = NewsBuilder::clean("technology");

    fixture.pipeline.process_news_item(&item).await.unwrap();
    assert_eq!(broker.queue_depth("technology_queue"), Some(1));

    let recorder = Arc::new(Recorder::default());
    let id = fixture
        .registry
        .start("technology", recorder.clone())
        .await
        .unwrap();

    wait_until(Duration::from_secs(2), || recorder.len() == 1)
        .await
        .unwrap();
    // Give a duplicate delivery the chance to show up
    tokio::time::sleep(Duration::from_millis(50)).await;

    let status = fixture.registry.stop(id).await.unwrap();
    assert_eq!(status.state, SubscriptionState::Cancelled);

    let received = recorder.received.lock().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].0, "technology");
    assert_eq!(received[0].1, item.to_message());
    assert_eq!(broker.queue_depth("technology_queue"), Some(0));
}

#[tokio::test]
async fn test_topics_are_isolated() {
    let (fixture, broker) = Fixture::in_memory();

    let sports = Arc::new(Recorder::default());
    let sports_id = fixture
        .registry
        .start("sports", sports.clone())
        .await
        .unwrap();
    fixture
        .registry
        .wait_for(sports_id, |s| s == SubscriptionState::Consuming)
        .await;

    fixture
        .pipeline
        .process_news_item(&NewsBuilder::clean("business"))
        .await
        .unwrap();
    fixture
        .pipeline
        .process_news_item(&NewsBuilder::clean("sports"))
        .await
        .unwrap();

    wait_until(Duration::from_secs(2), || sports.len() == 1)
        .await
        .unwrap();
    fixture.registry.stop_all().await;

    assert_eq!(sports.len(), 1);
    assert_eq!(broker.queue_depth("business_queue"), Some(1));
    let business = QueueAssertions::decode_news(&broker.drain("business_queue")).unwrap();
    assert_eq!(business.len(), 1);
}

#[tokio::test]
async fn test_failed_handler_gets_message_again() {
    let (fixture, broker) = Fixture::in_memory();
    let item = NewsBuilder::clean("sports");
    fixture
        .publisher
        .publish("sports", &item.to_message())
        .await
        .unwrap();

    let flaky = Arc::new(FlakyHandler {
        failures: AtomicUsize::new(1),
        inner: Recorder::default(),
    });
    let id = fixture.registry.start("sports", flaky.clone()).await.unwrap();

    // Same subscription, no restart needed
    wait_until(Duration::from_secs(2), || flaky.inner.len() == 1)
        .await
        .unwrap();
    assert_eq!(
        fixture.registry.status(id).await.unwrap().state,
        SubscriptionState::Consuming
    );
    assert_eq!(flaky.inner.received.lock().unwrap()[0].1, item.to_message());

    fixture.registry.stop(id).await.unwrap();
    assert_eq!(broker.queue_depth("sports_queue"), Some(0));
}

#[tokio::test]
async fn test_failures_beyond_prefetch_do_not_stall_subscription() {
    let (fixture, broker) = Fixture::in_memory();
    let prefetch = usize::from(news_pipeline::Config::default().prefetch_count);

    let first = NewsBuilder::new().topic("sports").title("Cup Final Delayed").build();
    fixture
        .publisher
        .publish("sports", &first.to_message())
        .await
        .unwrap();
    for _ in 0..3 {
        fixture
            .publisher
            .publish("sports", &NewsBuilder::clean("sports").to_message())
            .await
            .unwrap();
    }

    let flaky = Arc::new(FlakyHandler {
        failures: AtomicUsize::new(prefetch + 2),
        inner: Recorder::default(),
    });
    let id = fixture.registry.start("sports", flaky.clone()).await.unwrap();

    wait_until(Duration::from_secs(5), || flaky.inner.len() == 4)
        .await
        .unwrap();
    assert_eq!(
        fixture.registry.status(id).await.unwrap().state,
        SubscriptionState::Consuming
    );

    // The failed message came back first, then the rest in order
    assert_eq!(flaky.inner.received.lock().unwrap()[0].1, first.to_message());
    assert_eq!(
        fixture.metrics.get_snapshot().await.total_handler_failures,
        (prefetch + 2) as u64
    );

    fixture.registry.stop(id).await.unwrap();
    assert_eq!(broker.queue_depth("sports_queue"), Some(0));
}

#[tokio::test]
async fn test_broker_restart_marks_subscription_lost() {
    let (fixture, broker) = Fixture::in_memory();
    let id = fixture
        .registry
        .start("sports", Arc::new(Recorder::default()))
        .await
        .unwrap();
    fixture
        .registry
        .wait_for(id, |s| s == SubscriptionState::Consuming)
        .await;

    broker.drop_connections();

    assert_eq!(
        fixture.registry.wait_for(id, |s| s.is_terminal()).await,
        Some(SubscriptionState::ConnectionLost)
    );
    // No reconnect: a new publish stays queued
    fixture
        .publisher
        .publish("sports", &NewsBuilder::clean("sports").to_message())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(broker.queue_depth("sports_queue"), Some(1));
}

#[tokio::test]
async fn test_topology_declaration_is_idempotent() {
    let (fixture, broker) = Fixture::in_memory();
    let topology = fixture
        .layout
        .topics_topology(["business", "technology", "sports", "entertainment"]);

    fixture.broker.ensure(&topology).await.unwrap();
    let queues = broker.queue_names();
    let bindings = broker.bindings("news_exchange");

    for _ in 0..3 {
        fixture.broker.ensure(&topology).await.unwrap();
    }
    assert_eq!(broker.queue_names(), queues);
    assert_eq!(broker.bindings("news_exchange"), bindings);
    assert_eq!(bindings.len(), 4);
}
