use news_pipeline::{
    AnomalyClassifier, AnomalyEscalator, Broker, BrokerLayout, Config, InMemoryBroker, Metrics,
    NewsPipeline, NewsPublisher, Subscriber, SubscriptionRegistry,
};
use std::sync::Arc;

/// Wires the publish/escalate/subscribe components against one broker, the
/// same way `main` does.
pub struct Fixture {
    pub broker: Arc<dyn Broker>,
    pub layout: BrokerLayout,
    pub metrics: Arc<Metrics>,
    pub pipeline: NewsPipeline,
    pub publisher: NewsPublisher,
    pub subscriber: Subscriber,
    pub registry: SubscriptionRegistry,
}

impl Fixture {
    pub fn new(broker: Arc<dyn Broker>, config: &Config) -> Self {
        let metrics = Arc::new(Metrics::new());
        let layout = BrokerLayout::from_config(config);
        let publisher = NewsPublisher::new(broker.clone(), layout.clone(), metrics.clone());
        let pipeline = NewsPipeline::new(
            AnomalyClassifier::from_config(config),
            publisher.clone(),
            AnomalyEscalator::new(broker.clone(), layout.clone(), metrics.clone()),
            metrics.clone(),
        );
        let subscriber = Subscriber::new(broker.clone(), layout.clone(), metrics.clone())
            .with_requeue_delay(config.requeue_delay());
        let registry = SubscriptionRegistry::new(subscriber.clone(), metrics.clone());

        Self {
            broker,
            layout,
            metrics,
            pipeline,
            publisher,
            subscriber,
            registry,
        }
    }

    /// Fixture over a fresh in-memory broker, returned alongside it for inspection.
    pub fn in_memory() -> (Self, InMemoryBroker) {
        let config = Config {
            requeue_delay_ms: 10,
            ..Config::default()
        };
        let broker = InMemoryBroker::with_prefetch(config.prefetch_count);
        let fixture = Self::new(Arc::new(broker.clone()), &config);
        (fixture, broker)
    }
}
