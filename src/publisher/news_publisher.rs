use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::{
    broker::Broker,
    core::topology::BrokerLayout,
    error::{PipelineError, Result},
    monitoring::metrics::Metrics,
};

/// Publishes messages to the news exchange, routed by topic.
///
/// Each call opens its own channel, declares the topic's exchange, queue and
/// binding, submits one persistent message and closes the channel again. A
/// failure is reported once and never retried here.
#[derive(Clone)]
pub struct NewsPublisher {
    broker: Arc<dyn Broker>,
    layout: BrokerLayout,
    metrics: Arc<Metrics>,
}

impl NewsPublisher {
    pub fn new(broker: Arc<dyn Broker>, layout: BrokerLayout, metrics: Arc<Metrics>) -> Self {
        Self {
            broker,
            layout,
            metrics,
        }
    }

    pub async fn publish<T>(&self, topic: &str, message: &T) -> Result<()>
    where
        T: Serialize + Sync + ?Sized,
    {
        self.layout.validate_topic(topic)?;

        let start_time = std::time::Instant::now();
        let payload = serde_json::to_vec(message)?;
        let topology = self.layout.topic_topology(topic);

        let mut channel = self
            .broker
            .ensure_publisher(&topology)
            .await
            .map_err(|e| {
                self.metrics.record_publish_failure();
                PipelineError::publish_failed(e)
            })?;

        let result = channel
            .publish(self.layout.exchange_name(), topic, &payload)
            .await;
        channel.close().await;

        match result {
            Ok(()) => {
                self.metrics.record_news_published();
                self.metrics.record_publish_duration(start_time.elapsed());
                debug!(
                    "Published {} bytes to exchange '{}' with routing key '{}'",
                    payload.len(),
                    self.layout.exchange_name(),
                    topic
                );
                Ok(())
            }
            Err(e) => {
                self.metrics.record_publish_failure();
                warn!("Failed to publish to topic '{}': {}", topic, e);
                Err(match e {
                    PipelineError::PublishFailed { .. } => e,
                    other => PipelineError::publish_failed(other),
                })
            }
        }
    }
}
