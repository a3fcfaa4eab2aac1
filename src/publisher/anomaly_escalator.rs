use std::sync::Arc;
use tracing::{info, warn};

use crate::{
    broker::Broker,
    core::{topology::BrokerLayout, types::AnomalyRecord},
    error::{PipelineError, Result},
    monitoring::metrics::Metrics,
};

/// Delivers anomaly records to the remediation queue consumed by the healer.
/// The queue is addressed through the default exchange.
#[derive(Clone)]
pub struct AnomalyEscalator {
    broker: Arc<dyn Broker>,
    layout: BrokerLayout,
    metrics: Arc<Metrics>,
}

impl AnomalyEscalator {
    pub fn new(broker: Arc<dyn Broker>, layout: BrokerLayout, metrics: Arc<Metrics>) -> Self {
        Self {
            broker,
            layout,
            metrics,
        }
    }

    pub async fn escalate(&self, record: &AnomalyRecord) -> Result<()> {
        let payload = serde_json::to_vec(record)?;
        let topology = self.layout.anomaly_topology();
        let queue = self.layout.anomaly_queue();

        let mut channel = self
            .broker
            .ensure_publisher(&topology)
            .await
            .map_err(|e| {
                self.metrics.record_escalation_failure(record.kind);
                PipelineError::publish_failed(e)
            })?;

        let result = channel.publish("", queue, &payload).await;
        channel.close().await;

        match result {
            Ok(()) => {
                self.metrics.record_anomaly_escalated(record.kind);
                info!(
                    "Escalated anomaly {} from '{}' to '{}'",
                    record.kind,
                    record.source.as_deref().unwrap_or("-"),
                    queue
                );
                Ok(())
            }
            Err(e) => {
                self.metrics.record_escalation_failure(record.kind);
                warn!("Failed to escalate anomaly {}: {}", record.kind, e);
                Err(match e {
                    PipelineError::PublishFailed { .. } => e,
                    other => PipelineError::publish_failed(other),
                })
            }
        }
    }
}
