use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Direct,
    Topic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueBinding {
    pub queue: String,
    pub routing_key: String,
}

/// Exchange, queues and bindings that must exist before a component touches
/// the broker. With no exchange, queues are reached through the default
/// exchange using their own name as routing key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub exchange: Option<ExchangeSpec>,
    pub queues: Vec<QueueBinding>,
}

impl Topology {
    pub fn exchange_name(&self) -> &str {
        self.exchange.as_ref().map(|e| e.name.as_str()).unwrap_or("")
    }
}

/// Naming scheme for every broker entity the pipeline uses: one durable
/// direct exchange, one `<topic>_queue` per topic and a standalone anomaly
/// queue.
#[derive(Debug, Clone)]
pub struct BrokerLayout {
    exchange_name: String,
    anomaly_queue: String,
}

impl BrokerLayout {
    pub const QUEUE_SUFFIX: &'static str = "_queue";

    pub fn new(exchange_name: impl Into<String>, anomaly_queue: impl Into<String>) -> Self {
        Self {
            exchange_name: exchange_name.into(),
            anomaly_queue: anomaly_queue.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.exchange_name, &config.anomaly_queue)
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    pub fn anomaly_queue(&self) -> &str {
        &self.anomaly_queue
    }

    pub fn queue_for(&self, topic: &str) -> String {
        format!("{topic}{}", Self::QUEUE_SUFFIX)
    }

    /// Rejects topics that cannot be used as a routing key or whose queue
    /// would shadow the anomaly queue.
    pub fn validate_topic(&self, topic: &str) -> Result<()> {
        if topic.trim().is_empty() {
            return Err(PipelineError::InvalidTopic(
                "topic must not be empty".to_string(),
            ));
        }
        if topic.len() > 200 {
            return Err(PipelineError::InvalidTopic(format!(
                "topic is too long ({} bytes)",
                topic.len()
            )));
        }
        if self.queue_for(topic) == self.anomaly_queue {
            return Err(PipelineError::InvalidTopic(format!(
                "topic '{topic}' collides with the anomaly queue"
            )));
        }
        Ok(())
    }

    fn exchange(&self) -> ExchangeSpec {
        ExchangeSpec {
            name: self.exchange_name.clone(),
            kind: ExchangeKind::Direct,
            durable: true,
        }
    }

    pub fn topic_topology(&self, topic: &str) -> Topology {
        self.topics_topology(std::iter::once(topic))
    }

    pub fn topics_topology<'a>(&self, topics: impl IntoIterator<Item = &'a str>) -> Topology {
        Topology {
            exchange: Some(self.exchange()),
            queues: topics
                .into_iter()
                .map(|topic| QueueBinding {
                    queue: self.queue_for(topic),
                    routing_key: topic.to_string(),
                })
                .collect(),
        }
    }

    pub fn anomaly_topology(&self) -> Topology {
        Topology {
            exchange: None,
            queues: vec![QueueBinding {
                queue: self.anomaly_queue.clone(),
                routing_key: self.anomaly_queue.clone(),
            }],
        }
    }
}
