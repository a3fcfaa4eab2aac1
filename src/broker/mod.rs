// Broker abstraction: topology declaration plus scoped publish/consume channels.
// Every publish, escalation and subscription acquires its own channel.

pub mod memory;
pub mod rabbitmq;

pub use memory::InMemoryBroker;
pub use rabbitmq::RabbitMQBroker;

use async_trait::async_trait;

use crate::core::topology::Topology;
use crate::error::Result;

#[async_trait]
pub trait Broker: Send + Sync {
    /// Idempotently declare the exchange, queues and bindings in `topology`.
    async fn ensure(&self, topology: &Topology) -> Result<()>;

    /// Open a channel, declare `topology` and return it ready for publishing.
    async fn ensure_publisher(&self, topology: &Topology) -> Result<Box<dyn PublishChannel>>;

    /// Open a channel, declare `topology` and start consuming `queue`.
    async fn ensure_subscriber(
        &self,
        topology: &Topology,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<Box<dyn DeliveryStream>>;

    /// Human readable target, used in health output and logs.
    fn describe(&self) -> String;
}

#[async_trait]
pub trait PublishChannel: Send {
    /// Submit one persistent message. Resolves once the broker accepted it.
    async fn publish(&mut self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<()>;

    async fn close(self: Box<Self>);
}

#[async_trait]
pub trait DeliveryStream: Send {
    /// `None` means the underlying connection is gone.
    async fn next_delivery(&mut self) -> Option<Result<Delivery>>;

    async fn close(self: Box<Self>);
}

#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    async fn ack(&self) -> Result<()>;

    async fn reject(&self, requeue: bool) -> Result<()>;
}

pub struct Delivery {
    pub data: Vec<u8>,
    pub redelivered: bool,
    pub acker: Box<dyn DeliveryAcker>,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("bytes", &self.data.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}
