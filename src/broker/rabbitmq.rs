use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::*, publisher_confirm::Confirmation, types::FieldTable, BasicProperties, Channel,
    Connection, ConnectionProperties, Consumer,
};
use tracing::{debug, info, warn};

use super::{Broker, Delivery, DeliveryAcker, DeliveryStream, PublishChannel};
use crate::core::topology::{ExchangeKind, Topology};
use crate::error::{PipelineError, Result};

const PERSISTENT: u8 = 2;
const REPLY_SUCCESS: u16 = 200;

/// RabbitMQ broker reached through lapin. Holds only connection settings;
/// every operation opens and closes its own connection.
#[derive(Debug, Clone)]
pub struct RabbitMQBroker {
    url: String,
    prefetch_count: u16,
}

impl RabbitMQBroker {
    pub fn new(url: &str, prefetch_count: u16) -> Self {
        Self {
            url: url.to_string(),
            prefetch_count,
        }
    }

    async fn open(&self) -> Result<(Connection, Channel)> {
        let connection = Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .map_err(|e| {
                PipelineError::BrokerUnavailable(format!("Failed to connect to RabbitMQ: {e}"))
            })?;

        match connection.create_channel().await {
            Ok(channel) => Ok((connection, channel)),
            Err(e) => {
                close_connection(&connection).await;
                Err(PipelineError::BrokerUnavailable(format!(
                    "Failed to create channel: {e}"
                )))
            }
        }
    }

    /// Opens a connection and declares `topology` on it, closing everything
    /// again if any step fails.
    async fn open_declared(&self, topology: &Topology) -> Result<(Connection, Channel)> {
        let (connection, channel) = self.open().await?;
        if let Err(e) = declare(&channel, topology).await {
            close_channel(&channel).await;
            close_connection(&connection).await;
            return Err(e);
        }
        Ok((connection, channel))
    }
}

#[async_trait]
impl Broker for RabbitMQBroker {
    async fn ensure(&self, topology: &Topology) -> Result<()> {
        let (connection, channel) = self.open_declared(topology).await?;
        close_channel(&channel).await;
        close_connection(&connection).await;
        Ok(())
    }

    async fn ensure_publisher(&self, topology: &Topology) -> Result<Box<dyn PublishChannel>> {
        let (connection, channel) = self.open_declared(topology).await?;

        // Publisher confirms so a publish only succeeds once the broker took it
        if let Err(e) = channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
        {
            close_channel(&channel).await;
            close_connection(&connection).await;
            return Err(PipelineError::BrokerUnavailable(format!(
                "Failed to enable publisher confirms: {e}"
            )));
        }

        Ok(Box::new(RabbitMQPublishChannel {
            connection,
            channel,
        }))
    }

    async fn ensure_subscriber(
        &self,
        topology: &Topology,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<Box<dyn DeliveryStream>> {
        let (connection, channel) = self.open_declared(topology).await?;

        let setup = async {
            // Set prefetch count for fair dispatch
            channel
                .basic_qos(self.prefetch_count, BasicQosOptions::default())
                .await
                .map_err(|e| {
                    PipelineError::BrokerUnavailable(format!("Failed to set prefetch count: {e}"))
                })?;

            channel
                .basic_consume(
                    queue,
                    consumer_tag,
                    BasicConsumeOptions {
                        no_ack: false,
                        exclusive: false,
                        no_local: false,
                        nowait: false,
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| {
                    PipelineError::BrokerUnavailable(format!(
                        "Failed to start consumer for queue {queue}: {e}"
                    ))
                })
        };

        match setup.await {
            Ok(consumer) => {
                info!(
                    "Consumer '{}' started for queue '{}' on exchange '{}'",
                    consumer_tag,
                    queue,
                    topology.exchange_name()
                );
                Ok(Box::new(RabbitMQDeliveryStream {
                    connection,
                    channel,
                    consumer,
                }))
            }
            Err(e) => {
                close_channel(&channel).await;
                close_connection(&connection).await;
                Err(e)
            }
        }
    }

    fn describe(&self) -> String {
        redact_credentials(&self.url)
    }
}

async fn declare(channel: &Channel, topology: &Topology) -> Result<()> {
    if let Some(exchange) = &topology.exchange {
        let kind = match exchange.kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        };

        channel
            .exchange_declare(
                &exchange.name,
                kind,
                ExchangeDeclareOptions {
                    durable: exchange.durable,
                    auto_delete: false,
                    internal: false,
                    nowait: false,
                    passive: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                PipelineError::BrokerUnavailable(format!(
                    "Failed to declare exchange {}: {e}",
                    exchange.name
                ))
            })?;
    }

    for binding in &topology.queues {
        channel
            .queue_declare(
                &binding.queue,
                QueueDeclareOptions {
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    nowait: false,
                    passive: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                PipelineError::BrokerUnavailable(format!(
                    "Failed to declare queue {}: {e}",
                    binding.queue
                ))
            })?;

        // Queues without an exchange are reached through the default exchange
        if let Some(exchange) = &topology.exchange {
            channel
                .queue_bind(
                    &binding.queue,
                    &exchange.name,
                    &binding.routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| {
                    PipelineError::BrokerUnavailable(format!(
                        "Failed to bind queue {} to exchange {} with routing key {}: {e}",
                        binding.queue, exchange.name, binding.routing_key
                    ))
                })?;
        }
    }

    debug!(
        "Declared topology: exchange='{}', queues={}",
        topology.exchange_name(),
        topology.queues.len()
    );
    Ok(())
}

async fn close_channel(channel: &Channel) {
    if let Err(e) = channel.close(REPLY_SUCCESS, "closing").await {
        debug!("Channel close failed: {e}");
    }
}

async fn close_connection(connection: &Connection) {
    if let Err(e) = connection.close(REPLY_SUCCESS, "closing").await {
        debug!("Connection close failed: {e}");
    }
}

fn redact_credentials(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***@{}", &url[..scheme_end], &url[at + 1..])
        }
        _ => url.to_string(),
    }
}

struct RabbitMQPublishChannel {
    connection: Connection,
    channel: Channel,
}

#[async_trait]
impl PublishChannel for RabbitMQPublishChannel {
    async fn publish(&mut self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<()> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default()
                    .with_delivery_mode(PERSISTENT)
                    .with_content_type("application/json".into()),
            )
            .await
            .map_err(PipelineError::publish_failed)?;

        match confirm.await.map_err(PipelineError::publish_failed)? {
            Confirmation::Nack(_) => Err(PipelineError::publish_failed(format!(
                "broker rejected message for routing key {routing_key}"
            ))),
            _ => Ok(()),
        }
    }

    async fn close(self: Box<Self>) {
        close_channel(&self.channel).await;
        close_connection(&self.connection).await;
    }
}

struct RabbitMQDeliveryStream {
    connection: Connection,
    channel: Channel,
    consumer: Consumer,
}

#[async_trait]
impl DeliveryStream for RabbitMQDeliveryStream {
    async fn next_delivery(&mut self) -> Option<Result<Delivery>> {
        let delivery = self.consumer.next().await?;
        Some(
            delivery
                .map(|delivery| Delivery {
                    data: delivery.data,
                    redelivered: delivery.redelivered,
                    acker: Box::new(RabbitMQAcker(delivery.acker)),
                })
                .map_err(|e| {
                    warn!("Error receiving delivery: {e}");
                    PipelineError::BrokerUnavailable(format!("Consumer error: {e}"))
                }),
        )
    }

    async fn close(self: Box<Self>) {
        close_channel(&self.channel).await;
        close_connection(&self.connection).await;
    }
}

struct RabbitMQAcker(lapin::acker::Acker);

#[async_trait]
impl DeliveryAcker for RabbitMQAcker {
    async fn ack(&self) -> Result<()> {
        self.0
            .ack(BasicAckOptions { multiple: false })
            .await
            .map(|_| ())
            .map_err(|e| {
                PipelineError::BrokerUnavailable(format!("Failed to acknowledge message: {e}"))
            })
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.0
            .nack(BasicNackOptions {
                requeue,
                multiple: false,
            })
            .await
            .map(|_| ())
            .map_err(|e| PipelineError::BrokerUnavailable(format!("Failed to nack message: {e}")))
    }
}
