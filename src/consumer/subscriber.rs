use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{Broker, Delivery};
use crate::core::topology::BrokerLayout;
use crate::core::types::NewsMessage;
use crate::error::{PipelineError, Result};
use crate::monitoring::{metrics::Metrics, SubscriptionStatus};

/// Lifecycle of one subscription. `Cancelled` and `ConnectionLost` are
/// terminal; nothing reconnects automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    Unbound,
    Bound,
    Consuming,
    Cancelled,
    ConnectionLost,
}

impl SubscriptionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubscriptionState::Cancelled | SubscriptionState::ConnectionLost
        )
    }
}

/// Callback invoked once per delivered news message. Returning an error
/// sends the message back to its queue for another attempt.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, topic: &str, message: NewsMessage) -> Result<()>;
}

/// Default handler for HTTP-initiated subscriptions: logs and acknowledges.
pub struct LoggingHandler;

#[async_trait]
impl MessageHandler for LoggingHandler {
    async fn handle(&self, topic: &str, message: NewsMessage) -> Result<()> {
        info!("Received from '{}': {}", topic, message.title);
        Ok(())
    }
}

/// Binds a topic queue and feeds its deliveries to a handler.
#[derive(Clone)]
pub struct Subscriber {
    broker: Arc<dyn Broker>,
    layout: BrokerLayout,
    metrics: Arc<Metrics>,
    requeue_delay: Duration,
}

const DEFAULT_REQUEUE_DELAY: Duration = Duration::from_millis(500);

impl Subscriber {
    pub fn new(broker: Arc<dyn Broker>, layout: BrokerLayout, metrics: Arc<Metrics>) -> Self {
        Self {
            broker,
            layout,
            metrics,
            requeue_delay: DEFAULT_REQUEUE_DELAY,
        }
    }

    pub fn with_requeue_delay(mut self, requeue_delay: Duration) -> Self {
        self.requeue_delay = requeue_delay;
        self
    }

    /// Starts consuming `topic` in a background task and returns its handle.
    pub fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<SubscriptionHandle> {
        self.layout.validate_topic(topic)?;

        let id = Uuid::new_v4();
        let queue = self.layout.queue_for(topic);
        let cancel = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(SubscriptionState::Unbound);
        let error_message = Arc::new(Mutex::new(None));

        let subscriber = self.clone();
        let task_topic = topic.to_string();
        let task_queue = queue.clone();
        let task_cancel = cancel.clone();
        let task_error = error_message.clone();
        let consumer_tag = format!("{queue}-{}", id.simple());

        let task = tokio::spawn(async move {
            if let Err(e) = subscriber
                .run(
                    &task_topic,
                    &task_queue,
                    &consumer_tag,
                    handler.as_ref(),
                    task_cancel,
                    state_tx,
                )
                .await
            {
                error!("Subscription to topic '{}' ended: {}", task_topic, e);
                *task_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(e.to_string());
            }
        });

        Ok(SubscriptionHandle {
            id,
            topic: topic.to_string(),
            queue,
            started_at: Utc::now(),
            cancel,
            state: state_rx,
            error_message,
            task: Some(task),
        })
    }

    async fn run(
        &self,
        topic: &str,
        queue: &str,
        consumer_tag: &str,
        handler: &dyn MessageHandler,
        cancel: CancellationToken,
        state: watch::Sender<SubscriptionState>,
    ) -> Result<()> {
        let topology = self.layout.topic_topology(topic);

        let stream = tokio::select! {
            _ = cancel.cancelled() => {
                state.send_replace(SubscriptionState::Cancelled);
                return Ok(());
            }
            stream = self.broker.ensure_subscriber(&topology, queue, consumer_tag) => stream,
        };
        let mut stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                state.send_replace(SubscriptionState::ConnectionLost);
                return Err(e);
            }
        };
        state.send_replace(SubscriptionState::Bound);

        info!("Listening on topic '{}' (queue '{}')", topic, queue);
        state.send_replace(SubscriptionState::Consuming);

        let outcome = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                next = stream.next_delivery() => match next {
                    Some(Ok(delivery)) => {
                        self.process_delivery(topic, queue, handler, delivery, &cancel).await
                    }
                    Some(Err(e)) => break Err(e),
                    None => break Err(PipelineError::BrokerUnavailable(format!(
                        "consumer stream for queue {queue} closed"
                    ))),
                },
            }
        };

        // Anything still unacknowledged returns to the queue when the channel closes
        stream.close().await;

        match outcome {
            Ok(()) => {
                info!("Subscription to topic '{}' cancelled", topic);
                state.send_replace(SubscriptionState::Cancelled);
                Ok(())
            }
            Err(e) => {
                state.send_replace(SubscriptionState::ConnectionLost);
                Err(e)
            }
        }
    }

    async fn process_delivery(
        &self,
        topic: &str,
        queue: &str,
        handler: &dyn MessageHandler,
        delivery: Delivery,
        cancel: &CancellationToken,
    ) {
        self.metrics.record_message_consumed();

        let message: NewsMessage = match serde_json::from_slice(&delivery.data) {
            Ok(message) => message,
            Err(e) => {
                warn!("Rejecting undecodable message on queue '{}': {}", queue, e);
                self.metrics.record_message_rejected();
                if let Err(e) = delivery.acker.reject(false).await {
                    error!("Failed to reject message on queue '{}': {}", queue, e);
                }
                return;
            }
        };

        debug!(
            "Delivering '{}' from queue '{}' (redelivered: {})",
            message.title, queue, delivery.redelivered
        );

        match handler.handle(topic, message).await {
            Ok(()) => match delivery.acker.ack().await {
                Ok(()) => self.metrics.record_message_acked(),
                Err(e) => error!("Failed to acknowledge message on queue '{}': {}", queue, e),
            },
            Err(e) => {
                self.metrics.record_handler_failure();
                warn!(
                    "Handler failed for message on queue '{}', requeueing in {:?}: {}",
                    queue, self.requeue_delay, e
                );

                tokio::select! {
                    _ = tokio::time::sleep(self.requeue_delay) => {}
                    _ = cancel.cancelled() => {}
                }

                // The channel stays open, so only an explicit requeue frees the
                // prefetch slot and brings the message back
                if let Err(e) = delivery.acker.reject(true).await {
                    error!("Failed to requeue message on queue '{}': {}", queue, e);
                }
            }
        }
    }
}

/// Owner-side view of a running subscription.
pub struct SubscriptionHandle {
    id: Uuid,
    topic: String,
    queue: String,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
    state: watch::Receiver<SubscriptionState>,
    error_message: Arc<Mutex<Option<String>>>,
    task: Option<JoinHandle<()>>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<SubscriptionState> {
        self.state.clone()
    }

    pub fn status(&self) -> SubscriptionStatus {
        SubscriptionStatus {
            id: self.id.to_string(),
            topic: self.topic.clone(),
            queue: self.queue.clone(),
            state: self.state(),
            started_at: self.started_at,
            error_message: self
                .error_message
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
        }
    }

    /// Waits until the state satisfies `predicate` or the task has ended.
    pub async fn wait_for(&self, predicate: impl Fn(SubscriptionState) -> bool) -> SubscriptionState {
        wait_for_state(self.state.clone(), predicate).await
    }

    /// Cancels consumption and waits for the task to release its channel.
    pub async fn stop(&mut self) -> SubscriptionState {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("Subscription task for '{}' panicked: {}", self.topic, e);
            }
        }
        self.state()
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub async fn wait_for_state(
    mut state: watch::Receiver<SubscriptionState>,
    predicate: impl Fn(SubscriptionState) -> bool,
) -> SubscriptionState {
    loop {
        let current = *state.borrow_and_update();
        if predicate(current) {
            return current;
        }
        if state.changed().await.is_err() {
            return *state.borrow();
        }
    }
}
