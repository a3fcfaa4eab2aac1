use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Broker, Delivery, DeliveryAcker, DeliveryStream, PublishChannel};
use crate::core::topology::{ExchangeKind, QueueBinding, Topology};
use crate::error::{PipelineError, Result};

#[derive(Debug, Clone)]
struct StoredMessage {
    data: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    messages: VecDeque<StoredMessage>,
    notify: Arc<Notify>,
}

impl QueueState {
    fn push_back(&mut self, message: StoredMessage) {
        self.messages.push_back(message);
        self.notify.notify_one();
    }

    fn requeue_front(&mut self, mut message: StoredMessage) {
        message.redelivered = true;
        self.messages.push_front(message);
        self.notify.notify_one();
    }
}

#[derive(Debug)]
struct ExchangeState {
    kind: ExchangeKind,
    durable: bool,
    // (routing key, queue)
    bindings: BTreeSet<(String, String)>,
}

#[derive(Debug)]
struct State {
    available: bool,
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
    failing_routes: HashSet<String>,
    published: u64,
}

struct Inner {
    state: Mutex<State>,
    connection: Mutex<CancellationToken>,
    // Unacknowledged deliveries allowed per consumer, 0 is unlimited
    prefetch: u16,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn connection(&self) -> CancellationToken {
        self.connection
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// Broker that keeps exchanges and queues in process memory with AMQP-like
/// semantics: direct and topic routing, a per-consumer prefetch window,
/// redelivery of unacknowledged messages when a consumer's channel closes,
/// and unroutable messages silently dropped.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_prefetch(0)
    }

    /// Stops handing a consumer new messages once `prefetch_count` of its
    /// deliveries are unacknowledged, like `basic.qos`.
    pub fn with_prefetch(prefetch_count: u16) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    available: true,
                    exchanges: HashMap::new(),
                    queues: HashMap::new(),
                    failing_routes: HashSet::new(),
                    published: 0,
                }),
                connection: Mutex::new(CancellationToken::new()),
                prefetch: prefetch_count,
            }),
        }
    }

    /// While unavailable every new connection attempt fails.
    pub fn set_available(&self, available: bool) {
        self.inner.state().available = available;
    }

    /// Severs every open channel, as a broker restart would.
    pub fn drop_connections(&self) {
        let mut connection = self
            .inner
            .connection
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        connection.cancel();
        *connection = CancellationToken::new();
    }

    /// Makes publishes with this routing key fail after the channel is open.
    pub fn fail_publishes_to(&self, routing_key: &str) {
        self.inner
            .state()
            .failing_routes
            .insert(routing_key.to_string());
    }

    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.inner.state().queues.get(queue).map(|q| q.messages.len())
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.state().queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn exchange(&self, name: &str) -> Option<(ExchangeKind, bool)> {
        self.inner
            .state()
            .exchanges
            .get(name)
            .map(|e| (e.kind, e.durable))
    }

    pub fn bindings(&self, exchange: &str) -> Vec<QueueBinding> {
        self.inner
            .state()
            .exchanges
            .get(exchange)
            .map(|e| {
                e.bindings
                    .iter()
                    .map(|(routing_key, queue)| QueueBinding {
                        queue: queue.clone(),
                        routing_key: routing_key.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Removes and returns every ready message in `queue`.
    pub fn drain(&self, queue: &str) -> Vec<Vec<u8>> {
        self.inner
            .state()
            .queues
            .get_mut(queue)
            .map(|q| q.messages.drain(..).map(|m| m.data).collect())
            .unwrap_or_default()
    }

    pub fn published_count(&self) -> u64 {
        self.inner.state().published
    }

    fn connect(&self) -> Result<CancellationToken> {
        if !self.inner.state().available {
            return Err(PipelineError::BrokerUnavailable(
                "in-memory broker is unavailable".to_string(),
            ));
        }
        Ok(self.inner.connection())
    }

    fn declare(&self, topology: &Topology) -> Result<()> {
        let mut state = self.inner.state();

        if let Some(spec) = &topology.exchange {
            match state.exchanges.get(&spec.name) {
                Some(existing) if existing.kind != spec.kind || existing.durable != spec.durable => {
                    return Err(PipelineError::BrokerUnavailable(format!(
                        "PRECONDITION_FAILED - inequivalent arg for exchange '{}'",
                        spec.name
                    )));
                }
                Some(_) => {}
                None => {
                    state.exchanges.insert(
                        spec.name.clone(),
                        ExchangeState {
                            kind: spec.kind,
                            durable: spec.durable,
                            bindings: BTreeSet::new(),
                        },
                    );
                }
            }
        }

        for binding in &topology.queues {
            state.queues.entry(binding.queue.clone()).or_default();
            if let Some(spec) = &topology.exchange {
                if let Some(exchange) = state.exchanges.get_mut(&spec.name) {
                    exchange
                        .bindings
                        .insert((binding.routing_key.clone(), binding.queue.clone()));
                }
            }
        }

        Ok(())
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn ensure(&self, topology: &Topology) -> Result<()> {
        self.connect()?;
        self.declare(topology)
    }

    async fn ensure_publisher(&self, topology: &Topology) -> Result<Box<dyn PublishChannel>> {
        let connection = self.connect()?;
        self.declare(topology)?;
        Ok(Box::new(InMemoryPublishChannel {
            inner: self.inner.clone(),
            connection,
        }))
    }

    async fn ensure_subscriber(
        &self,
        topology: &Topology,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<Box<dyn DeliveryStream>> {
        let connection = self.connect()?;
        self.declare(topology)?;
        if !self.inner.state().queues.contains_key(queue) {
            return Err(PipelineError::BrokerUnavailable(format!(
                "NOT_FOUND - no queue '{queue}'"
            )));
        }
        debug!("In-memory consumer '{}' attached to '{}'", consumer_tag, queue);
        Ok(Box::new(InMemoryDeliveryStream {
            inner: self.inner.clone(),
            queue: queue.to_string(),
            connection,
            unacked: Arc::new(Mutex::new(BTreeMap::new())),
            credit: Arc::new(Notify::new()),
            next_tag: 0,
        }))
    }

    fn describe(&self) -> String {
        "memory://".to_string()
    }
}

struct InMemoryPublishChannel {
    inner: Arc<Inner>,
    connection: CancellationToken,
}

#[async_trait]
impl PublishChannel for InMemoryPublishChannel {
    async fn publish(&mut self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<()> {
        if self.connection.is_cancelled() {
            return Err(PipelineError::publish_failed("channel closed"));
        }

        let mut state = self.inner.state();
        if state.failing_routes.contains(routing_key) {
            return Err(PipelineError::publish_failed(format!(
                "simulated transport failure for routing key {routing_key}"
            )));
        }

        let targets: Vec<String> = if exchange.is_empty() {
            vec![routing_key.to_string()]
        } else {
            let spec = state.exchanges.get(exchange).ok_or_else(|| {
                PipelineError::publish_failed(format!("NOT_FOUND - no exchange '{exchange}'"))
            })?;
            spec.bindings
                .iter()
                .filter(|(binding_key, _)| match spec.kind {
                    ExchangeKind::Direct => binding_key == routing_key,
                    ExchangeKind::Topic => topic_matches(binding_key, routing_key),
                })
                .map(|(_, queue)| queue.clone())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect()
        };

        for target in targets {
            if let Some(queue) = state.queues.get_mut(&target) {
                queue.push_back(StoredMessage {
                    data: payload.to_vec(),
                    redelivered: false,
                });
            }
        }
        state.published += 1;
        Ok(())
    }

    async fn close(self: Box<Self>) {}
}

type Unacked = Arc<Mutex<BTreeMap<u64, StoredMessage>>>;

struct InMemoryDeliveryStream {
    inner: Arc<Inner>,
    queue: String,
    connection: CancellationToken,
    unacked: Unacked,
    // Signalled whenever an ack or reject frees a prefetch slot
    credit: Arc<Notify>,
    next_tag: u64,
}

impl InMemoryDeliveryStream {
    fn window_full(&self) -> bool {
        self.inner.prefetch > 0
            && self.unacked.lock().unwrap_or_else(|e| e.into_inner()).len()
                >= usize::from(self.inner.prefetch)
    }
}

#[async_trait]
impl DeliveryStream for InMemoryDeliveryStream {
    async fn next_delivery(&mut self) -> Option<Result<Delivery>> {
        loop {
            if self.connection.is_cancelled() {
                return None;
            }

            if self.window_full() {
                tokio::select! {
                    _ = self.credit.notified() => continue,
                    _ = self.connection.cancelled() => return None,
                }
            }

            let notify = {
                let mut state = self.inner.state();
                let queue = state.queues.get_mut(&self.queue)?;
                match queue.messages.pop_front() {
                    Some(message) => {
                        self.next_tag += 1;
                        let tag = self.next_tag;
                        let delivery = Delivery {
                            data: message.data.clone(),
                            redelivered: message.redelivered,
                            acker: Box::new(InMemoryAcker {
                                inner: self.inner.clone(),
                                queue: self.queue.clone(),
                                tag,
                                unacked: self.unacked.clone(),
                                credit: self.credit.clone(),
                                connection: self.connection.clone(),
                            }),
                        };
                        self.unacked
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .insert(tag, message);
                        return Some(Ok(delivery));
                    }
                    None => queue.notify.clone(),
                }
            };

            tokio::select! {
                _ = notify.notified() => {}
                _ = self.connection.cancelled() => return None,
            }
        }
    }

    async fn close(self: Box<Self>) {}
}

impl Drop for InMemoryDeliveryStream {
    // Closing a channel hands every unacknowledged message back to the queue
    fn drop(&mut self) {
        let pending: Vec<StoredMessage> = std::mem::take(
            &mut *self.unacked.lock().unwrap_or_else(|e| e.into_inner()),
        )
        .into_values()
        .collect();

        if pending.is_empty() {
            return;
        }

        let mut state = self.inner.state();
        if let Some(queue) = state.queues.get_mut(&self.queue) {
            for message in pending.into_iter().rev() {
                queue.requeue_front(message);
            }
        }
    }
}

struct InMemoryAcker {
    inner: Arc<Inner>,
    queue: String,
    tag: u64,
    unacked: Unacked,
    credit: Arc<Notify>,
    connection: CancellationToken,
}

impl InMemoryAcker {
    fn take(&self) -> Result<StoredMessage> {
        if self.connection.is_cancelled() {
            return Err(PipelineError::BrokerUnavailable("channel closed".to_string()));
        }
        let message = self
            .unacked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.tag)
            .ok_or_else(|| {
                PipelineError::BrokerUnavailable(format!("unknown delivery tag {}", self.tag))
            })?;
        self.credit.notify_one();
        Ok(message)
    }
}

#[async_trait]
impl DeliveryAcker for InMemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.take().map(|_| ())
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        let message = self.take()?;
        if requeue {
            if let Some(queue) = self.inner.state().queues.get_mut(&self.queue) {
                queue.requeue_front(message);
            }
        }
        Ok(())
    }
}

/// AMQP topic matching: `*` is exactly one word, `#` is zero or more words.
fn topic_matches(pattern: &str, key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| matches(rest, &key[skip..])),
            Some((&"*", rest)) => !key.is_empty() && matches(rest, &key[1..]),
            Some((word, rest)) => key.first() == Some(word) && matches(rest, &key[1..]),
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    matches(&pattern, &key)
}
