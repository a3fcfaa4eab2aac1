use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use super::subscriber::{
    wait_for_state, MessageHandler, Subscriber, SubscriptionHandle, SubscriptionState,
};
use crate::error::{PipelineError, Result};
use crate::monitoring::{metrics::Metrics, SubscriptionStatus};

/// Tracks the subscriptions started over HTTP so they can be listed and
/// cancelled later. Subscriptions that lost their connection stay listed
/// with their terminal state until stopped.
pub struct SubscriptionRegistry {
    subscriber: Subscriber,
    subscriptions: RwLock<HashMap<Uuid, SubscriptionHandle>>,
    metrics: Arc<Metrics>,
}

impl SubscriptionRegistry {
    pub fn new(subscriber: Subscriber, metrics: Arc<Metrics>) -> Self {
        Self {
            subscriber,
            subscriptions: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    pub async fn start(&self, topic: &str, handler: Arc<dyn MessageHandler>) -> Result<Uuid> {
        let handle = self.subscriber.subscribe(topic, handler)?;
        let id = handle.id();

        let mut subscriptions = self.subscriptions.write().await;
        subscriptions.insert(id, handle);
        self.metrics
            .set_active_subscriptions(count_active(&subscriptions));

        info!("Started subscription {} for topic '{}'", id, topic);
        Ok(id)
    }

    /// Cancels the subscription and removes it from the registry.
    pub async fn stop(&self, id: Uuid) -> Result<SubscriptionStatus> {
        let handle = {
            let mut subscriptions = self.subscriptions.write().await;
            let handle = subscriptions.remove(&id);
            self.metrics
                .set_active_subscriptions(count_active(&subscriptions));
            handle
        };

        let mut handle =
            handle.ok_or_else(|| PipelineError::Subscription(format!("unknown subscription {id}")))?;
        handle.stop().await;

        info!("Stopped subscription {} for topic '{}'", id, handle.topic());
        Ok(handle.status())
    }

    pub async fn stop_all(&self) {
        let handles: Vec<SubscriptionHandle> = {
            let mut subscriptions = self.subscriptions.write().await;
            subscriptions.drain().map(|(_, handle)| handle).collect()
        };
        self.metrics.set_active_subscriptions(0);

        for mut handle in handles {
            handle.stop().await;
        }
    }

    pub async fn status(&self, id: Uuid) -> Option<SubscriptionStatus> {
        self.subscriptions.read().await.get(&id).map(|h| h.status())
    }

    pub async fn list(&self) -> Vec<SubscriptionStatus> {
        let mut statuses: Vec<SubscriptionStatus> = self
            .subscriptions
            .read()
            .await
            .values()
            .map(|h| h.status())
            .collect();
        statuses.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        statuses
    }

    /// Subscriptions not yet in a terminal state. Also refreshes the gauge,
    /// since subscriptions lose their connection without going through here.
    pub async fn active_count(&self) -> usize {
        let active = count_active(&*self.subscriptions.read().await);
        self.metrics.set_active_subscriptions(active);
        active
    }

    /// Waits for `predicate` on the subscription's state without holding the
    /// registry lock. `None` if the id is unknown.
    pub async fn wait_for(
        &self,
        id: Uuid,
        predicate: impl Fn(SubscriptionState) -> bool,
    ) -> Option<SubscriptionState> {
        let receiver = self
            .subscriptions
            .read()
            .await
            .get(&id)
            .map(|h| h.state_receiver())?;
        Some(wait_for_state(receiver, predicate).await)
    }
}

fn count_active(subscriptions: &HashMap<Uuid, SubscriptionHandle>) -> usize {
    subscriptions
        .values()
        .filter(|h| !h.state().is_terminal())
        .count()
}
