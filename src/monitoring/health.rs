use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::consumer::SubscriptionState;

/// Per-subscription status as exposed over HTTP
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionStatus {
    pub id: String,
    pub topic: String,
    pub queue: String,
    pub state: SubscriptionState,
    pub started_at: DateTime<Utc>,
    pub error_message: Option<String>,
}

impl SubscriptionStatus {
    pub fn is_active(&self) -> bool {
        matches!(
            self.state,
            SubscriptionState::Unbound | SubscriptionState::Bound | SubscriptionState::Consuming
        )
    }
}
