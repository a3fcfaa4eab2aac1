pub mod health;
pub mod metrics;

pub use health::SubscriptionStatus;
pub use metrics::{Metrics, MetricsSnapshot};
