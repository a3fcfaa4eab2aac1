pub mod registry;
pub mod subscriber;

pub use registry::SubscriptionRegistry;
pub use subscriber::{
    LoggingHandler, MessageHandler, Subscriber, SubscriptionHandle, SubscriptionState,
};
