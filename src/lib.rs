pub mod broker;
pub mod config;
pub mod consumer;
pub mod core;
pub mod error;
pub mod fetcher;
pub mod http_server;
pub mod monitoring;
pub mod publisher;

pub use broker::{Broker, InMemoryBroker, RabbitMQBroker};
pub use config::Config;
pub use consumer::{MessageHandler, Subscriber, SubscriptionRegistry, SubscriptionState};
pub use core::{AnomalyClassifier, AnomalyKind, AnomalyRecord, BrokerLayout, NewsItem, NewsPipeline};
pub use error::{PipelineError, Result};
pub use fetcher::{NewsApiClient, NewsMonitor, NewsSource};
pub use http_server::{AppState, HttpServer};
pub use monitoring::Metrics;
pub use publisher::{AnomalyEscalator, NewsPublisher};
