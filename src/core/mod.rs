pub mod classifier;
pub mod pipeline;
pub mod topology;
pub mod types;

pub use classifier::AnomalyClassifier;
pub use pipeline::{NewsPipeline, PublishReport};
pub use topology::{BrokerLayout, ExchangeKind, ExchangeSpec, QueueBinding, Topology};
pub use types::{AnomalyKind, AnomalyRecord, FetchOutcome, NewsItem, NewsMessage, ServiceHealth};
