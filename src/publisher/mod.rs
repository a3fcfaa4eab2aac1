pub mod anomaly_escalator;
pub mod news_publisher;

pub use anomaly_escalator::AnomalyEscalator;
pub use news_publisher::NewsPublisher;
