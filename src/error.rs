use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("Publish failed: {cause}")]
    PublishFailed { cause: String },

    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    #[error("Upstream fetch failed: {0}")]
    UpstreamFetchFailed(String),

    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Subscription error: {0}")]
    Subscription(String),
}

impl PipelineError {
    pub fn publish_failed(cause: impl std::fmt::Display) -> Self {
        PipelineError::PublishFailed {
            cause: cause.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
