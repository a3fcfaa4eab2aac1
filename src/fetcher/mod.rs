pub mod monitor;
pub mod news_api;

pub use monitor::{CycleSummary, NewsMonitor};
pub use news_api::{outcome_of, Article, FetchError, FetchResult, NewsApiClient, NewsSource};
