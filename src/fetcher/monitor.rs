// Background news monitor
// Polls the news source topic by topic and escalates failed or empty fetches

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::news_api::{outcome_of, NewsSource};
use crate::config::Config;
use crate::core::pipeline::NewsPipeline;
use crate::core::types::AnomalyKind;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleSummary {
    pub topics_checked: usize,
    pub anomalies: Vec<(String, AnomalyKind)>,
}

pub struct NewsMonitor {
    source: Arc<dyn NewsSource>,
    pipeline: NewsPipeline,
    topics: Vec<String>,
    poll_interval: Duration,
    topic_delay: Duration,
}

impl NewsMonitor {
    pub fn new(
        source: Arc<dyn NewsSource>,
        pipeline: NewsPipeline,
        topics: Vec<String>,
        poll_interval: Duration,
        topic_delay: Duration,
    ) -> Self {
        Self {
            source,
            pipeline,
            topics,
            poll_interval,
            topic_delay,
        }
    }

    pub fn from_config(config: &Config, source: Arc<dyn NewsSource>, pipeline: NewsPipeline) -> Self {
        Self::new(
            source,
            pipeline,
            config.poll_topics.clone(),
            Duration::from_secs(config.poll_interval_secs),
            Duration::from_millis(config.poll_topic_delay_ms),
        )
    }

    pub async fn run(&self, cancellation_token: CancellationToken) {
        info!(
            "Starting news monitor for topics {:?} (every {}s)",
            self.topics,
            self.poll_interval.as_secs()
        );

        let mut cycles = 0u64;
        loop {
            let summary = self.run_cycle(&cancellation_token).await;
            cycles += 1;
            info!(
                "Monitor cycle {} checked {} topics, {} anomalies",
                cycles,
                summary.topics_checked,
                summary.anomalies.len()
            );

            tokio::select! {
                _ = cancellation_token.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        info!("News monitor stopped after {} cycles", cycles);
    }

    /// One pass over every configured topic. Stops early on cancellation.
    pub async fn run_cycle(&self, cancellation_token: &CancellationToken) -> CycleSummary {
        let mut summary = CycleSummary::default();

        for (index, topic) in self.topics.iter().enumerate() {
            if cancellation_token.is_cancelled() {
                break;
            }
            if index > 0 && !self.topic_delay.is_zero() {
                tokio::select! {
                    _ = cancellation_token.cancelled() => break,
                    _ = tokio::time::sleep(self.topic_delay) => {}
                }
            }

            let result = self.source.top_headlines(topic).await;
            let outcome = outcome_of(&result);
            debug!("Fetch for '{}': {:?}", topic, outcome);

            summary.topics_checked += 1;
            if let Some(kind) = self.pipeline.process_fetch_outcome(topic, &outcome).await {
                summary.anomalies.push((topic.clone(), kind));
            }
        }

        summary
    }
}
