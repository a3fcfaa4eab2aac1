use anyhow::{anyhow, Result};
use news_pipeline::core::types::{AnomalyKind, AnomalyRecord, NewsMessage};
use std::time::{Duration, Instant};

pub struct QueueAssertions;

impl QueueAssertions {
    pub fn decode_anomalies(messages: &[Vec<u8>]) -> Result<Vec<AnomalyRecord>> {
        messages
            .iter()
            .map(|bytes| serde_json::from_slice(bytes).map_err(Into::into))
            .collect()
    }

    pub fn decode_news(messages: &[Vec<u8>]) -> Result<Vec<NewsMessage>> {
        messages
            .iter()
            .map(|bytes| serde_json::from_slice(bytes).map_err(Into::into))
            .collect()
    }

    /// Asserts exactly one anomaly record with the given kind and source
    pub fn assert_single_anomaly(
        records: &[AnomalyRecord],
        kind: AnomalyKind,
        source: &str,
    ) -> Result<()> {
        match records {
            [record] if record.kind == kind && record.source.as_deref() == Some(source) => Ok(()),
            _ => Err(anyhow!(
                "Expected one {kind} anomaly from '{source}', got: {records:?}"
            )),
        }
    }
}

/// Polls `condition` until it holds, failing after `timeout`.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> Result<()>
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    loop {
        if condition() {
            return Ok(());
        }
        if start.elapsed() > timeout {
            return Err(anyhow!("Timeout after {:?} waiting for condition", timeout));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
