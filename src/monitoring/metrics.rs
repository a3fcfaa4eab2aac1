use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use prometheus::{Counter, CounterVec, Encoder, Gauge, Histogram, Opts, Registry, TextEncoder};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

use crate::core::types::AnomalyKind;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
    static ref NEWS_PUBLISHED_COUNTER: Counter = Counter::new(
        "news_pipeline_news_published_total",
        "Total number of news items published to the news exchange"
    ).unwrap();
    static ref PUBLISH_FAILURES_COUNTER: Counter = Counter::new(
        "news_pipeline_publish_failures_total",
        "Total number of news items that could not be published"
    ).unwrap();
    static ref PUBLISH_DURATION_HISTOGRAM: Histogram = Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "news_pipeline_publish_duration_seconds",
            "Time spent publishing a news item, including connection setup"
        ).buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0])
    ).unwrap();
    static ref BROKER_HEALTHY_GAUGE: Gauge = Gauge::new(
        "news_pipeline_broker_healthy",
        "Broker health as last observed (1=healthy, 0=unhealthy)"
    ).unwrap();
    static ref UPTIME_GAUGE: Gauge = Gauge::new(
        "news_pipeline_uptime_seconds",
        "Application uptime in seconds"
    ).unwrap();

    // Anomaly metrics
    //
    // Labelled by anomaly kind, which is a closed set, so cardinality is bounded.
    static ref ANOMALIES_DETECTED_COUNTER: CounterVec = CounterVec::new(
        Opts::new(
            "news_pipeline_anomalies_detected_total",
            "Total anomalies detected by kind"
        ),
        &["kind"]
    ).unwrap();
    static ref ANOMALIES_ESCALATED_COUNTER: CounterVec = CounterVec::new(
        Opts::new(
            "news_pipeline_anomalies_escalated_total",
            "Total anomalies delivered to the remediation queue by kind"
        ),
        &["kind"]
    ).unwrap();
    static ref ESCALATION_FAILURES_COUNTER: CounterVec = CounterVec::new(
        Opts::new(
            "news_pipeline_escalation_failures_total",
            "Total anomalies that could not be delivered to the remediation queue"
        ),
        &["kind"]
    ).unwrap();

    // Subscriber metrics
    //
    // Not labelled by queue: topics come from API callers, so the set is open.
    static ref MESSAGES_CONSUMED_COUNTER: Counter = Counter::new(
        "news_pipeline_messages_consumed_total",
        "Total messages received from topic queues"
    ).unwrap();
    static ref MESSAGES_ACKED_COUNTER: Counter = Counter::new(
        "news_pipeline_messages_acked_total",
        "Total messages acknowledged after successful handling"
    ).unwrap();
    static ref MESSAGES_REJECTED_COUNTER: Counter = Counter::new(
        "news_pipeline_messages_rejected_total",
        "Total undecodable messages rejected without requeue"
    ).unwrap();
    static ref HANDLER_FAILURES_COUNTER: Counter = Counter::new(
        "news_pipeline_handler_failures_total",
        "Total deliveries requeued because the handler failed"
    ).unwrap();
    static ref ACTIVE_SUBSCRIPTIONS_GAUGE: Gauge = Gauge::new(
        "news_pipeline_active_subscriptions",
        "Number of subscriptions currently consuming"
    ).unwrap();

    // Monitor metrics
    static ref FETCH_OUTCOMES_COUNTER: CounterVec = CounterVec::new(
        Opts::new(
            "news_pipeline_fetch_outcomes_total",
            "News API fetch outcomes by type"
        ),
        &["outcome"]
    ).unwrap();
}

#[derive(Debug, Clone)]
pub struct Metrics {
    news_published: Arc<AtomicU64>,
    publish_failures: Arc<AtomicU64>,
    anomalies_detected: Arc<AtomicU64>,
    anomalies_escalated: Arc<AtomicU64>,
    escalation_failures: Arc<AtomicU64>,
    messages_consumed: Arc<AtomicU64>,
    handler_failures: Arc<AtomicU64>,
    active_subscriptions: Arc<AtomicU64>,

    start_time: DateTime<Utc>,
    broker_healthy: Arc<RwLock<bool>>,
}

impl Metrics {
    pub fn new() -> Self {
        // Registration failures (e.g. a second instance in tests) are logged, not fatal
        REGISTRY
            .register(Box::new(NEWS_PUBLISHED_COUNTER.clone()))
            .unwrap_or_else(|e| warn!("Failed to register NEWS_PUBLISHED_COUNTER: {}", e));
        REGISTRY
            .register(Box::new(PUBLISH_FAILURES_COUNTER.clone()))
            .unwrap_or_else(|e| warn!("Failed to register PUBLISH_FAILURES_COUNTER: {}", e));
        REGISTRY
            .register(Box::new(PUBLISH_DURATION_HISTOGRAM.clone()))
            .unwrap_or_else(|e| warn!("Failed to register PUBLISH_DURATION_HISTOGRAM: {}", e));
        REGISTRY
            .register(Box::new(BROKER_HEALTHY_GAUGE.clone()))
            .unwrap_or_else(|e| warn!("Failed to register BROKER_HEALTHY_GAUGE: {}", e));
        REGISTRY
            .register(Box::new(UPTIME_GAUGE.clone()))
            .unwrap_or_else(|e| warn!("Failed to register UPTIME_GAUGE: {}", e));
        REGISTRY
            .register(Box::new(ANOMALIES_DETECTED_COUNTER.clone()))
            .unwrap_or_else(|e| warn!("Failed to register ANOMALIES_DETECTED_COUNTER: {}", e));
        REGISTRY
            .register(Box::new(ANOMALIES_ESCALATED_COUNTER.clone()))
            .unwrap_or_else(|e| warn!("Failed to register ANOMALIES_ESCALATED_COUNTER: {}", e));
        REGISTRY
            .register(Box::new(ESCALATION_FAILURES_COUNTER.clone()))
            .unwrap_or_else(|e| warn!("Failed to register ESCALATION_FAILURES_COUNTER: {}", e));
        REGISTRY
            .register(Box::new(MESSAGES_CONSUMED_COUNTER.clone()))
            .unwrap_or_else(|e| warn!("Failed to register MESSAGES_CONSUMED_COUNTER: {}", e));
        REGISTRY
            .register(Box::new(MESSAGES_ACKED_COUNTER.clone()))
            .unwrap_or_else(|e| warn!("Failed to register MESSAGES_ACKED_COUNTER: {}", e));
        REGISTRY
            .register(Box::new(MESSAGES_REJECTED_COUNTER.clone()))
            .unwrap_or_else(|e| warn!("Failed to register MESSAGES_REJECTED_COUNTER: {}", e));
        REGISTRY
            .register(Box::new(HANDLER_FAILURES_COUNTER.clone()))
            .unwrap_or_else(|e| warn!("Failed to register HANDLER_FAILURES_COUNTER: {}", e));
        REGISTRY
            .register(Box::new(ACTIVE_SUBSCRIPTIONS_GAUGE.clone()))
            .unwrap_or_else(|e| warn!("Failed to register ACTIVE_SUBSCRIPTIONS_GAUGE: {}", e));
        REGISTRY
            .register(Box::new(FETCH_OUTCOMES_COUNTER.clone()))
            .unwrap_or_else(|e| warn!("Failed to register FETCH_OUTCOMES_COUNTER: {}", e));

        Self {
            news_published: Arc::new(AtomicU64::new(0)),
            publish_failures: Arc::new(AtomicU64::new(0)),
            anomalies_detected: Arc::new(AtomicU64::new(0)),
            anomalies_escalated: Arc::new(AtomicU64::new(0)),
            escalation_failures: Arc::new(AtomicU64::new(0)),
            messages_consumed: Arc::new(AtomicU64::new(0)),
            handler_failures: Arc::new(AtomicU64::new(0)),
            active_subscriptions: Arc::new(AtomicU64::new(0)),
            start_time: Utc::now(),
            broker_healthy: Arc::new(RwLock::new(false)),
        }
    }

    pub fn record_news_published(&self) {
        self.news_published.fetch_add(1, Ordering::Relaxed);
        NEWS_PUBLISHED_COUNTER.inc();
    }

    pub fn record_publish_failure(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
        PUBLISH_FAILURES_COUNTER.inc();
    }

    pub fn record_publish_duration(&self, duration: std::time::Duration) {
        PUBLISH_DURATION_HISTOGRAM.observe(duration.as_secs_f64());
    }

    pub fn record_anomaly_detected(&self, kind: AnomalyKind) {
        self.anomalies_detected.fetch_add(1, Ordering::Relaxed);
        ANOMALIES_DETECTED_COUNTER
            .with_label_values(&[kind.as_str()])
            .inc();
    }

    pub fn record_anomaly_escalated(&self, kind: AnomalyKind) {
        self.anomalies_escalated.fetch_add(1, Ordering::Relaxed);
        ANOMALIES_ESCALATED_COUNTER
            .with_label_values(&[kind.as_str()])
            .inc();
    }

    pub fn record_escalation_failure(&self, kind: AnomalyKind) {
        self.escalation_failures.fetch_add(1, Ordering::Relaxed);
        ESCALATION_FAILURES_COUNTER
            .with_label_values(&[kind.as_str()])
            .inc();
    }

    // Subscriber metrics methods
    pub fn record_message_consumed(&self) {
        self.messages_consumed.fetch_add(1, Ordering::Relaxed);
        MESSAGES_CONSUMED_COUNTER.inc();
    }

    pub fn record_message_acked(&self) {
        MESSAGES_ACKED_COUNTER.inc();
    }

    pub fn record_message_rejected(&self) {
        MESSAGES_REJECTED_COUNTER.inc();
    }

    pub fn record_handler_failure(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
        HANDLER_FAILURES_COUNTER.inc();
    }

    pub fn set_active_subscriptions(&self, count: usize) {
        self.active_subscriptions
            .store(count as u64, Ordering::Relaxed);
        ACTIVE_SUBSCRIPTIONS_GAUGE.set(count as f64);
    }

    pub fn record_fetch_outcome(&self, outcome: &str) {
        FETCH_OUTCOMES_COUNTER.with_label_values(&[outcome]).inc();
    }

    pub async fn set_broker_health(&self, healthy: bool) {
        *self.broker_healthy.write().await = healthy;
        BROKER_HEALTHY_GAUGE.set(if healthy { 1.0 } else { 0.0 });
    }

    pub async fn get_snapshot(&self) -> MetricsSnapshot {
        let uptime = (Utc::now() - self.start_time).num_seconds().max(0) as u64;
        UPTIME_GAUGE.set(uptime as f64);

        MetricsSnapshot {
            total_news_published: self.news_published.load(Ordering::Relaxed),
            total_publish_failures: self.publish_failures.load(Ordering::Relaxed),
            total_anomalies_detected: self.anomalies_detected.load(Ordering::Relaxed),
            total_anomalies_escalated: self.anomalies_escalated.load(Ordering::Relaxed),
            total_escalation_failures: self.escalation_failures.load(Ordering::Relaxed),
            total_messages_consumed: self.messages_consumed.load(Ordering::Relaxed),
            total_handler_failures: self.handler_failures.load(Ordering::Relaxed),
            active_subscriptions: self.active_subscriptions.load(Ordering::Relaxed),
            broker_healthy: *self.broker_healthy.read().await,
            uptime_seconds: uptime,
            start_time: self.start_time,
        }
    }

    pub fn get_prometheus_metrics() -> Result<String, Box<dyn std::error::Error>> {
        let encoder = TextEncoder::new();
        let metric_families = REGISTRY.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    #[cfg(test)]
    pub fn reset_for_tests() {
        NEWS_PUBLISHED_COUNTER.reset();
        PUBLISH_FAILURES_COUNTER.reset();
        ANOMALIES_DETECTED_COUNTER.reset();
        ANOMALIES_ESCALATED_COUNTER.reset();
        ESCALATION_FAILURES_COUNTER.reset();
        MESSAGES_CONSUMED_COUNTER.reset();
        MESSAGES_ACKED_COUNTER.reset();
        MESSAGES_REJECTED_COUNTER.reset();
        HANDLER_FAILURES_COUNTER.reset();
        FETCH_OUTCOMES_COUNTER.reset();
        ACTIVE_SUBSCRIPTIONS_GAUGE.set(0.0);
        BROKER_HEALTHY_GAUGE.set(0.0);
        UPTIME_GAUGE.set(0.0);
        // Note: Histogram types don't support reset()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_news_published: u64,
    pub total_publish_failures: u64,
    pub total_anomalies_detected: u64,
    pub total_anomalies_escalated: u64,
    pub total_escalation_failures: u64,
    pub total_messages_consumed: u64,
    pub total_handler_failures: u64,
    pub active_subscriptions: u64,
    pub broker_healthy: bool,
    pub uptime_seconds: u64,
    pub start_time: DateTime<Utc>,
}
