use news_pipeline::{
    AnomalyClassifier, AnomalyEscalator, AppState, Broker, BrokerLayout, Config, HttpServer,
    Metrics, NewsApiClient, NewsMonitor, NewsPipeline, NewsPublisher, NewsSource,
    RabbitMQBroker, Subscriber, SubscriptionRegistry,
};
use anyhow::Context;
use std::fs::OpenOptions;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Optional plain-text copy of the log, appended across restarts
    let activity_log = match std::env::var("ACTIVITY_LOG_FILE") {
        Ok(path) if !path.is_empty() => Some(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("Failed to open activity log {path}"))?,
        ),
        _ => None,
    };

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "news_pipeline=info,warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(activity_log.map(|file| {
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file))
        }))
        .init();

    info!("Starting news pipeline");

    // Load configuration from environment
    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {e}");
        e
    })?;

    config.validate().map_err(|e| {
        error!("Configuration validation failed: {e}");
        e
    })?;

    let broker: Arc<dyn Broker> = Arc::new(RabbitMQBroker::new(
        &config.rabbitmq_url,
        config.prefetch_count,
    ));

    info!("Configuration loaded successfully");
    info!("Broker: {}", broker.describe());
    info!(
        "Exchange: {}, anomaly queue: {}",
        config.exchange_name, config.anomaly_queue
    );
    info!("Poll topics: {:?}", config.poll_topics);

    let metrics = Arc::new(Metrics::new());
    let layout = BrokerLayout::from_config(&config);

    // Declare the anomaly queue and the polled topics up front so nothing
    // published before the first subscriber is lost. Not fatal: every publish
    // declares its own topology again.
    let startup_topology = [
        layout.anomaly_topology(),
        layout.topics_topology(config.poll_topics.iter().map(String::as_str)),
    ];
    let mut broker_healthy = true;
    for topology in &startup_topology {
        if let Err(e) = broker.ensure(topology).await {
            warn!("Startup topology declaration failed: {e}");
            broker_healthy = false;
            break;
        }
    }
    metrics.set_broker_health(broker_healthy).await;

    let pipeline = NewsPipeline::new(
        AnomalyClassifier::from_config(&config),
        NewsPublisher::new(broker.clone(), layout.clone(), metrics.clone()),
        AnomalyEscalator::new(broker.clone(), layout.clone(), metrics.clone()),
        metrics.clone(),
    );
    let registry = Arc::new(SubscriptionRegistry::new(
        Subscriber::new(broker.clone(), layout.clone(), metrics.clone())
            .with_requeue_delay(config.requeue_delay()),
        metrics.clone(),
    ));
    let source: Arc<dyn NewsSource> = Arc::new(NewsApiClient::from_config(&config)?);

    let shutdown_token = CancellationToken::new();

    // Start news monitor
    let monitor_handle = if config.news_api_key.is_empty() {
        warn!("NEWS_API_KEY is not set, background news monitor disabled");
        None
    } else if config.poll_topics.is_empty() {
        warn!("No poll topics configured, background news monitor disabled");
        None
    } else {
        let monitor = NewsMonitor::from_config(&config, source.clone(), pipeline.clone());
        let monitor_token = shutdown_token.clone();
        Some(tokio::spawn(async move {
            info!("Spawning news monitor");
            monitor.run(monitor_token).await;
        }))
    };

    // Start HTTP server
    let state = Arc::new(AppState {
        pipeline,
        registry: registry.clone(),
        source,
        broker,
        layout,
        metrics,
    });
    let http_server = HttpServer::new(state, config.http_port);
    let http_token = shutdown_token.clone();
    let mut http_handle = tokio::spawn(async move {
        if let Err(e) = http_server.start(http_token).await {
            error!("HTTP server error: {e}");
        }
    });

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => warn!("Received Ctrl-C, initiating graceful shutdown..."),
                Err(e) => error!("Failed to listen for ctrl-c: {e}"),
            }
        }
        _ = &mut http_handle => {
            error!("HTTP server exited unexpectedly, shutting down");
        }
    }

    shutdown_token.cancel();

    // Wait for tasks to complete gracefully with timeout
    let shutdown_timeout = config.shutdown_timeout_secs;
    let shutdown_duration = std::time::Duration::from_secs(shutdown_timeout);
    info!("Waiting up to {}s for tasks to complete...", shutdown_timeout);

    match tokio::time::timeout(shutdown_duration, registry.stop_all()).await {
        Ok(()) => info!("All subscriptions stopped"),
        Err(_) => warn!("Subscriptions did not stop within timeout"),
    }

    if let Some(handle) = monitor_handle {
        match tokio::time::timeout(shutdown_duration, handle).await {
            Ok(Ok(())) => info!("News monitor stopped gracefully"),
            Ok(Err(e)) => warn!("News monitor panicked: {e}"),
            Err(_) => warn!("News monitor did not stop within timeout, forcing abort"),
        }
    }

    if !http_handle.is_finished() {
        match tokio::time::timeout(shutdown_duration, http_handle).await {
            Ok(Ok(())) => info!("HTTP server stopped gracefully"),
            Ok(Err(e)) => warn!("HTTP server panicked: {e}"),
            Err(_) => warn!("HTTP server did not stop within timeout, forcing abort"),
        }
    }

    info!("Shutdown complete");
    Ok(())
}
