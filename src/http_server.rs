use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;
use warp::http::StatusCode;
use warp::reply::{Json, WithStatus};
use warp::{Filter, Rejection, Reply};

use crate::broker::Broker;
use crate::consumer::{LoggingHandler, SubscriptionRegistry};
use crate::core::topology::BrokerLayout;
use crate::core::types::{now_iso8601, NewsItem, ServiceHealth};
use crate::core::NewsPipeline;
use crate::error::PipelineError;
use crate::fetcher::NewsSource;
use crate::monitoring::Metrics;

/// Everything the request handlers need, shared across connections.
pub struct AppState {
    pub pipeline: NewsPipeline,
    pub registry: Arc<SubscriptionRegistry>,
    pub source: Arc<dyn NewsSource>,
    pub broker: Arc<dyn Broker>,
    pub layout: BrokerLayout,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    /// Probes the broker by (re)declaring the anomaly queue.
    pub async fn health(&self) -> ServiceHealth {
        let broker_reachable = match self.broker.ensure(&self.layout.anomaly_topology()).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Health check could not reach broker: {}", e);
                false
            }
        };
        self.metrics.set_broker_health(broker_reachable).await;
        let snapshot = self.metrics.get_snapshot().await;

        ServiceHealth {
            healthy: broker_reachable,
            broker: self.broker.describe(),
            broker_reachable,
            active_subscriptions: self.registry.active_count().await,
            uptime_seconds: snapshot.uptime_seconds,
            last_check: Utc::now(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct PublishRequest {
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SubscribeRequest {
    #[serde(default)]
    pub topic: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NewsQuery {
    topic: Option<String>,
}

pub struct HttpServer {
    state: Arc<AppState>,
    port: u16,
}

impl HttpServer {
    pub fn new(state: Arc<AppState>, port: u16) -> Self {
        Self { state, port }
    }

    /// Serves until `shutdown` is cancelled.
    pub async fn start(
        &self,
        shutdown: CancellationToken,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let (addr, server) = warp::serve(routes(self.state.clone()))
            .try_bind_with_graceful_shutdown(([0, 0, 0, 0], self.port), async move {
                shutdown.cancelled().await
            })?;

        info!("Starting HTTP server on {}", addr);
        server.await;
        info!("HTTP server stopped");
        Ok(())
    }
}

pub fn routes(
    state: Arc<AppState>,
) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    let index = warp::path::end()
        .and(warp::get())
        .and(with_state(state.clone()))
        .map(|state: Arc<AppState>| {
            warp::reply::json(&json!({
                "status": "News pipeline running",
                "broker": state.broker.describe(),
            }))
        });

    let health = warp::path("health")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(health_handler);

    let metrics = warp::path("metrics")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(metrics_handler);

    let publish = warp::path("publish")
        .and(warp::path::end())
        .and(warp::post())
        .and(with_state(state.clone()))
        .and(warp::body::json())
        .and_then(publish_handler);

    let subscribe = warp::path("subscribe")
        .and(warp::path::end())
        .and(warp::post())
        .and(with_state(state.clone()))
        .and(warp::body::json())
        .and_then(subscribe_handler);

    let list_subscriptions = warp::path("subscriptions")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(|state: Arc<AppState>| async move {
            let subscriptions = state.registry.list().await;
            Ok::<_, Infallible>(warp::reply::json(&json!({ "subscriptions": subscriptions })))
        });

    let stop_subscription = warp::path("subscriptions")
        .and(warp::path::param::<Uuid>())
        .and(warp::path::end())
        .and(warp::delete())
        .and(with_state(state.clone()))
        .and_then(stop_subscription_handler);

    let news = warp::path("news")
        .and(warp::path::end())
        .and(warp::get())
        .and(warp::query::<NewsQuery>())
        .and(with_state(state))
        .and_then(news_handler);

    index
        .or(health)
        .or(metrics)
        .or(publish)
        .or(subscribe)
        .or(list_subscriptions)
        .or(stop_subscription)
        .or(news)
        .recover(handle_rejection)
}

fn with_state(
    state: Arc<AppState>,
) -> impl Filter<Extract = (Arc<AppState>,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

fn json_status(body: serde_json::Value, status: StatusCode) -> WithStatus<Json> {
    warp::reply::with_status(warp::reply::json(&body), status)
}

fn required(field: Option<String>) -> Option<String> {
    field.filter(|value| !value.is_empty())
}

async fn health_handler(state: Arc<AppState>) -> Result<WithStatus<Json>, Infallible> {
    let health = state.health().await;
    let status = if health.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    Ok(warp::reply::with_status(warp::reply::json(&health), status))
}

async fn metrics_handler(state: Arc<AppState>) -> Result<impl Reply, Infallible> {
    // Subscriptions can drop to a terminal state between scrapes
    state.registry.active_count().await;

    let metrics_text = match Metrics::get_prometheus_metrics() {
        Ok(metrics_text) => metrics_text,
        Err(e) => {
            error!("Failed to generate Prometheus metrics: {}", e);
            "# Unable to generate metrics".to_string()
        }
    };
    Ok(warp::reply::with_header(
        metrics_text,
        "content-type",
        "text/plain; version=0.0.4; charset=utf-8",
    ))
}

async fn publish_handler(
    state: Arc<AppState>,
    body: PublishRequest,
) -> Result<WithStatus<Json>, Infallible> {
    let (topic, title, content) = match (
        required(body.topic),
        required(body.title),
        required(body.content),
    ) {
        (Some(topic), Some(title), Some(content)) => (topic, title, content),
        _ => {
            return Ok(json_status(
                json!({"error": "Topic, title, and content are required"}),
                StatusCode::BAD_REQUEST,
            ))
        }
    };
    let timestamp = required(body.timestamp).unwrap_or_else(now_iso8601);
    let item = NewsItem::new(topic, title, content, timestamp);

    match state.pipeline.process_news_item(&item).await {
        Ok(report) => {
            match report.anomaly {
                Some(kind) => info!("Published '{}' to '{}' with anomaly {}", item.title, report.topic, kind),
                None => info!("Published '{}' to '{}', no anomaly detected", item.title, report.topic),
            }
            Ok(json_status(
                json!({
                    "status": "ok",
                    "topic": report.topic,
                    "anomaly": report.anomaly.map(|kind| kind.as_str()).unwrap_or("none"),
                    "message": "Published successfully",
                }),
                StatusCode::OK,
            ))
        }
        Err(PipelineError::InvalidTopic(reason)) => Ok(json_status(
            json!({"error": "Invalid topic", "message": reason}),
            StatusCode::BAD_REQUEST,
        )),
        Err(e) => {
            error!("Failed to publish '{}' to '{}': {}", item.title, item.topic, e);
            Ok(json_status(
                json!({"error": "Publish failed", "message": e.to_string()}),
                StatusCode::INTERNAL_SERVER_ERROR,
            ))
        }
    }
}

async fn subscribe_handler(
    state: Arc<AppState>,
    body: SubscribeRequest,
) -> Result<WithStatus<Json>, Infallible> {
    let Some(topic) = required(body.topic) else {
        return Ok(json_status(
            json!({"error": "Topic is required"}),
            StatusCode::BAD_REQUEST,
        ));
    };

    match state.registry.start(&topic, Arc::new(LoggingHandler)).await {
        Ok(id) => Ok(json_status(
            json!({
                "message": format!("Subscribed to {topic} successfully!"),
                "subscription_id": id,
            }),
            StatusCode::OK,
        )),
        Err(PipelineError::InvalidTopic(reason)) => Ok(json_status(
            json!({"error": "Invalid topic", "message": reason}),
            StatusCode::BAD_REQUEST,
        )),
        Err(e) => {
            error!("Failed to subscribe to '{}': {}", topic, e);
            Ok(json_status(
                json!({"error": "Subscribe failed", "message": e.to_string()}),
                StatusCode::INTERNAL_SERVER_ERROR,
            ))
        }
    }
}

async fn stop_subscription_handler(
    id: Uuid,
    state: Arc<AppState>,
) -> Result<WithStatus<Json>, Infallible> {
    match state.registry.stop(id).await {
        Ok(status) => Ok(json_status(json!(status), StatusCode::OK)),
        Err(_) => Ok(json_status(
            json!({"error": "Subscription not found"}),
            StatusCode::NOT_FOUND,
        )),
    }
}

async fn news_handler(
    query: NewsQuery,
    state: Arc<AppState>,
) -> Result<WithStatus<Json>, Infallible> {
    let topic = query
        .topic
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| "general".to_string());
    info!("Fetching news for topic: {}", topic);

    match state.source.top_headlines(&topic).await {
        Ok(articles) => Ok(json_status(json!({ "articles": articles }), StatusCode::OK)),
        Err(e) => {
            let message = e.upstream_message();
            error!("News fetch for '{}' failed: {}", topic, PipelineError::from(e));
            Ok(json_status(
                json!({"error": "News API failed", "message": message}),
                StatusCode::INTERNAL_SERVER_ERROR,
            ))
        }
    }
}

async fn handle_rejection(err: Rejection) -> Result<WithStatus<Json>, Infallible> {
    let (status, message) = if err.is_not_found() {
        (StatusCode::NOT_FOUND, "Not found".to_string())
    } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
        (StatusCode::BAD_REQUEST, format!("Invalid JSON body: {e}"))
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "Method not allowed".to_string())
    } else if err.find::<warp::reject::UnsupportedMediaType>().is_some() {
        (
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "Expected a JSON body".to_string(),
        )
    } else {
        warn!("Unhandled rejection: {:?}", err);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal server error".to_string(),
        )
    };

    Ok(json_status(json!({ "error": message }), status))
}
