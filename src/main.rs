//! Chatstream ingestion API.
//!
//! Accepts events over HTTP and appends them to their home streams. The
//! worker binary consumes them.

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::env;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use chatstream::config::ChatstreamConfig;
use chatstream::event::{ClientNotification, Event};
use chatstream::producer::Producer;
use chatstream::shutdown::ShutdownSignal;
use chatstream::store::RedisStore;

/// Application metrics
struct Metrics {
    events_received: AtomicU64,
    events_rejected: AtomicU64,
    notifications_sent: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    fn new() -> Self {
        Self {
            events_received: AtomicU64::new(0),
            events_rejected: AtomicU64::new(0),
            notifications_sent: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

#[derive(Clone)]
struct AppState {
    store: RedisStore,
    producer: Producer,
    api_key: String,
    metrics: Arc<Metrics>,
}

/// Body of `POST /api/v1/events`.
#[derive(Debug, Deserialize)]
struct EventRequest {
    kind: String,
    #[serde(default)]
    payload: Value,
}

/// Body of `POST /api/v1/notifications`.
#[derive(Debug, Deserialize)]
struct NotificationRequest {
    users: Vec<String>,
    notification: ClientNotification,
}

/// Response returned when an event is successfully accepted.
#[derive(Debug, Serialize, Deserialize)]
struct EventResponse {
    /// Stream entry id assigned to the event
    id: String,
    /// Stream the event was appended to
    stream: String,
    status: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct NotificationResponse {
    ids: Vec<String>,
    status: String,
}

type ApiError = (StatusCode, Json<Value>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Initialize Logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    dotenvy::dotenv().ok();

    // 2. Setup Configuration
    let config = ChatstreamConfig::load()?;
    let api_key = config
        .server
        .api_key
        .clone()
        .filter(|key| !key.is_empty() && !key.contains("${"))
        .or_else(|| env::var("CHATSTREAM_API_KEY").ok())
        .unwrap_or_else(|| {
            warn!("No API key configured, defaulting to 'dev-key'. DO NOT USE IN PRODUCTION.");
            "dev-key".to_string()
        });

    // 3. Setup Redis Pool
    let store = RedisStore::from_url(&config.redis.url)?;
    let producer =
        Producer::new(Arc::new(store.clone())).with_max_len(config.streams.max_len);

    let app_state = Arc::new(AppState {
        store,
        producer,
        api_key,
        metrics: Arc::new(Metrics::new()),
    });

    // 4. Build Router with Auth Middleware
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(get_metrics))
        .route("/api/v1/events", post(emit_event))
        .route("/api/v1/notifications", post(emit_notifications))
        .layer(middleware::from_fn_with_state(app_state.clone(), auth_middleware))
        .with_state(app_state);

    // 5. Start Server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Chatstream API listening on {}", addr);

    let shutdown = ShutdownSignal::new();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    // Skip auth for health check and metrics
    let path = req.uri().path();
    if path == "/health" || path == "/metrics" {
        return Ok(next.run(req).await);
    }

    let auth_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|header| header.to_str().ok());

    match auth_header.and_then(|value| value.strip_prefix("Bearer ")) {
        Some(token) if token == state.api_key => Ok(next.run(req).await),
        Some(_) => {
            warn!("Invalid API Key attempt");
            Err(StatusCode::UNAUTHORIZED)
        }
        None => {
            warn!("Missing or malformed Authorization header");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

async fn health_check(State(state): State<Arc<AppState>>) -> Result<Json<Value>, StatusCode> {
    state.store.ping().await.map_err(|e| {
        error!("Redis PING failed: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Ok(Json(json!({ "status": "ok", "redis": "connected" })))
}

/// Get metrics endpoint - returns server metrics as JSON
async fn get_metrics(State(state): State<Arc<AppState>>) -> Json<Value> {
    let uptime = state.metrics.uptime_seconds();

    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": uptime,
        "events": {
            "received": state.metrics.events_received.load(Ordering::Relaxed),
            "rejected": state.metrics.events_rejected.load(Ordering::Relaxed),
        },
        "notifications": {
            "sent": state.metrics.notifications_sent.load(Ordering::Relaxed),
        },
        "status": "running"
    }))
}

async fn emit_event(
    State(state): State<Arc<AppState>>,
    Json(request): Json<EventRequest>,
) -> Result<(StatusCode, Json<EventResponse>), ApiError> {
    debug!(kind = %request.kind, "Received event");
    state.metrics.events_received.fetch_add(1, Ordering::Relaxed);

    let body = request.payload.to_string();
    let event = Event::decode(&request.kind, Some(&body)).map_err(|e| {
        state.metrics.events_rejected.fetch_add(1, Ordering::Relaxed);
        warn!(kind = %request.kind, error = %e, "Rejected event");
        api_error(StatusCode::BAD_REQUEST, e.to_string())
    })?;

    let stream = event.kind().stream();
    let id = state.producer.publish(&event).await.map_err(|e| {
        error!("Failed to append event: {}", e);
        api_error(StatusCode::INTERNAL_SERVER_ERROR, "failed to append event")
    })?;

    info!(id = %id, kind = %event.kind(), stream = %stream, "Event emitted");

    Ok((
        StatusCode::ACCEPTED,
        Json(EventResponse {
            id,
            stream: stream.to_string(),
            status: "accepted".to_string(),
        }),
    ))
}

async fn emit_notifications(
    State(state): State<Arc<AppState>>,
    Json(request): Json<NotificationRequest>,
) -> Result<(StatusCode, Json<NotificationResponse>), ApiError> {
    let ids = state
        .producer
        .fanout_to_users(&request.users, &request.notification)
        .await
        .map_err(|e| {
            error!("Failed to fan out notification: {}", e);
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "failed to append notification")
        })?;

    state
        .metrics
        .notifications_sent
        .fetch_add(ids.len() as u64, Ordering::Relaxed);

    Ok((
        StatusCode::ACCEPTED,
        Json(NotificationResponse {
            ids,
            status: "accepted".to_string(),
        }),
    ))
}
