use crate::cli::AppConfig;
use crate::models::ChatRequest;
use crate::orchestrator::ChatService;
use crate::providers::error::ProviderError;
use crate::providers::streaming::Frame;
use crate::providers::transport::HttpTransport;
use crate::providers::ProviderRegistry;
use crate::usage::{
    Channel, FanoutUsageSink, JsonlUsageSink, TracingUsageSink, UsageContext, UsageLedger,
    UsageSink,
};
use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router as AxumRouter,
};
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Fragments buffered between the orchestrator and a slow HTTP client
const FRAGMENT_BUFFER: usize = 32;

/// Application state shared across handlers
pub struct AppState {
    pub service: ChatService,
    pub ledger: Arc<UsageLedger>,
}

impl AppState {
    /// Wire registry, transport and usage sinks from configuration
    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let registry = ProviderRegistry::from_configs_with_models(&config.providers, &config.models)
            .map_err(|e| anyhow::anyhow!("Failed to initialize provider registry: {}", e))?;
        info!(
            "📦 Loaded {} providers with {} models",
            registry.list_providers().len(),
            registry.list_models().len()
        );

        let transport = HttpTransport::new(config.transport.to_transport_config())
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {}", e))?;

        let ledger = Arc::new(UsageLedger::new());
        let mut sinks = FanoutUsageSink::new(vec![
            Arc::new(TracingUsageSink) as Arc<dyn UsageSink>,
            ledger.clone(),
        ]);
        if let Some(path) = &config.usage.log_path {
            match JsonlUsageSink::open(path) {
                Ok(sink) => sinks.push(Arc::new(sink)),
                Err(e) => error!("Failed to open usage log {}: {}", path, e),
            }
        }

        Ok(Self {
            service: ChatService::new(Arc::new(registry), Arc::new(transport), Arc::new(sinks)),
            ledger,
        })
    }
}

/// HTTP routes over a prepared state
pub fn build_router(state: Arc<AppState>) -> AxumRouter {
    AxumRouter::new()
        .route("/v1/chat", post(handle_chat))
        .route("/health", get(health_check))
        .route("/api/models", get(get_models))
        .route("/api/usage", get(get_usage))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the HTTP server
pub async fn start_server(config: AppConfig) -> anyhow::Result<()> {
    let state = Arc::new(AppState::from_config(&config)?);
    let app = build_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("🚀 Server listening on {}", addr);

    axum::serve(listener, app).await?;
    Ok(())
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "llm-relay"
    }))
}

/// Configured models and their capabilities
async fn get_models(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.service.registry().list_models())
}

/// Usage totals per model since startup
async fn get_usage(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let totals: serde_json::Map<String, serde_json::Value> = state
        .ledger
        .snapshot()
        .into_iter()
        .map(|(model, totals)| (model, serde_json::json!(totals)))
        .collect();
    Json(serde_json::Value::Object(totals))
}

/// Chat request plus caller attribution
#[derive(Debug, Deserialize)]
struct ChatEnvelope {
    #[serde(flatten)]
    request: ChatRequest,
    #[serde(default)]
    channel: Channel,
    #[serde(default)]
    room_id: Option<String>,
}

/// Run one chat request, as SSE when the caller asked to stream
async fn handle_chat(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Response, AppError> {
    let envelope: ChatEnvelope = serde_json::from_slice(&body)
        .map_err(|e| AppError::BadRequest(format!("Invalid request format: {}", e)))?;
    let ChatEnvelope {
        request,
        channel,
        room_id,
    } = envelope;

    state.service.check(&request)?;

    let mut context = UsageContext::new(channel, request.model.clone());
    context.room_id = room_id;

    if !request.stream {
        let completion = state.service.complete(&request, &context).await;
        if let Some(message) = completion.error {
            return Err(AppError::Upstream(message));
        }
        return Ok(Json(completion).into_response());
    }

    let (tx, rx) = mpsc::channel(FRAGMENT_BUFFER);
    let task_state = state.clone();
    tokio::spawn(async move {
        task_state.service.stream(&request, &context, tx).await;
    });

    // Dropping this body (client disconnect) closes the channel, which the
    // orchestrator treats as an abort
    let events = ReceiverStream::new(rx).map(|fragment| {
        let data = serde_json::to_string(&fragment).unwrap_or_else(|e| {
            serde_json::json!({"isDone": true, "error": e.to_string()}).to_string()
        });
        Ok::<_, Infallible>(Bytes::from(Frame::data(data).to_sse_string()))
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(events))
        .map_err(|e| AppError::Internal(e.to_string()))
}

/// Application error types
#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    Upstream(String),
    Internal(String),
}

impl From<ProviderError> for AppError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::ModelNotSupported(_) => AppError::NotFound(err.to_string()),
            ProviderError::InvalidRequest(_) => AppError::BadRequest(err.to_string()),
            ProviderError::ConfigError(_) => AppError::Internal(err.to_string()),
            _ => AppError::Upstream(err.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Upstream(msg) => (StatusCode::BAD_GATEWAY, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(serde_json::json!({
            "error": {
                "type": "error",
                "message": message
            }
        }));

        (status, body).into_response()
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::Upstream(msg) => write!(f, "Upstream error: {}", msg),
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}
