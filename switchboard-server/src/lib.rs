//! HTTP surface for the broker.
//!
//! Thin axum layer over [`switchboard_engine::Router`]: request validation
//! and status mapping happen here, scheduling happens in the engine.
//! Malformed bodies never reach the engine; provider failures surface as
//! 502 with the propagated message; an empty candidate set is 503.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use switchboard_common::ChatMessage;
use switchboard_engine::router::{RoutedResponse, TargetRef};
use switchboard_engine::{Router, RouterError, TargetSpec, TokenEstimator};
use switchboard_llm::{DEFAULT_IMAGE_MODEL, PROVIDER_MISTRAL};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

pub const DEFAULT_IMAGE_PROMPT: &str = "Analyze this image and describe what you see.";

pub struct AppState {
    pub router: Arc<Router>,
    pub estimator: Arc<dyn TokenEstimator>,
}

pub fn app(state: Arc<AppState>) -> axum::Router {
    axum::Router::new()
        .route("/", get(liveness))
        .route("/health", get(liveness))
        .route("/ask", post(ask))
        .route("/analyze-image", post(analyze_image))
        .route("/queue/status", get(queue_status))
        .route("/usage", get(usage))
        .route("/models", get(models))
        .route("/estimate-tokens", get(estimate_tokens))
        .route("/admin/reload-keys", post(reload_keys))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until the listener is closed or the task is dropped.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> anyhow::Result<()> {
    tracing::info!(addr = %listener.local_addr()?, "server.listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

enum ApiError {
    InvalidRequest(String),
    Router(RouterError),
}

impl From<RouterError> for ApiError {
    fn from(err: RouterError) -> Self {
        Self::Router(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::InvalidRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Router(err) => {
                let status = match &err {
                    RouterError::NoAvailableProvider => StatusCode::SERVICE_UNAVAILABLE,
                    RouterError::UnknownProvider(_) | RouterError::ReloadUnsupported => {
                        StatusCode::BAD_REQUEST
                    }
                    _ => StatusCode::BAD_GATEWAY,
                };
                (status, err.to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

async fn liveness() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Deserialize)]
struct AskRequest {
    history: Vec<ChatMessage>,
    model: TargetSpec,
}

async fn ask(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AskRequest>,
) -> Result<Json<Value>, ApiError> {
    if request.history.is_empty() {
        return Err(ApiError::InvalidRequest("history must not be empty".into()));
    }
    if request.history.iter().any(|m| m.content.trim().is_empty()) {
        return Err(ApiError::InvalidRequest(
            "history entries must carry content".into(),
        ));
    }

    let routed = state
        .router
        .dispatch_chat(&request.model, request.history)
        .await?;
    let providers = provider_overview(&state.router).await;
    Ok(Json(routed_body("response", routed, providers)))
}

#[derive(Deserialize)]
struct AnalyzeImageRequest {
    image: String,
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default)]
    model: Option<TargetSpec>,
}

async fn analyze_image(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AnalyzeImageRequest>,
) -> Result<Json<Value>, ApiError> {
    if !looks_like_base64(&request.image) {
        return Err(ApiError::InvalidRequest(
            "image must be base64-encoded".into(),
        ));
    }

    let spec = request.model.unwrap_or_else(|| {
        TargetSpec::One(TargetRef {
            provider: Some(PROVIDER_MISTRAL.to_string()),
            model: DEFAULT_IMAGE_MODEL.to_string(),
        })
    });
    let prompt = request
        .prompt
        .filter(|p| !p.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_IMAGE_PROMPT.to_string());

    let routed = state
        .router
        .dispatch_image(&spec, request.image, prompt)
        .await?;
    let providers = provider_overview(&state.router).await;
    Ok(Json(routed_body("analysis", routed, providers)))
}

fn routed_body(text_field: &str, routed: RoutedResponse, providers: Value) -> Value {
    let mut body = serde_json::Map::new();
    body.insert(text_field.to_string(), Value::String(routed.response.text));
    body.insert("provider".into(), Value::String(routed.provider));
    body.insert("model".into(), Value::String(routed.model));
    body.insert("providers".into(), providers);
    Value::Object(body)
}

async fn provider_overview(router: &Router) -> Value {
    let totals = router.provider_queue_totals().await;
    Value::Object(
        totals
            .into_iter()
            .map(|(provider, total)| (provider, json!({ "totalQueueLength": total })))
            .collect(),
    )
}

async fn queue_status(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!(state.router.queue_status().await))
}

async fn usage(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!(state.router.usage_report().await))
}

async fn models(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!(state.router.models().await))
}

#[derive(Deserialize)]
struct EstimateTokensParams {
    #[serde(default)]
    text: String,
    #[serde(default)]
    model: Option<String>,
}

async fn estimate_tokens(
    State(state): State<Arc<AppState>>,
    Query(params): Query<EstimateTokensParams>,
) -> Json<Value> {
    let estimated = state.estimator.estimate(&params.text);
    Json(json!({
        "model": params.model,
        "textLength": params.text.chars().count(),
        "estimatedTokens": estimated,
    }))
}

#[derive(Deserialize)]
struct ReloadParams {
    provider: String,
}

async fn reload_keys(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ReloadParams>,
) -> Result<Json<Value>, ApiError> {
    let reloaded = state.router.reload(&params.provider).await?;
    Ok(Json(json!({ "reloaded": reloaded })))
}

fn looks_like_base64(raw: &str) -> bool {
    !raw.is_empty()
        && raw
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'=' | b'\n' | b'\r'))
}
