use crate::artifact_store::{ArtifactReference, RetrievalUrl, StorageError, StorageMode};
use crate::config::{ApiConfig, GenerationConfig};
use crate::controller::{GenerateError, GenerationController};
use crate::engine::EngineTier;
use crate::orchestrator::GenerationRequest;
use crate::usage_store::PgUsageStore;
use anyhow::{Context, Result};
use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};
use uuid::Uuid;

/// Header carrying the authenticated requester, set by the identity layer
pub const USER_ID_HEADER: &str = "x-user-id";

/// Largest width or height accepted from a client
pub const MAX_DIMENSION: u32 = 4096;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<GenerationController>,
    pub defaults: GenerationConfig,
    pub usage_store: Option<Arc<PgUsageStore>>,
}

/// Generation request body
#[derive(Debug, Deserialize)]
pub struct CreateGenerationRequest {
    pub prompt: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub seed: Option<u64>,
    pub negative_prompt: Option<String>,
    pub project_id: Option<Uuid>,
}

/// Generation response
#[derive(Debug, Serialize)]
pub struct GenerationResponse {
    pub reference: ArtifactReference,
    /// URL expiration in seconds (null for permanent URLs)
    pub expires_in: Option<u64>,
    pub url: String,
    pub width: u32,
    pub height: u32,
    pub tier: EngineTier,
    pub degraded: bool,
    pub record_id: Option<Uuid>,
}

/// Query parameters for URL regeneration
#[derive(Debug, Deserialize)]
pub struct ArtifactUrlQuery {
    pub storage_mode: StorageMode,
    pub value: String,
    /// Validity in seconds; defaults to the configured expiry
    pub ttl: Option<u64>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl Into<String>, code: &str) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            code: code.to_string(),
        }),
    )
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig, generated_dir: Option<PathBuf>) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    let mut router = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/v1/generations", post(create_generation))
        .route("/api/v1/artifacts/url", get(artifact_url));

    // Direct-url artifacts are served from the directory they were written to
    if let Some(dir) = generated_dir {
        router = router.nest_service("/generated", ServeDir::new(dir));
    }

    router
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "generation-service"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let Some(store) = state.usage_store else {
        return (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "not_configured"
            })),
        );
    };

    match store.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

fn requester_id(headers: &HeaderMap) -> Result<Uuid, ApiError> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| Uuid::parse_str(value.trim()).ok())
        .ok_or_else(|| {
            api_error(
                StatusCode::BAD_REQUEST,
                format!("Missing or malformed {USER_ID_HEADER} header"),
                "INVALID_USER",
            )
        })
}

fn build_request(
    body: CreateGenerationRequest,
    requester_id: Uuid,
    defaults: &GenerationConfig,
) -> Result<GenerationRequest, ApiError> {
    let prompt = body.prompt.trim();
    if prompt.is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "Prompt must not be empty",
            "INVALID_PROMPT",
        ));
    }

    let width = body.width.unwrap_or(defaults.default_width);
    let height = body.height.unwrap_or(defaults.default_height);
    if width == 0 || height == 0 || width > MAX_DIMENSION || height > MAX_DIMENSION {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            format!("Width and height must be between 1 and {MAX_DIMENSION}"),
            "INVALID_DIMENSIONS",
        ));
    }

    Ok(GenerationRequest::new(prompt, width, height, requester_id, defaults)
        .with_seed(body.seed)
        .with_negative_prompt(body.negative_prompt)
        .with_project(body.project_id))
}

/// Generate, store and return an artifact
#[instrument(skip(state, headers, body))]
async fn create_generation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateGenerationRequest>,
) -> Result<(StatusCode, Json<GenerationResponse>), ApiError> {
    let requester_id = requester_id(&headers)?;
    let request = build_request(body, requester_id, &state.defaults)?;

    let outcome = state
        .controller
        .generate(request)
        .await
        .map_err(|e: GenerateError| api_error(e.status_code(), e.public_message(), e.code()))?;

    Ok((
        StatusCode::CREATED,
        Json(GenerationResponse {
            reference: outcome.reference,
            expires_in: outcome.expires_in,
            url: outcome.url,
            width: outcome.width,
            height: outcome.height,
            tier: outcome.tier,
            degraded: outcome.degraded,
            record_id: outcome.record_id,
        }),
    ))
}

/// Regenerate a retrieval URL for a stored reference
#[instrument(skip(state))]
async fn artifact_url(
    State(state): State<AppState>,
    Query(params): Query<ArtifactUrlQuery>,
) -> Result<Json<RetrievalUrl>, ApiError> {
    let reference = ArtifactReference {
        storage_mode: params.storage_mode,
        value: params.value,
        ttl_hint: None,
    };

    let url = state
        .controller
        .retrieval_url(&reference, params.ttl.map(Duration::from_secs))
        .await
        .map_err(|e| match e {
            StorageError::InvalidTtl(_) | StorageError::ModeMismatch { .. } => {
                api_error(StatusCode::BAD_REQUEST, e.to_string(), "INVALID_REFERENCE")
            }
            _ => {
                error!(error = %e, "Failed to generate retrieval URL");
                api_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to generate retrieval URL",
                    "PRESIGN_ERROR",
                )
            }
        })?;

    Ok(Json(url))
}

/// Start the API server
pub async fn start_api_server(
    router: Router,
    config: &ApiConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting generation API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server error")?;

    Ok(())
}
