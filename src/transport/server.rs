//! HTTP service.
//!
//! Routes:
//! - `POST /api/pipeline/run`: streams the run as NDJSON, one event per line
//! - `GET /api/models`, `GET|DELETE /api/models/:run_id`: model registry
//! - `GET|PUT /api/settings`: process-wide settings, applied to new runs
//! - `GET /health`
//!
//! Closing the response stream cancels the run and kills its script.

use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::RegistryError;
use crate::pipeline::{PipelineError, PipelineOrchestrator, PipelineRequest};
use crate::registry::{FsModelRegistry, ModelRegistry};
use crate::settings::{Settings, SettingsStore, REDACTED};

use super::ndjson::{encode_event, TransportError, NDJSON_CONTENT_TYPE};

/// Events buffered between a run and its HTTP response.
const EVENT_BUFFER: usize = 64;

/// Builds an orchestrator from a settings snapshot.
pub type OrchestratorBuilder =
    Arc<dyn Fn(&Settings) -> Result<PipelineOrchestrator, PipelineError> + Send + Sync>;

/// Shared state of the HTTP service.
#[derive(Clone)]
pub struct AppState {
    settings: SettingsStore,
    builder: OrchestratorBuilder,
}

impl AppState {
    /// State that builds production orchestrators from the current settings.
    pub fn new(settings: SettingsStore) -> Self {
        Self {
            settings,
            builder: Arc::new(PipelineOrchestrator::from_settings),
        }
    }

    /// Replaces how orchestrators are built.
    pub fn with_orchestrator_builder(mut self, builder: OrchestratorBuilder) -> Self {
        self.builder = builder;
        self
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    fn registry(&self) -> FsModelRegistry {
        FsModelRegistry::new(self.settings.snapshot().models_dir.clone())
    }
}

/// Error body returned by every failing route.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: u16,
}

fn error_response(status: StatusCode, error: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            code: status.as_u16(),
        }),
    )
        .into_response()
}

fn registry_error(err: RegistryError) -> Response {
    let status = match &err {
        RegistryError::RunNotFound(_) | RegistryError::MetadataMissing(_) => StatusCode::NOT_FOUND,
        RegistryError::InvalidRunId(_) => StatusCode::BAD_REQUEST,
        RegistryError::DuplicateRun(_) => StatusCode::CONFLICT,
        RegistryError::Io(_) | RegistryError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, err.to_string())
}

/// Builds the router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/pipeline/run", post(run_pipeline_handler))
        .route("/api/models", get(list_models_handler))
        .route(
            "/api/models/:run_id",
            get(get_model_handler).delete(delete_model_handler),
        )
        .route(
            "/api/settings",
            get(get_settings_handler).put(put_settings_handler),
        )
        .with_state(state)
}

/// Serves until `shutdown` is cancelled.
pub async fn serve(bind: &str, state: AppState, shutdown: CancellationToken) -> Result<(), TransportError> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, "Listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

/// GET /health
async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// POST /api/pipeline/run
async fn run_pipeline_handler(
    State(state): State<AppState>,
    Json(request): Json<PipelineRequest>,
) -> Response {
    let settings = state.settings.snapshot();
    let orchestrator = match (state.builder)(&settings) {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            warn!(error = %e, "Cannot start pipeline run");
            return error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string());
        }
    };

    let (tx, mut rx) = mpsc::channel(EVENT_BUFFER);
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();

    info!(algorithm = %request.algorithm, "Pipeline run requested");
    tokio::spawn(async move {
        let run = orchestrator.run(request, tx, cancel).await;
        info!(
            run_id = %run.run_id,
            terminal_state = %run.terminal_state,
            attempts = run.attempts.len(),
            "Pipeline run finished"
        );
    });

    let stream = async_stream::stream! {
        // Dropped with the response body, cancelling the run.
        let _guard = guard;
        while let Some(event) = rx.recv().await {
            match encode_event(&event) {
                Ok(line) => yield Ok::<Bytes, std::io::Error>(Bytes::from(line)),
                Err(e) => warn!(error = %e, "Dropping event that failed to encode"),
            }
        }
    };

    (
        [
            (header::CONTENT_TYPE, NDJSON_CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(stream),
    )
        .into_response()
}

/// GET /api/models
async fn list_models_handler(State(state): State<AppState>) -> Response {
    match state.registry().list().await {
        Ok(records) => Json(records).into_response(),
        Err(e) => registry_error(e),
    }
}

/// GET /api/models/:run_id
async fn get_model_handler(State(state): State<AppState>, Path(run_id): Path<String>) -> Response {
    match state.registry().get(&run_id).await {
        Ok(record) => Json(record).into_response(),
        Err(e) => registry_error(e),
    }
}

/// DELETE /api/models/:run_id
async fn delete_model_handler(State(state): State<AppState>, Path(run_id): Path<String>) -> Response {
    match state.registry().delete(&run_id).await {
        Ok(()) => Json(serde_json::json!({ "deleted": run_id })).into_response(),
        Err(e) => registry_error(e),
    }
}

/// GET /api/settings
async fn get_settings_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.settings.snapshot().redacted())
}

/// PUT /api/settings
///
/// A masked API key (as returned by GET) keeps the current key.
async fn put_settings_handler(
    State(state): State<AppState>,
    Json(mut settings): Json<Settings>,
) -> Response {
    if settings.llm.api_key.as_deref() == Some(REDACTED) {
        settings.llm.api_key = state.settings.snapshot().llm.api_key.clone();
    }
    match state.settings.replace(settings) {
        Ok(current) => Json(current.redacted()).into_response(),
        Err(e) => error_response(StatusCode::BAD_REQUEST, e.to_string()),
    }
}
