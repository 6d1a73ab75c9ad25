use std::sync::Arc;

use axum::{
    Json, RequestExt, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Multipart, Request, State, rejection::JsonRejection},
    http::header,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::{
    config::AppConfig,
    error::ServiceError,
    generator::TextGenerator,
    model::{GenerationRequest, GenerationResponse, ModelMetadata},
    transcription::{TranscriptionResponse, TranscriptionService},
};

const AUDIO_FIELD: &str = "audio";

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub generator: Arc<dyn TextGenerator>,
}

#[derive(Clone)]
pub struct TranscribeState {
    pub config: Arc<AppConfig>,
    pub service: Arc<TranscriptionService>,
}

/// Routes for the `local` and `remote` variants.
pub fn build_router(config: Arc<AppConfig>, generator: Arc<dyn TextGenerator>) -> Router {
    let has_metadata = generator.metadata().is_some();
    let state = AppState { config, generator };

    let mut router = Router::new()
        .route("/health", get(health))
        .route("/generate", post(generate));
    if has_metadata {
        router = router.route("/metadata", get(metadata));
    }

    router
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Routes for the `transcribe` variant.
pub fn build_transcription_router(
    config: Arc<AppConfig>,
    service: Arc<TranscriptionService>,
) -> Router {
    let body_limit = config.max_upload_bytes;
    let state = TranscribeState { config, service };

    Router::new()
        .route("/health", get(health))
        .route("/transcribe", post(transcribe))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn health() -> &'static str {
    "ok"
}

async fn generate(
    State(state): State<AppState>,
    payload: Result<Json<GenerationRequest>, JsonRejection>,
) -> Result<Json<GenerationResponse>, ServiceError> {
    let Json(request) =
        payload.map_err(|rejection| ServiceError::BadRequest(rejection.body_text()))?;
    let response = state.generator.generate(request).await?;
    Ok(Json(response))
}

async fn metadata(State(state): State<AppState>) -> Result<Json<ModelMetadata>, ServiceError> {
    state
        .generator
        .metadata()
        .cloned()
        .map(Json)
        .ok_or_else(|| ServiceError::BadRequest("no resident model".into()))
}

async fn transcribe(
    State(state): State<TranscribeState>,
    request: Request,
) -> Result<Json<TranscriptionResponse>, ServiceError> {
    let audio = read_audio_field(request).await?;
    let text = state.service.transcribe(&audio).await?;
    Ok(Json(TranscriptionResponse { text }))
}

/// The bytes of the first non-empty `audio` part of a multipart upload.
async fn read_audio_field(request: Request) -> Result<Bytes, ServiceError> {
    let is_multipart = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.to_ascii_lowercase().starts_with("multipart/form-data"));
    if !is_multipart {
        return Err(ServiceError::MissingAudio);
    }

    // An unparseable form carries no files.
    let Ok(mut multipart) = request.extract::<Multipart, _>().await else {
        return Err(ServiceError::MissingAudio);
    };

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ServiceError::BadRequest(format!("failed reading multipart field: {e}")))?
    {
        if field.name() != Some(AUDIO_FIELD) {
            continue;
        }
        let file_name = field.file_name().map(str::to_string);
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ServiceError::BadRequest(format!("failed reading audio: {e}")))?;
        if !bytes.is_empty() {
            debug!(bytes = bytes.len(), file_name = ?file_name, "received audio upload");
            return Ok(bytes);
        }
    }

    Err(ServiceError::MissingAudio)
}
