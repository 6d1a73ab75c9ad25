use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("startup failed: {0}")]
    Startup(String),
    #[error("adapter composition failed: {0}")]
    Adapter(String),
    #[error("invalid request: {0}")]
    BadRequest(String),
    #[error("No audio file provided")]
    MissingAudio,
    #[error("invalid sampling parameters: {0}")]
    InvalidSampling(String),
    #[error("device resources exhausted: {0}")]
    ResourceExhausted(String),
    #[error("tokenizer error: {0}")]
    Tokenizer(String),
    #[error("chat template error: {0}")]
    Template(String),
    #[error("model execution failed: {0}")]
    Inference(String),
    #[error("upstream service error: {0}")]
    Upstream(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServiceError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::BadRequest(_) | ServiceError::MissingAudio => StatusCode::BAD_REQUEST,
            ServiceError::InvalidSampling(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ServiceError::ResourceExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ServiceError::Startup(_)
            | ServiceError::Adapter(_)
            | ServiceError::Tokenizer(_)
            | ServiceError::Template(_)
            | ServiceError::Inference(_)
            | ServiceError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(%status, error = %self, "request failed");
        }

        let body = serde_json::json!({
            "error": self.to_string(),
        });

        (status, axum::Json(body)).into_response()
    }
}
