use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Errors surfaced during admission (before the client response has begun).
/// Mid-stream failures never construct this type; they're rendered directly
/// as queued `AgentFrame::Err` items by the stream translator.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("no browser agent is connected")]
    AgentUnavailable,

    #[error("too many concurrent requests")]
    Overloaded,

    #[error("model '{0}' not found")]
    ModelNotFound(String),

    #[error("failed to translate request: {0}")]
    TranslationFailed(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::AgentUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Overloaded => StatusCode::SERVICE_UNAVAILABLE,
            AppError::ModelNotFound(_) => StatusCode::NOT_FOUND,
            AppError::TranslationFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        tracing::warn!(error = %self, status = %status, "admission rejected");
        (status, Json(openai_error_body(&self.to_string()))).into_response()
    }
}

/// The OpenAI-shaped error body, reused for both admission failures and
/// mid-stream error frames.
pub fn openai_error_body(message: &str) -> serde_json::Value {
    json!({
        "error": {
            "message": message,
            "type": "server_error",
            "code": serde_json::Value::Null,
        }
    })
}
