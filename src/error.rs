use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Request-level errors surfaced over the HTTP boundary.
///
/// Anything that goes wrong during vectorization or inference is reported as
/// a 500 with the underlying message; it never takes the process down.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Invalid model name '{requested}'. Allowed values: {loaded:?}")]
    UnknownModel {
        requested: String,
        loaded: Vec<String>,
    },
    #[error(transparent)]
    Inference(#[from] anyhow::Error),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::UnknownModel { .. } => StatusCode::BAD_REQUEST,
            ApiError::Inference(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({ "detail": self.to_string() }));
        (status, body).into_response()
    }
}
