use crate::resolver::ResolveError;
use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// Errors surfaced to HTTP clients
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Method not allowed")]
    MethodNotAllowed,

    #[error("Too many requests")]
    RateLimited { retry_after_secs: u64 },

    #[error("{0}")]
    Forbidden(String),

    /// Detail is logged, never returned
    #[error("{public}: {detail}")]
    Infrastructure { public: String, detail: String },
}

impl ApiError {
    pub fn infrastructure(public: impl Into<String>, detail: impl std::fmt::Display) -> Self {
        ApiError::Infrastructure {
            public: public.into(),
            detail: detail.to_string(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::Infrastructure { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        match self {
            ApiError::RateLimited { retry_after_secs } => {
                let mut response = (
                    status,
                    Json(json!({
                        "error": "Too many requests",
                        "retryAfter": retry_after_secs,
                    })),
                )
                    .into_response();
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
                response
            }
            ApiError::Infrastructure { public, detail } => {
                error!(error = %detail, "{}", public);
                (status, Json(json!({ "error": public }))).into_response()
            }
            other => (status, Json(json!({ "error": other.to_string() }))).into_response(),
        }
    }
}

impl From<ResolveError> for ApiError {
    fn from(e: ResolveError) -> Self {
        match e {
            ResolveError::InvalidFilename => ApiError::BadRequest("Invalid filename".to_string()),
            ResolveError::InvalidFileType => ApiError::BadRequest("Invalid file type".to_string()),
            ResolveError::NotFound(kind) => ApiError::NotFound(format!("{} not found", kind.label())),
            ResolveError::Store(e) => ApiError::infrastructure("Failed to serve media", e),
        }
    }
}
