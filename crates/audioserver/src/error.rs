use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::{acquire::AcquisitionError, library::DeleteError};

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    /// A required external tool is missing.
    Unavailable { error: String, suggestion: String },
    Internal(anyhow::Error),
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        Self::Internal(value)
    }
}

impl From<AcquisitionError> for AppError {
    fn from(value: AcquisitionError) -> Self {
        match value {
            AcquisitionError::UnsupportedUrl => Self::BadRequest(value.to_string()),
            AcquisitionError::DownloaderMissing => Self::Unavailable {
                error: "yt-dlp is not installed".to_string(),
                suggestion: value.to_string(),
            },
        }
    }
}

impl From<DeleteError> for AppError {
    fn from(value: DeleteError) -> Self {
        match value {
            DeleteError::InvalidName => Self::BadRequest(value.to_string()),
            DeleteError::NotFound => Self::NotFound(value.to_string()),
            DeleteError::Io(err) => Self::Internal(err.into()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, json!({ "error": msg })),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, json!({ "error": msg })),
            Self::Unavailable { error, suggestion } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": error, "suggestion": suggestion }),
            ),
            Self::Internal(err) => {
                tracing::error!("request failed: {err:#}");
                (StatusCode::INTERNAL_SERVER_ERROR, json!({ "error": err.to_string() }))
            }
        };
        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
