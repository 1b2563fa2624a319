//! Application error handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

/// Error response structure for consistent API responses
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
    pub message: String,
    pub correlation_id: String,
    pub timestamp: String,
}

/// Application error type covering both pipeline-domain errors (§7) and
/// ambient infrastructure failures.
#[derive(Debug, Error)]
pub enum AppError {
    /// Attempted status transition not reachable from the current status.
    #[error("invalid transition for {entity} {id}: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        id: Uuid,
        from: String,
        to: String,
    },

    /// Song or playlist absent.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: Uuid },

    /// Request aborted by worker cancellation.
    #[error("cancelled")]
    Cancelled,

    /// HTTP/network error from a TextGenerator/ImageGenerator/AudioService adapter.
    #[error("transient external failure calling {endpoint}: {message}")]
    TransientExternalFailure { endpoint: String, message: String },

    /// Adapter returned a structured failure result.
    #[error("permanent external failure calling {endpoint}: {message}")]
    PermanentExternalFailure { endpoint: String, message: String },

    /// AudioQueue resolved `not_found` past the grace period.
    #[error("lost task for song {song_id}")]
    LostTask { song_id: Uuid },

    /// Save-and-finalize failed after the audio already succeeded.
    #[error("archival failure for song {song_id}: {message}")]
    ArchivalFailure { song_id: Uuid, message: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("validation error: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, AppError>;

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::InvalidTransition { .. } => StatusCode::CONFLICT,
            AppError::NotFound { .. } => StatusCode::NOT_FOUND,
            AppError::Cancelled => StatusCode::CONFLICT,
            AppError::TransientExternalFailure { .. } => StatusCode::BAD_GATEWAY,
            AppError::PermanentExternalFailure { .. } => StatusCode::BAD_GATEWAY,
            AppError::LostTask { .. } => StatusCode::GATEWAY_TIMEOUT,
            AppError::ArchivalFailure { .. } => StatusCode::OK,
            AppError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Json(_) => StatusCode::BAD_REQUEST,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::InvalidTransition { .. } => "invalid_transition",
            AppError::NotFound { .. } => "not_found",
            AppError::Cancelled => "cancelled",
            AppError::TransientExternalFailure { .. } => "transient_external_failure",
            AppError::PermanentExternalFailure { .. } => "permanent_external_failure",
            AppError::LostTask { .. } => "lost_task",
            AppError::ArchivalFailure { .. } => "archival_failure",
            AppError::Database(_) => "database_error",
            AppError::Io(_) => "io_error",
            AppError::Config(_) => "config_error",
            AppError::Json(_) => "json_error",
            AppError::Validation(_) => "validation_error",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let correlation_id = Uuid::new_v4().to_string();
        let status = self.status_code();

        match status {
            StatusCode::INTERNAL_SERVER_ERROR | StatusCode::BAD_GATEWAY => {
                tracing::error!(correlation_id = %correlation_id, error = %self, "request failed");
            }
            StatusCode::GATEWAY_TIMEOUT | StatusCode::CONFLICT => {
                tracing::warn!(correlation_id = %correlation_id, error = %self, "request failed");
            }
            _ => {
                tracing::info!(correlation_id = %correlation_id, error = %self, "request failed");
            }
        }

        let body = ErrorResponse {
            error: self.error_code().to_string(),
            error_code: self.error_code().to_string(),
            message: self.to_string(),
            correlation_id,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        (status, Json(json!(body))).into_response()
    }
}
