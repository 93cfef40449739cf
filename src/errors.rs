use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt;
use uuid::Uuid;

use crate::models::IdempotencyKey;

/// Application-specific error types.
#[derive(Debug)]
pub enum AppError {
    /// Database-related errors.
    DatabaseError(sqlx::Error),
    /// Resource not found error.
    NotFound(String),
    /// Bad request error (invalid input).
    BadRequest(String),
    /// Request conflicts with the current state of a resource.
    Conflict(String),
    /// Error interacting with an external API.
    ExternalApiError(String),
    /// Internal server error.
    InternalError(String),
    /// Unauthorized access error.
    Unauthorized(String),
    /// Processing could not finish; the caller may retry later.
    Unavailable(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::DatabaseError(e) => write!(f, "Database error: {}", e),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            AppError::ExternalApiError(msg) => write!(f, "External API error: {}", msg),
            AppError::InternalError(msg) => write!(f, "Internal error: {}", msg),
            AppError::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            AppError::Unavailable(msg) => write!(f, "Unavailable: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    /// Maps each error variant to an HTTP status code and JSON body.
    /// Server-side failures are logged; their details are not echoed back.
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            AppError::DatabaseError(e) => {
                tracing::error!("Database error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Database error".to_string(),
                )
            }
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::ExternalApiError(msg) => {
                tracing::error!("External API error: {}", msg);
                (
                    StatusCode::BAD_GATEWAY,
                    "External service error".to_string(),
                )
            }
            AppError::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            AppError::Unauthorized(msg) => {
                tracing::warn!("Unauthorized access: {}", msg);
                (StatusCode::UNAUTHORIZED, "Unauthorized".to_string())
            }
            AppError::Unavailable(msg) => {
                tracing::error!("Service unavailable: {}", msg);
                (StatusCode::SERVICE_UNAVAILABLE, msg.clone())
            }
        };

        let body = Json(json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::DatabaseError(err)
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::ExternalApiError(err.to_string())
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(msg) => AppError::NotFound(msg),
            StoreError::Transient(msg) => AppError::Unavailable(msg),
            other => AppError::InternalError(other.to_string()),
        }
    }
}

impl From<IngestError> for AppError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::AuthenticationFailure(msg) => AppError::Unauthorized(msg),
            IngestError::MalformedPayload(msg) => AppError::BadRequest(msg),
            IngestError::UnknownReview(id) => {
                AppError::NotFound(format!("Review {} not found", id))
            }
            IngestError::InvalidDisposition(msg) => AppError::Conflict(msg),
            e @ IngestError::IngestionFailed { .. } => AppError::Unavailable(e.to_string()),
        }
    }
}

// ============ Storage ============

/// Failures reported by a `LeadStore`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Connection drops, pool timeouts and similar; safe to retry.
    Transient(String),
    /// The customer changed since it was read; the match must be recomputed.
    VersionConflict { customer_id: Uuid },
    /// Another worker already recorded an outcome for this idempotency key.
    AlreadyIngested(IdempotencyKey),
    /// The review is no longer pending.
    ReviewClosed(Uuid),
    NotFound(String),
    /// Anything else the store cannot recover from.
    Fatal(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Transient(msg) => write!(f, "transient storage error: {}", msg),
            StoreError::VersionConflict { customer_id } => {
                write!(f, "customer {} was modified concurrently", customer_id)
            }
            StoreError::AlreadyIngested(key) => write!(f, "lead {} already ingested", key),
            StoreError::ReviewClosed(id) => write!(f, "review {} is already resolved", id),
            StoreError::NotFound(msg) => write!(f, "not found: {}", msg),
            StoreError::Fatal(msg) => write!(f, "storage error: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<sqlx::Error> for StoreError {
    /// Classifies driver errors into retryable and terminal failures.
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_) => StoreError::Transient(err.to_string()),
            sqlx::Error::RowNotFound => StoreError::NotFound(err.to_string()),
            sqlx::Error::Database(db) => match db.code().as_deref() {
                // serialization_failure, deadlock_detected, too_many_connections
                Some("40001") | Some("40P01") | Some("53300") => {
                    StoreError::Transient(err.to_string())
                }
                _ => StoreError::Fatal(err.to_string()),
            },
            _ => StoreError::Fatal(err.to_string()),
        }
    }
}

// ============ Ingestion ============

/// Per-event ingestion failures. None of these affect other events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestError {
    /// Bad or missing signature. Not retried; nothing is persisted.
    AuthenticationFailure(String),
    /// Structural problem with the inbound payload (e.g. no lead id).
    MalformedPayload(String),
    /// Storage kept failing after the retry budget was spent.
    IngestionFailed {
        key: Option<IdempotencyKey>,
        message: String,
    },
    UnknownReview(Uuid),
    InvalidDisposition(String),
}

impl fmt::Display for IngestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngestError::AuthenticationFailure(msg) => write!(f, "authentication failure: {}", msg),
            IngestError::MalformedPayload(msg) => write!(f, "malformed payload: {}", msg),
            IngestError::IngestionFailed {
                key: Some(key),
                message,
            } => write!(f, "ingestion of {} failed: {}", key, message),
            IngestError::IngestionFailed { key: None, message } => {
                write!(f, "ingestion failed: {}", message)
            }
            IngestError::UnknownReview(id) => write!(f, "review {} not found", id),
            IngestError::InvalidDisposition(msg) => write!(f, "invalid review disposition: {}", msg),
        }
    }
}

impl std::error::Error for IngestError {}

impl IngestError {
    /// Stable machine-readable code used in batch responses.
    pub fn code(&self) -> &'static str {
        match self {
            IngestError::AuthenticationFailure(_) => "authentication_failure",
            IngestError::MalformedPayload(_) => "malformed_payload",
            IngestError::IngestionFailed { .. } => "ingestion_failed",
            IngestError::UnknownReview(_) => "unknown_review",
            IngestError::InvalidDisposition(_) => "invalid_disposition",
        }
    }
}
