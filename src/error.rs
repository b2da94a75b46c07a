//! Error types and HTTP error response handling.
//!
//! Three layers, innermost first:
//!
//! - `StoreError`: the persistence layer failed or returned an unusable row
//! - `VerifyError`: the verification engine could not reach a decision
//! - `AppError`: what the HTTP surface reports, with status code and JSON body

use std::time::Duration;

use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;

/// A rate-limit policy or window state that cannot be enforced.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("unknown rate limit type `{0}`")]
    UnknownKind(String),

    #[error("rate limit {field} must be positive, got {value}")]
    NonPositive { field: &'static str, value: i64 },

    #[error("rate limit policy is partially set")]
    Partial,

    #[error("rate limit window state is partially set")]
    PartialWindow,
}

/// Persistence layer failure.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database operation failed (connection, query, pool exhaustion).
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored row violates the key record invariants.
    #[error("Invalid key record {id}: {reason}")]
    InvalidRecord { id: String, reason: String },

    #[error("Key {0} already exists")]
    DuplicateKey(String),
}

/// Reasons the verification engine returns no decision at all.
///
/// Denials (expired, exhausted, rate limited) are decisions, not errors.
/// Everything here is either permanent for the identifier (`NotFound`,
/// `InvalidRecord`) or retryable by the caller (`Contention`,
/// `StoreUnavailable`). None of them ever turns into an allow.
#[derive(Debug, Clone, thiserror::Error)]
pub enum VerifyError {
    #[error("Key not found")]
    NotFound,

    /// Concurrent debits kept winning the conditional write, or a write
    /// timed out with an unknown outcome.
    #[error("Key is under contention after {attempts} attempt(s)")]
    Contention { attempts: u32 },

    #[error("Key store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Invalid key record {id}: {reason}")]
    InvalidRecord { id: String, reason: String },
}

impl VerifyError {
    /// Whether the caller may retry the same call later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            VerifyError::Contention { .. } | VerifyError::StoreUnavailable(_)
        )
    }
}

impl From<StoreError> for VerifyError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidRecord { id, reason } => VerifyError::InvalidRecord { id, reason },
            other => VerifyError::StoreUnavailable(other.to_string()),
        }
    }
}

/// Application-wide HTTP error type.
///
/// # Status Code Mapping
///
/// - `InvalidRequest` → 400 Bad Request
/// - `KeyNotFound` → 404 Not Found
/// - `Contention` → 503 Service Unavailable with `Retry-After`
/// - `StoreUnavailable` → 503 Service Unavailable (hides details from client)
/// - `Internal` → 500 Internal Server Error (hides details from client)
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Invalid request")]
    InvalidRequest(String),

    #[error("Key not found")]
    KeyNotFound,

    #[error("Key is busy, retry the request")]
    Contention,

    #[error("Key store unavailable")]
    StoreUnavailable(String),

    #[error("An internal error occurred")]
    Internal(String),
}

impl From<VerifyError> for AppError {
    fn from(err: VerifyError) -> Self {
        match err {
            VerifyError::NotFound => AppError::KeyNotFound,
            VerifyError::Contention { .. } => AppError::Contention,
            VerifyError::StoreUnavailable(reason) => AppError::StoreUnavailable(reason),
            invalid @ VerifyError::InvalidRecord { .. } => AppError::Internal(invalid.to_string()),
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        VerifyError::from(err).into()
    }
}

/// Malformed or mistyped request bodies get the standard error body too.
impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::InvalidRequest(rejection.body_text())
    }
}

const CONTENTION_RETRY_AFTER: Duration = Duration::from_secs(1);

/// Convert AppError into an HTTP response.
///
/// # Response Format
///
/// ```json
/// {
///   "error": {
///     "code": "error_type",
///     "message": "Human-readable error message"
///   }
/// }
/// ```
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            AppError::InvalidRequest(ref msg) => {
                (StatusCode::BAD_REQUEST, "invalid_request", msg.clone())
            }
            AppError::KeyNotFound => (StatusCode::NOT_FOUND, "key_not_found", self.to_string()),
            AppError::Contention => (
                StatusCode::SERVICE_UNAVAILABLE,
                "contention",
                self.to_string(),
            ),
            AppError::StoreUnavailable(ref reason) => {
                tracing::error!(%reason, "key store unavailable");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "store_unavailable",
                    self.to_string(),
                )
            }
            AppError::Internal(ref reason) => {
                tracing::error!(%reason, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    self.to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message
            }
        }));

        if code == "contention" {
            let retry_after = CONTENTION_RETRY_AFTER.as_secs().to_string();
            return (status, [(header::RETRY_AFTER, retry_after)], body).into_response();
        }

        (status, body).into_response()
    }
}
