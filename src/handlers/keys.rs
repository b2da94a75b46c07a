//! Key verification HTTP handler.
//!
//! - POST /v1/keys/verify - authorize one request against a key's budget

use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
    http::header,
    response::{IntoResponse, Response},
};
use chrono::Utc;

use super::AppState;
use crate::error::AppError;
use crate::models::decision::DecisionCode;
use crate::models::verify::{VerifyKeyRequest, VerifyKeyResponse};

/// Verify a key and debit its budget.
///
/// # Endpoint
///
/// `POST /v1/keys/verify`
///
/// # Request Body
///
/// ```json
/// { "keyId": "key_3ZZ7faUrkfv1YAhffAcnKW", "cost": 1 }
/// ```
///
/// or, with the raw secret:
///
/// ```json
/// { "key": "sk_live_..." }
/// ```
///
/// # Response
///
/// - **200 OK**: a decision, `valid` tells whether the request may proceed.
///   `RATE_LIMITED` decisions carry a `Retry-After` header when waiting helps.
/// - **400**: neither or both of `keyId` and `key`, or a body that does not parse
/// - **404**: unknown key
/// - **503**: contention or store outage, retry later
pub async fn verify_key(
    State(state): State<AppState>,
    payload: Result<Json<VerifyKeyRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let Json(request) = payload?;
    let now = Utc::now();

    let decision = match (non_empty(&request.key_id), non_empty(&request.key)) {
        (Some(key_id), None) => state.engine.authorize(key_id, request.cost, now).await?,
        (None, Some(secret)) => {
            state
                .engine
                .authorize_secret(secret, request.cost, now)
                .await?
        }
        _ => {
            return Err(AppError::InvalidRequest(
                "Exactly one of keyId or key must be provided".to_string(),
            ));
        }
    };

    let retry_after = match decision.code {
        DecisionCode::RateLimited => decision.retry_after,
        _ => None,
    };
    let body = Json(VerifyKeyResponse::from(decision));

    Ok(match retry_after {
        Some(wait) => {
            // Whole seconds, rounded up so clients never retry too early
            let secs = wait.as_millis().div_ceil(1000).max(1);
            ([(header::RETRY_AFTER, secs.to_string())], body).into_response()
        }
        None => body.into_response(),
    })
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}
