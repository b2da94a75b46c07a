//! Request and response bodies for `POST /v1/keys/verify`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::decision::{Decision, DecisionCode};

/// Request body for verifying a key.
///
/// # JSON Example
///
/// ```json
/// {
///   "keyId": "key_3ZZ7faUrkfv1YAhffAcnKW",
///   "cost": 1
/// }
/// ```
///
/// Exactly one of `keyId` (an already resolved identifier) or `key`
/// (the raw bearer secret) must be present.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyKeyRequest {
    pub key_id: Option<String>,

    pub key: Option<String>,

    /// Budget units to debit (defaults to 1, 0 checks without debiting)
    #[serde(default = "default_cost")]
    pub cost: u32,
}

fn default_cost() -> u32 {
    1
}

/// Rate-limit section of the verification response.
#[derive(Debug, Serialize)]
pub struct RateLimitBody {
    pub limit: i64,
    pub remaining: i64,
    pub reset: DateTime<Utc>,
}

/// Response body for a verification.
///
/// # JSON Example
///
/// ```json
/// {
///   "valid": true,
///   "code": "VALID",
///   "ownerId": "user_123",
///   "remaining": 41,
///   "ratelimit": { "limit": 10, "remaining": 9, "reset": "2025-12-20T10:00:01Z" }
/// }
/// ```
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyKeyResponse {
    pub valid: bool,

    pub code: DecisionCode,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ratelimit: Option<RateLimitBody>,
}

impl From<Decision> for VerifyKeyResponse {
    fn from(decision: Decision) -> Self {
        Self {
            valid: decision.allowed(),
            code: decision.code,
            owner_id: decision.owner_id,
            meta: decision.meta,
            expires: decision.expires_at,
            remaining: decision.remaining,
            ratelimit: decision.ratelimit.map(|status| RateLimitBody {
                limit: status.limit,
                remaining: status.remaining,
                reset: status.reset_at,
            }),
        }
    }
}
