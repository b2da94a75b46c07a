//! Authorization decisions returned by the verification engine.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Outcome of a single authorization.
///
/// Only `Valid` lets the request through. The other codes are denials that
/// did not debit anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionCode {
    Valid,
    /// Permanent until an administrator moves `expires_at`.
    Expired,
    /// `remaining_requests` cannot cover the cost. Permanent until refilled.
    UsageExceeded,
    /// Transient; see `Decision::retry_after`.
    RateLimited,
}

/// Rate-limit telemetry for a key that carries a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitStatus {
    pub limit: i64,
    pub remaining: i64,
    /// When the budget next grows (next refill tick or window boundary).
    pub reset_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub code: DecisionCode,

    /// Post-debit `remaining_requests` when the request was allowed,
    /// otherwise the unchanged value.
    pub remaining: Option<i64>,

    pub ratelimit: Option<RateLimitStatus>,

    /// Set on `RateLimited` when waiting can help.
    pub retry_after: Option<Duration>,

    pub owner_id: Option<String>,
    pub meta: Option<serde_json::Value>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Decision {
    pub fn allowed(&self) -> bool {
        self.code == DecisionCode::Valid
    }
}
