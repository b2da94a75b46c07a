//! Key record model.
//!
//! A key record is the authoritative state for one issued API key: its
//! identity (secret hash, start marker, owner), its validity window, and
//! the two budget dimensions the verification engine enforces.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PolicyError;

/// Algorithm used to replenish a rate-limit budget.
///
/// Persisted in the `ratelimit_type` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitKind {
    /// `refill_rate` tokens every `refill_interval`, capacity `limit`.
    TokenBucket,
    /// `limit` requests per aligned window of `refill_interval`.
    FixedWindow,
    /// `limit` requests per rolling `refill_interval`, estimated from the
    /// current and the previous window counts.
    SlidingWindow,
}

impl RateLimitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitKind::TokenBucket => "token_bucket",
            RateLimitKind::FixedWindow => "fixed_window",
            RateLimitKind::SlidingWindow => "sliding_window",
        }
    }
}

impl fmt::Display for RateLimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RateLimitKind {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "token_bucket" => Ok(RateLimitKind::TokenBucket),
            "fixed_window" => Ok(RateLimitKind::FixedWindow),
            "sliding_window" => Ok(RateLimitKind::SlidingWindow),
            other => Err(PolicyError::UnknownKind(other.to_string())),
        }
    }
}

/// A replenishing budget attached to a key.
///
/// The four fields are atomic: a key either carries all of them or none.
/// Construct through [`RateLimitPolicy::new`] so the values are validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    kind: RateLimitKind,
    limit: i64,
    refill_rate: i64,
    refill_interval_ms: i64,
}

impl RateLimitPolicy {
    /// Create a validated policy.
    ///
    /// # Errors
    ///
    /// Returns `PolicyError::NonPositive` if any numeric field is zero or negative.
    pub fn new(
        kind: RateLimitKind,
        limit: i64,
        refill_rate: i64,
        refill_interval_ms: i64,
    ) -> Result<Self, PolicyError> {
        for (field, value) in [
            ("limit", limit),
            ("refill_rate", refill_rate),
            ("refill_interval", refill_interval_ms),
        ] {
            if value <= 0 {
                return Err(PolicyError::NonPositive { field, value });
            }
        }

        Ok(Self {
            kind,
            limit,
            refill_rate,
            refill_interval_ms,
        })
    }

    /// Rebuild a policy from its four nullable columns.
    ///
    /// All `None` means the key has no rate limit. A mix of `Some` and `None`
    /// is rejected: a half-written policy must never be enforced.
    pub fn from_columns(
        kind: Option<&str>,
        limit: Option<i64>,
        refill_rate: Option<i64>,
        refill_interval_ms: Option<i64>,
    ) -> Result<Option<Self>, PolicyError> {
        match (kind, limit, refill_rate, refill_interval_ms) {
            (None, None, None, None) => Ok(None),
            (Some(kind), Some(limit), Some(rate), Some(interval)) => {
                Self::new(kind.parse()?, limit, rate, interval).map(Some)
            }
            _ => Err(PolicyError::Partial),
        }
    }

    pub fn kind(&self) -> RateLimitKind {
        self.kind
    }

    pub fn limit(&self) -> i64 {
        self.limit
    }

    pub fn refill_rate(&self) -> i64 {
        self.refill_rate
    }

    pub fn refill_interval_ms(&self) -> i64 {
        self.refill_interval_ms
    }

    pub fn refill_interval(&self) -> TimeDelta {
        TimeDelta::milliseconds(self.refill_interval_ms)
    }

    /// Window state for a key that has never been used: a full budget.
    pub fn initial_state(&self, now: DateTime<Utc>) -> WindowState {
        WindowState {
            tokens: self.limit,
            previous: 0,
            updated_at: now,
        }
    }
}

/// Persisted progress of a rate-limit policy.
///
/// - Token bucket: `tokens` available, `updated_at` is the last refill tick.
/// - Fixed window: `tokens` left in the window, `updated_at` is the window start.
/// - Sliding window: as fixed window, plus `previous` requests counted in the
///   window before the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowState {
    pub tokens: i64,
    pub previous: i64,
    pub updated_at: DateTime<Utc>,
}

impl WindowState {
    /// Rebuild the state from its nullable columns; all three or none.
    pub fn from_columns(
        tokens: Option<i64>,
        previous: Option<i64>,
        updated_at: Option<DateTime<Utc>>,
    ) -> Result<Option<Self>, PolicyError> {
        match (tokens, previous, updated_at) {
            (None, None, None) => Ok(None),
            (Some(tokens), Some(previous), Some(updated_at)) => Ok(Some(Self {
                tokens,
                previous,
                updated_at,
            })),
            _ => Err(PolicyError::PartialWindow),
        }
    }
}

/// The mutable subset of a key written by a successful authorization.
///
/// Values are absolute (the post-debit state), not deltas, so the write
/// can be guarded by the version the decision was computed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDebit {
    pub remaining_requests: Option<i64>,
    pub window: Option<WindowState>,
}

/// Represents a key record from the database.
///
/// # Database Table
///
/// Maps to the `keys` table. Every column except `id`, `hash`, `start`,
/// `created_at` and `version` is nullable; a NULL means the corresponding
/// feature is not in use for this key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyRecord {
    /// Opaque stable identifier, e.g. `key_3ZZ7faUrkfv1YAhffAcnKW`
    pub id: String,

    /// SHA-256 hex digest of the bearer secret
    pub hash: String,

    /// Leading characters of the secret, shown to users to tell keys apart
    pub start: String,

    /// Lookup reference to the owning principal
    pub owner_id: Option<String>,

    /// Owner-defined blob returned verbatim on verification
    pub meta: Option<serde_json::Value>,

    pub created_at: DateTime<Utc>,

    /// Once this instant is reached the key can never be authorized again.
    pub expires_at: Option<DateTime<Utc>>,

    pub ratelimit: Option<RateLimitPolicy>,

    /// Progress of `ratelimit`; `None` until the first debit.
    pub window: Option<WindowState>,

    pub name: Option<String>,

    /// Non-replenishing request budget
    ///
    /// Only ever decreases through verification. Refills are administrative.
    pub remaining_requests: Option<i64>,

    /// Bumped on every write, guards conditional debits.
    pub version: i64,
}

impl KeyRecord {
    /// A key with no expiry and no budget constraints.
    pub fn new(
        id: impl Into<String>,
        hash: impl Into<String>,
        start: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            hash: hash.into(),
            start: start.into(),
            owner_id: None,
            meta: None,
            created_at,
            expires_at: None,
            ratelimit: None,
            window: None,
            name: None,
            remaining_requests: None,
            version: 0,
        }
    }

    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    pub fn with_meta(mut self, meta: serde_json::Value) -> Self {
        self.meta = Some(meta);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_remaining_requests(mut self, remaining: i64) -> Self {
        self.remaining_requests = Some(remaining);
        self
    }

    pub fn with_ratelimit(mut self, policy: RateLimitPolicy) -> Self {
        self.ratelimit = Some(policy);
        self
    }

    pub fn with_window(mut self, window: WindowState) -> Self {
        self.window = Some(window);
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }

    /// The record as it reads after `debit` has been committed.
    pub fn apply(&self, debit: &KeyDebit) -> KeyRecord {
        KeyRecord {
            remaining_requests: debit.remaining_requests,
            window: debit.window,
            version: self.version + 1,
            ..self.clone()
        }
    }
}
