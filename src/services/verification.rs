//! Verification engine - decides whether a key may make a request right now.
//!
//! # Flow
//!
//! 1. Load the key through the quota ledger (cache first)
//! 2. Deny `Expired` if `expires_at <= now`
//! 3. Deny `UsageExceeded` if `remaining_requests` cannot cover the cost
//! 4. Deny `RateLimited` if the rate window has no room for the cost
//! 5. Otherwise write the debit, guarded by the version read in step 1
//!
//! A version conflict in step 5 means another verifier debited the same key
//! in between. The whole decision is then recomputed from a fresh read, up to
//! `max_attempts` times, after which the call fails with `Contention`.
//! Denials never write, so a denied call can be repeated without effect.
//! Neither do keys with no remaining-requests budget and no rate limit:
//! there is nothing to meter, so they are allowed without a write.
//!
//! `now` is truncated to whole milliseconds before anything is computed, so
//! the window state cached after a commit is exactly what the store keeps.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::VerifyError;
use crate::models::decision::{Decision, DecisionCode, RateLimitStatus};
use crate::models::key::{KeyDebit, KeyRecord};
use crate::services::ledger::{DebitOutcome, LedgerConfig, QuotaLedger};
use crate::services::rate_window;
use crate::store::KeyStore;

const RETRY_INITIAL_BACKOFF_MS: u64 = 5;
const RETRY_MAX_BACKOFF_MS: u64 = 50;

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Conditional-write attempts per verification, at least 1.
    pub max_attempts: u32,
    pub ledger_ttl: Duration,
    pub ledger_max_entries: usize,
    pub store_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            ledger_ttl: Duration::from_secs(1),
            ledger_max_entries: 100_000,
            store_timeout: Duration::from_millis(500),
        }
    }
}

/// What one pass over a key record concluded.
enum Plan {
    Deny(Decision),
    /// Allowed, and nothing is metered for this key.
    Allow(Decision),
    Debit { debit: KeyDebit, decision: Decision },
}

enum Attempt {
    Done(Decision),
    Conflict,
    /// The debit may have landed; retrying could charge the request twice.
    Indeterminate,
}

pub struct VerificationEngine {
    ledger: QuotaLedger,
    max_attempts: u32,
}

impl VerificationEngine {
    pub fn new(store: Arc<dyn KeyStore>, config: EngineConfig) -> Self {
        let ledger = QuotaLedger::new(
            store,
            LedgerConfig {
                ttl: config.ledger_ttl,
                max_entries: config.ledger_max_entries,
                store_timeout: config.store_timeout,
            },
        );
        Self {
            ledger,
            max_attempts: config.max_attempts.max(1),
        }
    }

    pub fn ledger(&self) -> &QuotaLedger {
        &self.ledger
    }

    /// Authorize a request of `cost` units for `key_id` at `now`.
    ///
    /// # Returns
    ///
    /// A `Decision` for every key that exists and is readable, allowed or
    /// denied. A `cost` of 0 checks the key without writing anything.
    ///
    /// # Errors
    ///
    /// - `NotFound`: no such key
    /// - `Contention`: conflicts outlasted the retry budget, or the debit
    ///   write timed out with an unknown outcome
    /// - `StoreUnavailable`: the store failed or timed out
    /// - `InvalidRecord`: the stored key breaks a record invariant
    pub async fn authorize(
        &self,
        key_id: &str,
        cost: u32,
        now: DateTime<Utc>,
    ) -> Result<Decision, VerifyError> {
        let now = whole_millis(now);
        let mut backoff_ms = RETRY_INITIAL_BACKOFF_MS;

        for attempt in 1..=self.max_attempts {
            let record = self
                .ledger
                .load(key_id, attempt > 1)
                .await?
                .ok_or(VerifyError::NotFound)?;

            match self.decide_and_debit(record, cost, now).await? {
                Attempt::Done(decision) => {
                    debug!(key_id, cost, attempt, code = ?decision.code, "key verified");
                    return Ok(decision);
                }
                Attempt::Conflict if attempt < self.max_attempts => {
                    debug!(key_id, attempt, backoff_ms, "debit lost the race, retrying");
                    tokio::time::sleep(jitter(backoff_ms)).await;
                    backoff_ms = (backoff_ms * 2).min(RETRY_MAX_BACKOFF_MS);
                }
                Attempt::Conflict => {}
                Attempt::Indeterminate => {
                    warn!(key_id, attempt, "debit outcome unknown, not retrying");
                    return Err(VerifyError::Contention { attempts: attempt });
                }
            }
        }

        warn!(key_id, attempts = self.max_attempts, "debit retries exhausted");
        Err(VerifyError::Contention {
            attempts: self.max_attempts,
        })
    }

    /// Authorize by raw bearer secret instead of key identifier.
    ///
    /// The secret is resolved through its SHA-256 digest; an unknown secret
    /// is `NotFound`, exactly like an unknown identifier.
    pub async fn authorize_secret(
        &self,
        secret: &str,
        cost: u32,
        now: DateTime<Utc>,
    ) -> Result<Decision, VerifyError> {
        let record = self
            .ledger
            .load_by_hash(&hash_secret(secret))
            .await?
            .ok_or(VerifyError::NotFound)?;

        self.authorize(&record.id, cost, now).await
    }

    async fn decide_and_debit(
        &self,
        record: KeyRecord,
        cost: u32,
        now: DateTime<Utc>,
    ) -> Result<Attempt, VerifyError> {
        let (debit, decision) = match plan(&record, i64::from(cost), now) {
            Plan::Deny(decision) | Plan::Allow(decision) => return Ok(Attempt::Done(decision)),
            Plan::Debit { debit, decision } => (debit, decision),
        };

        if cost == 0 {
            return Ok(Attempt::Done(decision));
        }

        match self.ledger.debit(&record, debit).await? {
            DebitOutcome::Committed(_) => Ok(Attempt::Done(decision)),
            DebitOutcome::Conflict => Ok(Attempt::Conflict),
            DebitOutcome::NotFound => Err(VerifyError::NotFound),
            DebitOutcome::Indeterminate => Ok(Attempt::Indeterminate),
        }
    }
}

/// Decide a request against one snapshot of a key. Pure.
fn plan(record: &KeyRecord, cost: i64, now: DateTime<Utc>) -> Plan {
    let deny = |code: DecisionCode,
                ratelimit: Option<RateLimitStatus>,
                retry_after: Option<Duration>| {
        Plan::Deny(decision(record, code, record.remaining_requests, ratelimit, retry_after))
    };

    if record.is_expired(now) {
        return deny(DecisionCode::Expired, None, None);
    }

    if let Some(remaining) = record.remaining_requests {
        if remaining <= 0 || remaining < cost {
            return deny(DecisionCode::UsageExceeded, None, None);
        }
    }

    if record.remaining_requests.is_none() && record.ratelimit.is_none() {
        return Plan::Allow(decision(record, DecisionCode::Valid, None, None, None));
    }

    let window = record
        .ratelimit
        .as_ref()
        .map(|policy| (policy, rate_window::evaluate(policy, record.window.as_ref(), now, cost)));

    let status = window.map(|(policy, w)| RateLimitStatus {
        limit: policy.limit(),
        remaining: w.remaining,
        reset_at: w.reset_at,
    });

    if let Some((_, w)) = window {
        if !w.allowed {
            return deny(DecisionCode::RateLimited, status, w.retry_after);
        }
    }

    let remaining = record.remaining_requests.map(|r| r - cost);
    Plan::Debit {
        debit: KeyDebit {
            remaining_requests: remaining,
            window: window.map(|(_, w)| w.state).or(record.window),
        },
        decision: decision(record, DecisionCode::Valid, remaining, status, None),
    }
}

fn decision(
    record: &KeyRecord,
    code: DecisionCode,
    remaining: Option<i64>,
    ratelimit: Option<RateLimitStatus>,
    retry_after: Option<Duration>,
) -> Decision {
    Decision {
        code,
        remaining,
        ratelimit,
        retry_after,
        owner_id: record.owner_id.clone(),
        meta: record.meta.clone(),
        expires_at: record.expires_at,
    }
}

/// Drop sub-millisecond precision; the store keeps no finer than microseconds.
fn whole_millis(now: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

/// SHA-256 hex digest of a bearer secret, as stored in `keys.hash`.
pub fn hash_secret(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

/// Full jitter in `[backoff/2, backoff]` so racing verifiers spread out.
fn jitter(backoff_ms: u64) -> Duration {
    let low = backoff_ms / 2;
    Duration::from_millis(rand::rng().random_range(low..=backoff_ms))
}
