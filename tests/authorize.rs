//! End-to-end authorization behavior against the in-memory key store.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use key_quota_service::error::{StoreError, VerifyError};
use key_quota_service::models::decision::DecisionCode;
use key_quota_service::models::key::{
    KeyDebit, KeyRecord, RateLimitKind, RateLimitPolicy, WindowState,
};
use key_quota_service::services::verification::{EngineConfig, VerificationEngine, hash_secret};
use key_quota_service::store::{KeyStore, MemoryKeyStore, WriteOutcome};

fn t0() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

fn key(id: &str) -> KeyRecord {
    KeyRecord::new(id, hash_secret(&format!("sk_{id}")), "sk_", t0())
}

fn config(max_attempts: u32) -> EngineConfig {
    EngineConfig {
        max_attempts,
        ledger_ttl: Duration::from_secs(60),
        ledger_max_entries: 1_000,
        store_timeout: Duration::from_millis(100),
    }
}

async fn engine_with(keys: &[KeyRecord], max_attempts: u32) -> (Arc<VerificationEngine>, Arc<MemoryKeyStore>) {
    let store = Arc::new(MemoryKeyStore::new());
    for k in keys {
        store.insert(k).await.unwrap();
    }
    let engine = Arc::new(VerificationEngine::new(store.clone(), config(max_attempts)));
    (engine, store)
}

#[derive(Debug, Clone, Copy)]
enum Fault {
    FailReads,
    SlowReads(Duration),
    AlwaysConflict,
    FailWrites,
    SlowWrites(Duration),
}

/// Wraps a memory store and injects one kind of failure.
struct FaultyStore {
    inner: MemoryKeyStore,
    fault: Fault,
    writes: AtomicUsize,
}

impl FaultyStore {
    async fn new(keys: &[KeyRecord], fault: Fault) -> Arc<Self> {
        let inner = MemoryKeyStore::new();
        for k in keys {
            inner.insert(k).await.unwrap();
        }
        Arc::new(Self {
            inner,
            fault,
            writes: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl KeyStore for FaultyStore {
    async fn get(&self, key_id: &str) -> Result<Option<KeyRecord>, StoreError> {
        match self.fault {
            Fault::FailReads => return Err(StoreError::Database(sqlx::Error::PoolTimedOut)),
            Fault::SlowReads(delay) => tokio::time::sleep(delay).await,
            _ => {}
        }
        self.inner.get(key_id).await
    }

    async fn find_by_hash(&self, hash: &str) -> Result<Option<KeyRecord>, StoreError> {
        self.inner.find_by_hash(hash).await
    }

    async fn insert(&self, record: &KeyRecord) -> Result<(), StoreError> {
        self.inner.insert(record).await
    }

    async fn update(&self, record: &KeyRecord) -> Result<WriteOutcome, StoreError> {
        self.inner.update(record).await
    }

    async fn conditional_update(
        &self,
        key_id: &str,
        expected_version: i64,
        debit: &KeyDebit,
    ) -> Result<WriteOutcome, StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        match self.fault {
            Fault::AlwaysConflict => Ok(WriteOutcome::VersionConflict),
            Fault::FailWrites => Err(StoreError::Database(sqlx::Error::PoolClosed)),
            Fault::SlowWrites(delay) => {
                // Lands after the caller gave up waiting
                let outcome = self
                    .inner
                    .conditional_update(key_id, expected_version, debit)
                    .await;
                tokio::time::sleep(delay).await;
                outcome
            }
            Fault::FailReads | Fault::SlowReads(_) => {
                self.inner
                    .conditional_update(key_id, expected_version, debit)
                    .await
            }
        }
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[tokio::test]
async fn remaining_requests_admit_exactly_r() {
    let (engine, store) = engine_with(&[key("key_1").with_remaining_requests(5)], 3).await;

    for expected in (0..5).rev() {
        let decision = engine.authorize("key_1", 1, t0()).await.unwrap();
        assert!(decision.allowed());
        assert_eq!(decision.remaining, Some(expected));
    }

    let denied = engine.authorize("key_1", 1, t0()).await.unwrap();
    assert_eq!(denied.code, DecisionCode::UsageExceeded);
    assert_eq!(
        store.get("key_1").await.unwrap().unwrap().remaining_requests,
        Some(0)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_workers_never_over_admit() {
    let (engine, store) = engine_with(&[key("key_1").with_remaining_requests(5)], 10).await;

    let mut handles = Vec::new();
    for _ in 0..20 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine.authorize("key_1", 1, t0()).await
        }));
    }

    let mut allowed = 0;
    for handle in handles {
        let decision = handle.await.unwrap().unwrap();
        if decision.allowed() {
            allowed += 1;
        } else {
            assert_eq!(decision.code, DecisionCode::UsageExceeded);
        }
    }

    assert_eq!(allowed, 5);
    let stored = store.get("key_1").await.unwrap().unwrap();
    assert_eq!(stored.remaining_requests, Some(0));
    assert_eq!(stored.version, 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn last_unit_goes_to_exactly_one_caller() {
    let (engine, store) = engine_with(&[key("key_1").with_remaining_requests(1)], 3).await;

    let (a, b) = tokio::join!(
        engine.authorize("key_1", 1, t0()),
        engine.authorize("key_1", 1, t0())
    );

    let outcomes = [a, b];
    let successes = outcomes
        .iter()
        .filter(|r| matches!(r, Ok(d) if d.allowed()))
        .count();
    assert_eq!(successes, 1);
    for outcome in &outcomes {
        match outcome {
            Ok(d) if d.allowed() => {}
            Ok(d) => assert_eq!(d.code, DecisionCode::UsageExceeded),
            Err(e) => assert!(matches!(e, VerifyError::Contention { .. })),
        }
    }
    assert_eq!(
        store.get("key_1").await.unwrap().unwrap().remaining_requests,
        Some(0)
    );
}

#[tokio::test]
async fn token_bucket_refills_over_time() {
    let policy = RateLimitPolicy::new(RateLimitKind::TokenBucket, 10, 1, 1_000).unwrap();
    let empty = WindowState {
        tokens: 0,
        previous: 0,
        updated_at: t0(),
    };
    let (engine, _) = engine_with(&[key("key_1").with_ratelimit(policy).with_window(empty)], 3).await;

    let later = t0() + TimeDelta::seconds(5);
    for expected in (0..5).rev() {
        let decision = engine.authorize("key_1", 1, later).await.unwrap();
        assert!(decision.allowed());
        assert_eq!(decision.ratelimit.unwrap().remaining, expected);
    }

    let denied = engine.authorize("key_1", 1, later).await.unwrap();
    assert_eq!(denied.code, DecisionCode::RateLimited);
    assert!(denied.retry_after.unwrap() <= Duration::from_secs(1));
}

#[tokio::test]
async fn expired_key_is_always_denied() {
    let expired = key("key_1")
        .with_expires_at(t0())
        .with_remaining_requests(100);
    let (engine, store) = engine_with(&[expired], 3).await;

    for offset in [0, 1, 3_600] {
        let decision = engine
            .authorize("key_1", 1, t0() + TimeDelta::seconds(offset))
            .await
            .unwrap();
        assert_eq!(decision.code, DecisionCode::Expired);
    }
    assert_eq!(store.get("key_1").await.unwrap().unwrap().version, 0);
}

#[tokio::test]
async fn denied_calls_do_not_debit() {
    let policy = RateLimitPolicy::new(RateLimitKind::FixedWindow, 1, 1, 60_000).unwrap();
    let (engine, store) = engine_with(
        &[key("key_1").with_remaining_requests(10).with_ratelimit(policy)],
        3,
    )
    .await;

    assert!(engine.authorize("key_1", 1, t0()).await.unwrap().allowed());
    let after_first = store.get("key_1").await.unwrap().unwrap();

    for _ in 0..5 {
        let decision = engine.authorize("key_1", 1, t0()).await.unwrap();
        assert_eq!(decision.code, DecisionCode::RateLimited);
        assert_eq!(decision.remaining, Some(9));
    }

    assert_eq!(store.get("key_1").await.unwrap().unwrap(), after_first);
}

#[tokio::test]
async fn zero_cost_checks_without_writing() {
    let (engine, store) = engine_with(&[key("key_1").with_remaining_requests(3)], 3).await;

    let decision = engine.authorize("key_1", 0, t0()).await.unwrap();

    assert!(decision.allowed());
    assert_eq!(decision.remaining, Some(3));
    assert_eq!(store.get("key_1").await.unwrap().unwrap().version, 0);
}

#[tokio::test]
async fn debits_keep_policy_fields_intact() {
    let policy = RateLimitPolicy::new(RateLimitKind::SlidingWindow, 100, 7, 86_400_000).unwrap();
    let (engine, store) = engine_with(&[key("key_1").with_ratelimit(policy)], 3).await;

    for _ in 0..3 {
        assert!(engine.authorize("key_1", 1, t0()).await.unwrap().allowed());
    }

    let stored = store.get("key_1").await.unwrap().unwrap();
    assert_eq!(stored.ratelimit, Some(policy));
    assert_eq!(stored.window.unwrap().tokens, 97);
}

#[tokio::test]
async fn stale_cache_is_corrected_by_conditional_write() {
    let store = Arc::new(MemoryKeyStore::new());
    store
        .insert(&key("key_1").with_remaining_requests(3))
        .await
        .unwrap();
    let process_a = VerificationEngine::new(store.clone(), config(3));
    let process_b = VerificationEngine::new(store.clone(), config(3));

    assert_eq!(
        process_a.authorize("key_1", 1, t0()).await.unwrap().remaining,
        Some(2)
    );
    assert_eq!(
        process_b.authorize("key_1", 1, t0()).await.unwrap().remaining,
        Some(1)
    );

    // A still caches remaining = 2; its write conflicts and it re-reads.
    assert_eq!(
        process_a.authorize("key_1", 1, t0()).await.unwrap().remaining,
        Some(0)
    );
    assert_eq!(
        process_a.authorize("key_1", 1, t0()).await.unwrap().code,
        DecisionCode::UsageExceeded
    );
    assert_eq!(
        store.get("key_1").await.unwrap().unwrap().remaining_requests,
        Some(0)
    );
}

#[tokio::test]
async fn persistent_conflicts_surface_as_contention() {
    let store = FaultyStore::new(&[key("key_1").with_remaining_requests(3)], Fault::AlwaysConflict).await;
    let engine = VerificationEngine::new(store.clone(), config(3));

    let err = engine.authorize("key_1", 1, t0()).await.unwrap_err();

    assert!(matches!(err, VerifyError::Contention { attempts: 3 }));
    assert!(err.is_retryable());
    assert_eq!(store.writes.load(Ordering::SeqCst), 3);
    assert_eq!(
        store.inner.get("key_1").await.unwrap().unwrap().remaining_requests,
        Some(3)
    );
}

#[tokio::test]
async fn write_timeout_is_contention_without_retry() {
    let store = FaultyStore::new(
        &[key("key_1").with_remaining_requests(3)],
        Fault::SlowWrites(Duration::from_millis(500)),
    )
    .await;
    let engine = VerificationEngine::new(store.clone(), config(3));

    let err = engine.authorize("key_1", 1, t0()).await.unwrap_err();

    assert!(matches!(err, VerifyError::Contention { attempts: 1 }));
    assert_eq!(store.writes.load(Ordering::SeqCst), 1);
    assert!(engine.ledger().is_empty());
}

#[tokio::test]
async fn store_outage_fails_closed() {
    let store = FaultyStore::new(&[key("key_1")], Fault::FailReads).await;
    let engine = VerificationEngine::new(store, config(3));

    let err = engine.authorize("key_1", 1, t0()).await.unwrap_err();

    assert!(matches!(err, VerifyError::StoreUnavailable(_)));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn read_timeout_is_store_unavailable() {
    let store = FaultyStore::new(
        &[key("key_1").with_remaining_requests(3)],
        Fault::SlowReads(Duration::from_millis(500)),
    )
    .await;
    let engine = VerificationEngine::new(store.clone(), config(3));

    let err = engine.authorize("key_1", 1, t0()).await.unwrap_err();

    assert!(matches!(err, VerifyError::StoreUnavailable(_)));
    assert!(err.is_retryable());
    assert_eq!(store.writes.load(Ordering::SeqCst), 0);
    assert!(engine.ledger().is_empty());
}

#[tokio::test]
async fn failed_write_is_store_unavailable_and_drops_cache() {
    let store = FaultyStore::new(&[key("key_1").with_remaining_requests(3)], Fault::FailWrites).await;
    let engine = VerificationEngine::new(store.clone(), config(3));

    let err = engine.authorize("key_1", 1, t0()).await.unwrap_err();

    assert!(matches!(err, VerifyError::StoreUnavailable(_)));
    assert!(err.is_retryable());
    assert_eq!(store.writes.load(Ordering::SeqCst), 1);
    assert!(engine.ledger().is_empty());
    assert_eq!(
        store.inner.get("key_1").await.unwrap().unwrap().remaining_requests,
        Some(3)
    );
}

#[tokio::test]
async fn unmetered_key_never_writes() {
    let store = FaultyStore::new(&[key("key_1")], Fault::AlwaysConflict).await;
    let engine = VerificationEngine::new(store.clone(), config(3));

    for _ in 0..5 {
        let decision = engine.authorize("key_1", 1, t0()).await.unwrap();
        assert_eq!(decision.code, DecisionCode::Valid);
    }

    assert_eq!(store.writes.load(Ordering::SeqCst), 0);
    assert_eq!(store.inner.get("key_1").await.unwrap().unwrap().version, 0);
}

#[tokio::test]
async fn cached_window_matches_stored_precision() {
    let policy = RateLimitPolicy::new(RateLimitKind::TokenBucket, 10, 1, 1_000).unwrap();
    let (engine, store) = engine_with(&[key("key_1").with_ratelimit(policy)], 3).await;
    let precise = t0() + TimeDelta::nanoseconds(123_456_789);

    assert!(engine.authorize("key_1", 1, precise).await.unwrap().allowed());

    let stored = store.get("key_1").await.unwrap().unwrap();
    let cached = engine.ledger().load("key_1", false).await.unwrap().unwrap();
    let updated_at = stored.window.unwrap().updated_at;
    assert_eq!(updated_at, t0() + TimeDelta::milliseconds(123));
    assert_eq!(cached.window.unwrap().updated_at, updated_at);
}

#[tokio::test]
async fn unknown_keys_are_not_found() {
    let (engine, _) = engine_with(&[key("key_1")], 3).await;

    assert!(matches!(
        engine.authorize("key_2", 1, t0()).await,
        Err(VerifyError::NotFound)
    ));
    assert!(matches!(
        engine.authorize_secret("sk_wrong", 1, t0()).await,
        Err(VerifyError::NotFound)
    ));

    let decision = engine.authorize_secret("sk_key_1", 1, t0()).await.unwrap();
    assert!(decision.allowed());
}
