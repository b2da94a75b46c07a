//! Quota ledger - per-process cache in front of the key store.
//!
//! The ledger shortcuts the *read* half of a verification: a key fetched
//! within the last `ttl` is decided from memory. The *write* half never
//! shortcuts: every debit is a conditional write against the store, and
//! only a committed write updates the cached copy.
//!
//! # Staleness
//!
//! Cached budgets only ever lag behind debits made elsewhere, which the
//! conditional write catches. What the cache can miss is an administrative
//! change made within the last `ttl` (revocation, policy change,
//! replenishment). That window is the configured bound on staleness.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, warn};

use crate::error::VerifyError;
use crate::models::key::{KeyDebit, KeyRecord};
use crate::store::{KeyStore, WriteOutcome};

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Freshness window for cached records. Zero disables caching.
    pub ttl: Duration,
    pub max_entries: usize,
    /// Deadline applied to every store call.
    pub store_timeout: Duration,
}

#[derive(Debug, Clone)]
struct CachedRecord {
    record: KeyRecord,
    fetched_at: Instant,
}

/// Result of pushing a debit to the store.
#[derive(Debug, Clone, PartialEq)]
pub enum DebitOutcome {
    /// The write landed; carries the record as now stored.
    Committed(KeyRecord),
    /// Another writer bumped the version first.
    Conflict,
    NotFound,
    /// The write timed out and may or may not have landed.
    Indeterminate,
}

pub struct QuotaLedger {
    store: Arc<dyn KeyStore>,
    entries: DashMap<String, CachedRecord>,
    config: LedgerConfig,
}

impl QuotaLedger {
    pub fn new(store: Arc<dyn KeyStore>, config: LedgerConfig) -> Self {
        Self {
            store,
            entries: DashMap::new(),
            config,
        }
    }

    /// Load a key, from cache when allowed and fresh, otherwise from the store.
    ///
    /// `fresh` forces a store read, used after a version conflict.
    pub async fn load(&self, key_id: &str, fresh: bool) -> Result<Option<KeyRecord>, VerifyError> {
        if !fresh {
            if let Some(record) = self.cached(key_id) {
                debug!(key_id, version = record.version, "ledger hit");
                return Ok(Some(record));
            }
        }

        let fetched = self.read(self.store.get(key_id)).await?;
        match &fetched {
            Some(record) => self.remember(record.clone()),
            None => self.invalidate(key_id),
        }
        Ok(fetched)
    }

    /// Resolve a key by secret hash. Always reads the store.
    pub async fn load_by_hash(&self, hash: &str) -> Result<Option<KeyRecord>, VerifyError> {
        let fetched = self.read(self.store.find_by_hash(hash)).await?;
        if let Some(record) = &fetched {
            self.remember(record.clone());
        }
        Ok(fetched)
    }

    /// Conditionally write `debit` against the version `record` was read at.
    pub async fn debit(
        &self,
        record: &KeyRecord,
        debit: KeyDebit,
    ) -> Result<DebitOutcome, VerifyError> {
        let write = self
            .store
            .conditional_update(&record.id, record.version, &debit);

        let outcome = match tokio::time::timeout(self.config.store_timeout, write).await {
            Err(_) => {
                warn!(key_id = %record.id, version = record.version, "conditional write timed out");
                self.invalidate(&record.id);
                return Ok(DebitOutcome::Indeterminate);
            }
            Ok(Err(e)) => {
                warn!(key_id = %record.id, error = %e, "conditional write failed");
                self.invalidate(&record.id);
                return Err(e.into());
            }
            Ok(Ok(outcome)) => outcome,
        };

        match outcome {
            WriteOutcome::Applied => {
                let committed = record.apply(&debit);
                self.remember(committed.clone());
                Ok(DebitOutcome::Committed(committed))
            }
            WriteOutcome::VersionConflict => {
                debug!(key_id = %record.id, version = record.version, "version conflict");
                self.invalidate(&record.id);
                Ok(DebitOutcome::Conflict)
            }
            WriteOutcome::NotFound => {
                self.invalidate(&record.id);
                Ok(DebitOutcome::NotFound)
            }
        }
    }

    pub fn invalidate(&self, key_id: &str) {
        self.entries.remove(key_id);
    }

    /// Number of cached keys, fresh or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn cached(&self, key_id: &str) -> Option<KeyRecord> {
        let entry = self.entries.get(key_id)?;
        (entry.fetched_at.elapsed() < self.config.ttl).then(|| entry.record.clone())
    }

    async fn read<F>(&self, fut: F) -> Result<Option<KeyRecord>, VerifyError>
    where
        F: Future<Output = Result<Option<KeyRecord>, crate::error::StoreError>>,
    {
        match tokio::time::timeout(self.config.store_timeout, fut).await {
            Ok(result) => result.map_err(|e| {
                warn!(error = %e, "key store read failed");
                VerifyError::from(e)
            }),
            Err(_) => {
                warn!(timeout_ms = self.config.store_timeout.as_millis() as u64, "key store read timed out");
                Err(VerifyError::StoreUnavailable("read timed out".to_string()))
            }
        }
    }

    fn remember(&self, record: KeyRecord) {
        if self.config.ttl.is_zero() {
            return;
        }

        if self.entries.len() >= self.config.max_entries && !self.entries.contains_key(&record.id) {
            let ttl = self.config.ttl;
            self.entries.retain(|_, entry| entry.fetched_at.elapsed() < ttl);
            if self.entries.len() >= self.config.max_entries {
                debug!(key_id = %record.id, "ledger full, not caching");
                return;
            }
        }

        let fresh = CachedRecord {
            record,
            fetched_at: Instant::now(),
        };
        match self.entries.entry(fresh.record.id.clone()) {
            Entry::Occupied(mut slot) => {
                // A concurrent commit may already have cached a newer version.
                if slot.get().record.version <= fresh.record.version {
                    slot.insert(fresh);
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(fresh);
            }
        }
    }
}
