//! Key store adapter.
//!
//! The verification engine reads key records and writes debits only through
//! the [`KeyStore`] trait. Debits are conditional writes: they carry the
//! `version` the decision was computed from and are rejected when another
//! writer got there first.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::models::key::{KeyDebit, KeyRecord};

pub mod memory;
pub mod postgres;

pub use memory::MemoryKeyStore;
pub use postgres::PgKeyStore;

/// Result of a write that targets a single key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Applied,
    /// The stored version no longer matches the expected one.
    VersionConflict,
    NotFound,
}

#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Fetch a key by identifier.
    async fn get(&self, key_id: &str) -> Result<Option<KeyRecord>, StoreError>;

    /// Fetch a key by the SHA-256 hex digest of its secret.
    async fn find_by_hash(&self, hash: &str) -> Result<Option<KeyRecord>, StoreError>;

    /// Persist a newly issued key as given, including its version.
    async fn insert(&self, record: &KeyRecord) -> Result<(), StoreError>;

    /// Unconditionally overwrite every column of a key and bump its version.
    ///
    /// Administrative path (rotation, policy change, replenishment). Bumping
    /// the version makes any in-flight debit computed from the old state fail
    /// its conditional write.
    async fn update(&self, record: &KeyRecord) -> Result<WriteOutcome, StoreError>;

    /// Write `debit` and bump the version, only if the stored version is
    /// still `expected_version`.
    async fn conditional_update(
        &self,
        key_id: &str,
        expected_version: i64,
        debit: &KeyDebit,
    ) -> Result<WriteOutcome, StoreError>;

    /// Cheap liveness probe used by the health check.
    async fn ping(&self) -> Result<(), StoreError>;
}
