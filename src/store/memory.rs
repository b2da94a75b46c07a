//! In-process key store.
//!
//! Each conditional write holds the shard lock of its entry for the
//! duration of the version check and the swap, so debits against one key
//! are linearizable. Useful for tests and for embedding the engine without
//! a database.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::{KeyStore, WriteOutcome};
use crate::error::StoreError;
use crate::models::key::{KeyDebit, KeyRecord};

#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    keys: DashMap<String, KeyRecord>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn get(&self, key_id: &str) -> Result<Option<KeyRecord>, StoreError> {
        Ok(self.keys.get(key_id).map(|entry| entry.value().clone()))
    }

    async fn find_by_hash(&self, hash: &str) -> Result<Option<KeyRecord>, StoreError> {
        Ok(self
            .keys
            .iter()
            .find(|entry| entry.value().hash == hash)
            .map(|entry| entry.value().clone()))
    }

    async fn insert(&self, record: &KeyRecord) -> Result<(), StoreError> {
        match self.keys.entry(record.id.clone()) {
            Entry::Occupied(_) => Err(StoreError::DuplicateKey(record.id.clone())),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(())
            }
        }
    }

    async fn update(&self, record: &KeyRecord) -> Result<WriteOutcome, StoreError> {
        let Some(mut stored) = self.keys.get_mut(&record.id) else {
            return Ok(WriteOutcome::NotFound);
        };
        let version = stored.version + 1;
        *stored = KeyRecord {
            version,
            ..record.clone()
        };
        Ok(WriteOutcome::Applied)
    }

    async fn conditional_update(
        &self,
        key_id: &str,
        expected_version: i64,
        debit: &KeyDebit,
    ) -> Result<WriteOutcome, StoreError> {
        let Some(mut stored) = self.keys.get_mut(key_id) else {
            return Ok(WriteOutcome::NotFound);
        };
        if stored.version != expected_version {
            return Ok(WriteOutcome::VersionConflict);
        }
        let next = stored.apply(debit);
        *stored = next;
        Ok(WriteOutcome::Applied)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
