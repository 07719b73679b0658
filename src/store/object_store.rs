//! Blocking object store
//!
//! Typed get/save/modify/delete over the retrying client. Every write is a
//! single backend transaction so payloads and entity sets never drift
//! apart.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, warn};

use super::async_store::AsyncObjectStore;
use super::iterator::ObjIter;
use super::plan::{self, GetOptions};
use crate::backend::Connector;
use crate::client::{AsyncClient, RetryingClient, WorkerPool};
use crate::config::{AddressSource, StoreConfig};
use crate::connection::ConnectionManager;
use crate::error::{ObjStoreError, Result};
use crate::record::codec::{self, format_key};
use crate::record::StoredObject;

/// Typed record persistence for every entity kind
#[derive(Clone)]
pub struct ObjectStore {
    client: RetryingClient,
    pool: WorkerPool,
}

impl ObjectStore {
    /// Store over an existing client; the async side gets a fresh pool
    pub fn new(client: RetryingClient) -> Self {
        let pool = WorkerPool::new(client.manager().config().async_pool_size);
        Self { client, pool }
    }

    /// Build the connection registry and client from configuration
    pub fn connect(
        config: StoreConfig,
        addresses: Arc<dyn AddressSource>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let manager = Arc::new(ConnectionManager::new(config, addresses, connector));
        Self::new(RetryingClient::new(manager))
    }

    pub fn client(&self) -> &RetryingClient {
        &self.client
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        self.client.manager()
    }

    pub fn config(&self) -> &StoreConfig {
        self.client.manager().config()
    }

    /// Async view sharing this store's connections and worker pool
    pub fn async_store(&self) -> AsyncObjectStore {
        let client = AsyncClient::new(Arc::clone(self.manager()), self.pool.clone())
            .with_policy(self.client.policy().clone());
        AsyncObjectStore::new(client)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Fetch one record by id
    pub fn get<T: StoredObject>(&self, id: &str, options: GetOptions) -> Result<Option<T>> {
        let key = format_key(T::KIND, id);
        let raw = self.client.get(T::KIND, &key)?;
        let found = plan::decode_slot::<T>(&key, raw)?;
        Ok(plan::finish_get(&key, found, options))
    }

    /// Fetch many records with one MGET; the output lines up with `ids`
    pub fn get_many<T: StoredObject>(&self, ids: &[String]) -> Result<Vec<Option<T>>> {
        let keys: Vec<String> = ids.iter().map(|id| format_key(T::KIND, id)).collect();
        self.get_many_keys(keys)
    }

    pub(crate) fn get_many_keys<T: StoredObject>(&self, keys: Vec<String>) -> Result<Vec<Option<T>>> {
        let raws = self.client.mget(T::KIND, keys.clone())?;
        plan::finish_many(&keys, raws)
    }

    /// One MGET for `ids`, decoded slot by slot
    pub(crate) fn get_each<T: StoredObject>(&self, ids: &[String]) -> Result<Vec<Result<Option<T>>>> {
        let keys: Vec<String> = ids.iter().map(|id| format_key(T::KIND, id)).collect();
        let raws = self.client.mget(T::KIND, keys.clone())?;
        plan::finish_each(&keys, raws)
    }

    /// Ids of every stored record of the family
    pub fn all_ids<T: StoredObject>(&self) -> Result<Vec<String>> {
        Ok(self
            .all_keys::<T>()?
            .iter()
            .map(|key| codec::key_to_id(T::KIND, key).to_string())
            .collect())
    }

    /// Ids of the records filed under one owner (account)
    pub fn owner_ids<T: StoredObject>(&self, owner: &str) -> Result<Vec<String>> {
        if !T::OWNER_GROUPED {
            return Err(ObjStoreError::Internal(format!(
                "{} records are not grouped by owner",
                T::KIND
            )));
        }
        let set = codec::owner_set_key(T::KIND, owner);
        let keys = self
            .client
            .sscan_all(T::KIND, &set, self.config().keys_per_scan)?;
        Ok(keys
            .iter()
            .map(|key| codec::key_to_id(T::KIND, key).to_string())
            .collect())
    }

    pub(crate) fn all_keys<T: StoredObject>(&self) -> Result<Vec<String>> {
        let count = self.config().keys_per_scan;
        if T::OWNER_GROUPED {
            // Owner sets are many; walk the keyspace instead
            let pattern = format_key(T::KIND, "*");
            self.client.scan_all(T::KIND, &pattern, count)
        } else {
            let set = codec::entity_set_key(T::KIND);
            self.client.sscan_all(T::KIND, &set, count)
        }
    }

    /// Lazy paged traversal over the records present right now
    pub fn iterate_all<T: StoredObject>(
        &self,
        page_size: usize,
        max_results: Option<usize>,
    ) -> Result<ObjIter<T>> {
        let keys = self.all_keys::<T>()?;
        Ok(ObjIter::new(self.clone(), keys, page_size, max_results))
    }

    /// Every stored record of the family
    pub fn get_all<T: StoredObject>(&self) -> Result<Vec<T>> {
        self.iterate_all::<T>(self.config().page_size, None)?
            .skip_missing()
            .filter_map(|item| item.transpose())
            .collect()
    }

    /// Records whose id matches a glob pattern
    pub fn get_many_with_pattern<T: StoredObject>(&self, pattern: &str) -> Result<Vec<T>> {
        let pattern = format_key(T::KIND, pattern);
        let keys = self
            .client
            .scan_all(T::KIND, &pattern, self.config().keys_per_scan)?;
        Ok(self.get_many_keys::<T>(keys)?.into_iter().flatten().collect())
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Persist one record together with its entity-set membership
    pub fn save<T: StoredObject>(&self, obj: &mut T) -> Result<()> {
        let ops = plan::save_ops(obj)?;
        self.client.exec(T::KIND, Vec::new(), ops)?;
        Ok(())
    }

    /// Persist many records in one transaction
    pub fn save_all<T: StoredObject>(&self, objs: &mut [T]) -> Result<()> {
        if objs.is_empty() {
            return Ok(());
        }
        let ops = plan::save_all_ops(objs)?;
        self.client.exec(T::KIND, Vec::new(), ops)?;
        Ok(())
    }

    /// Optimistic read-modify-write of one record.
    ///
    /// Returns `None` without writing when the record is missing and
    /// `create_missing` is false. The mutator runs once per attempt.
    pub fn modify<T, F>(&self, id: &str, mut mutate: F, create_missing: bool) -> Result<Option<T>>
    where
        T: StoredObject,
        F: FnMut(&mut T),
    {
        let key = format_key(T::KIND, id);
        let attempts = self.config().max_txn_retries.max(1);

        for attempt in 1..=attempts {
            let (raw, version) = self
                .client
                .watch_get(T::KIND, vec![key.clone()])?
                .pop()
                .ok_or_else(|| ObjStoreError::Protocol("empty WATCHGET reply".to_string()))?;

            let found = plan::decode_strict::<T>(&key, raw)?;
            let before = plan::snapshot(found.as_ref())?;
            let Some(mut obj) = plan::materialize(&key, found, create_missing) else {
                return Ok(None);
            };

            mutate(&mut obj);
            let ops = plan::modify_ops(&key, before.as_ref(), &mut obj)?;
            if ops.is_empty() {
                return Ok(Some(obj));
            }

            if self.client.exec(T::KIND, vec![(key.clone(), version)], ops)? {
                return Ok(Some(obj));
            }
            debug!(%key, attempt, "Watch conflict, retrying modify");
        }

        warn!(%key, attempts, "Giving up on modify after repeated conflicts");
        Err(ObjStoreError::TransactionConflict {
            keys: vec![key],
            attempts,
        })
    }

    /// Optimistic read-modify-write of many records at once.
    ///
    /// The mutator sees every requested id, with `None` for missing
    /// records unless `create_missing` filled them in. Filling a `None`
    /// slot creates that record. Only changed records are written.
    pub fn modify_many<T, F>(
        &self,
        ids: &[String],
        mut mutate: F,
        create_missing: bool,
    ) -> Result<BTreeMap<String, Option<T>>>
    where
        T: StoredObject,
        F: FnMut(&mut BTreeMap<String, Option<T>>),
    {
        let entries = plan::entries_for::<T>(ids);
        if entries.is_empty() {
            return Ok(BTreeMap::new());
        }
        let keys: Vec<String> = entries.iter().map(|(_, key)| key.clone()).collect();
        let attempts = self.config().max_txn_retries.max(1);

        for attempt in 1..=attempts {
            let slots = self.client.watch_get(T::KIND, keys.clone())?;
            if slots.len() != entries.len() {
                return Err(ObjStoreError::Protocol(format!(
                    "WATCHGET returned {} values for {} keys",
                    slots.len(),
                    entries.len()
                )));
            }

            let mut watched = Vec::with_capacity(entries.len());
            let mut before = BTreeMap::new();
            let mut records = BTreeMap::new();
            for ((id, key), (raw, version)) in entries.iter().zip(slots) {
                let found = plan::decode_strict::<T>(key, raw)?;
                before.insert(id.clone(), plan::snapshot(found.as_ref())?);
                records.insert(id.clone(), plan::materialize(key, found, create_missing));
                watched.push((key.clone(), version));
            }

            mutate(&mut records);
            let ops = plan::modify_many_ops(&entries, &before, &mut records)?;
            if ops.is_empty() {
                return Ok(records);
            }

            if self.client.exec(T::KIND, watched, ops)? {
                return Ok(records);
            }
            debug!(keys = keys.len(), attempt, "Watch conflict, retrying modify_many");
        }

        warn!(keys = keys.len(), attempts, "Giving up on modify_many after repeated conflicts");
        Err(ObjStoreError::TransactionConflict { keys, attempts })
    }

    /// Remove one record and its set membership
    pub fn delete<T: StoredObject>(&self, id: &str) -> Result<()> {
        self.delete_many::<T>(&[id.to_string()])
    }

    /// Remove many records in one transaction
    pub fn delete_many<T: StoredObject>(&self, ids: &[String]) -> Result<()> {
        let keys = plan::keys_for::<T>(ids);
        if keys.is_empty() {
            return Ok(());
        }
        self.client
            .exec(T::KIND, Vec::new(), plan::delete_ops::<T>(&keys))?;
        Ok(())
    }

    /// Drop the whole database behind the family's backend
    pub fn erase_all<T: StoredObject>(&self) -> Result<()> {
        warn!(kind = %T::KIND, "Flushing backend database");
        self.client.flush_db(T::KIND)
    }
}
