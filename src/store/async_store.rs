//! Async object store
//!
//! Same surface as `ObjectStore`, with every backend call going through
//! the `AsyncClient`. Planning and decoding are shared with the blocking
//! store, so both write identical transactions.

use std::collections::BTreeMap;
use std::future::Future;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::iterator::AsyncObjIter;
use super::plan::{self, GetOptions};
use crate::client::AsyncClient;
use crate::config::StoreConfig;
use crate::error::{ObjStoreError, Result};
use crate::record::codec::{self, format_key};
use crate::record::StoredObject;

/// Async typed record persistence
#[derive(Clone)]
pub struct AsyncObjectStore {
    client: AsyncClient,
}

impl AsyncObjectStore {
    pub fn new(client: AsyncClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &AsyncClient {
        &self.client
    }

    pub fn config(&self) -> &StoreConfig {
        self.client.manager().config()
    }

    /// Run `fut` in the background and hand its result to `callback`
    pub fn submit<Fut, T, C>(&self, fut: Fut, callback: C) -> JoinHandle<()>
    where
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
        C: FnOnce(Result<T>) + Send + 'static,
    {
        tokio::spawn(async move { callback(fut.await) })
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub async fn get<T: StoredObject>(&self, id: &str, options: GetOptions) -> Result<Option<T>> {
        let key = format_key(T::KIND, id);
        let raw = self.client.get(T::KIND, &key).await?;
        let found = plan::decode_slot::<T>(&key, raw)?;
        Ok(plan::finish_get(&key, found, options))
    }

    pub async fn get_many<T: StoredObject>(&self, ids: &[String]) -> Result<Vec<Option<T>>> {
        let keys: Vec<String> = ids.iter().map(|id| format_key(T::KIND, id)).collect();
        self.get_many_keys(keys).await
    }

    pub(crate) async fn get_many_keys<T: StoredObject>(
        &self,
        keys: Vec<String>,
    ) -> Result<Vec<Option<T>>> {
        let raws = self.client.mget(T::KIND, keys.clone()).await?;
        plan::finish_many(&keys, raws)
    }

    pub async fn all_ids<T: StoredObject>(&self) -> Result<Vec<String>> {
        Ok(self
            .all_keys::<T>()
            .await?
            .iter()
            .map(|key| codec::key_to_id(T::KIND, key).to_string())
            .collect())
    }

    async fn all_keys<T: StoredObject>(&self) -> Result<Vec<String>> {
        let count = self.config().keys_per_scan;
        if T::OWNER_GROUPED {
            let pattern = format_key(T::KIND, "*");
            self.client.scan_all(T::KIND, &pattern, count).await
        } else {
            let set = codec::entity_set_key(T::KIND);
            self.client.sscan_all(T::KIND, &set, count).await
        }
    }

    pub async fn iterate_all<T: StoredObject>(
        &self,
        page_size: usize,
        max_results: Option<usize>,
    ) -> Result<AsyncObjIter<T>> {
        let keys = self.all_keys::<T>().await?;
        Ok(AsyncObjIter::new(self.clone(), keys, page_size, max_results))
    }

    pub async fn get_all<T: StoredObject>(&self) -> Result<Vec<T>> {
        let records = self
            .iterate_all::<T>(self.config().page_size, None)
            .await?
            .skip_missing()
            .collect()
            .await?;
        Ok(records.into_iter().flatten().collect())
    }

    pub async fn get_many_with_pattern<T: StoredObject>(&self, pattern: &str) -> Result<Vec<T>> {
        let pattern = format_key(T::KIND, pattern);
        let keys = self
            .client
            .scan_all(T::KIND, &pattern, self.config().keys_per_scan)
            .await?;
        Ok(self
            .get_many_keys::<T>(keys)
            .await?
            .into_iter()
            .flatten()
            .collect())
    }

    // =========================================================================
    // Writes
    // =========================================================================

    pub async fn save<T: StoredObject>(&self, obj: &mut T) -> Result<()> {
        let ops = plan::save_ops(obj)?;
        self.client.exec(T::KIND, Vec::new(), ops).await?;
        Ok(())
    }

    pub async fn save_all<T: StoredObject>(&self, objs: &mut [T]) -> Result<()> {
        if objs.is_empty() {
            return Ok(());
        }
        let ops = plan::save_all_ops(objs)?;
        self.client.exec(T::KIND, Vec::new(), ops).await?;
        Ok(())
    }

    pub async fn modify<T, F>(&self, id: &str, mut mutate: F, create_missing: bool) -> Result<Option<T>>
    where
        T: StoredObject,
        F: FnMut(&mut T),
    {
        let key = format_key(T::KIND, id);
        let attempts = self.config().max_txn_retries.max(1);

        for attempt in 1..=attempts {
            let (raw, version) = self
                .client
                .watch_get(T::KIND, vec![key.clone()])
                .await?
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

            if self
                .client
                .exec(T::KIND, vec![(key.clone(), version)], ops)
                .await?
            {
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

    pub async fn modify_many<T, F>(
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
            let slots = self.client.watch_get(T::KIND, keys.clone()).await?;
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

            if self.client.exec(T::KIND, watched, ops).await? {
                return Ok(records);
            }
            debug!(keys = keys.len(), attempt, "Watch conflict, retrying modify_many");
        }

        warn!(keys = keys.len(), attempts, "Giving up on modify_many after repeated conflicts");
        Err(ObjStoreError::TransactionConflict { keys, attempts })
    }

    pub async fn delete<T: StoredObject>(&self, id: &str) -> Result<()> {
        self.delete_many::<T>(&[id.to_string()]).await
    }

    pub async fn delete_many<T: StoredObject>(&self, ids: &[String]) -> Result<()> {
        let keys = plan::keys_for::<T>(ids);
        if keys.is_empty() {
            return Ok(());
        }
        self.client
            .exec(T::KIND, Vec::new(), plan::delete_ops::<T>(&keys))
            .await?;
        Ok(())
    }

    pub async fn erase_all<T: StoredObject>(&self) -> Result<()> {
        warn!(kind = %T::KIND, "Flushing backend database");
        self.client.flush_db(T::KIND).await
    }
}
