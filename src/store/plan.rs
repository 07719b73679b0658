//! Write planning shared by the blocking and async stores
//!
//! Everything here is pure: it turns records into transaction ops and
//! stored payloads back into records. The stores only add the I/O.

use std::collections::BTreeMap;

use chrono::Utc;
use serde_json::Value;
use tracing::{error, warn};

use crate::error::{DecodeError, ObjStoreError, Result};
use crate::protocol::WriteOp;
use crate::record::codec::{self, format_key};
use crate::record::StoredObject;

/// Options for a single-record get
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetOptions {
    /// Return a default record instead of `None` when the key is absent
    pub create_default: bool,

    /// Log a warning when the key is absent
    pub log_missing: bool,
}

impl Default for GetOptions {
    fn default() -> Self {
        Self {
            create_default: false,
            log_missing: true,
        }
    }
}

impl GetOptions {
    pub fn quiet() -> Self {
        Self {
            create_default: false,
            log_missing: false,
        }
    }

    pub fn or_default() -> Self {
        Self {
            create_default: true,
            log_missing: false,
        }
    }
}

/// Storage keys for caller ids, deduplicated in first-seen order
pub fn keys_for<T: StoredObject>(ids: &[String]) -> Vec<String> {
    let mut keys: Vec<String> = Vec::with_capacity(ids.len());
    for id in ids {
        let key = format_key(T::KIND, id);
        if !keys.contains(&key) {
            keys.push(key);
        }
    }
    keys
}

/// `(id, storage key)` pairs for caller ids, deduplicated by key
pub fn entries_for<T: StoredObject>(ids: &[String]) -> Vec<(String, String)> {
    let mut entries: Vec<(String, String)> = Vec::with_capacity(ids.len());
    for id in ids {
        let key = format_key(T::KIND, id);
        if !entries.iter().any(|(_, k)| *k == key) {
            entries.push((id.clone(), key));
        }
    }
    entries
}

// =============================================================================
// Reads
// =============================================================================

/// Decode one fetched slot for a plain read.
///
/// A payload that is not valid JSON for its type is logged and read as
/// missing; an unknown or foreign type tag is a hard error.
pub fn decode_slot<T: StoredObject>(key: &str, raw: Option<String>) -> Result<Option<T>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    match codec::decode::<T>(key, &raw) {
        Ok(obj) => Ok(Some(obj)),
        Err(e @ DecodeError::Malformed { .. }) => {
            error!(%key, "Unreadable {} record: {}", T::KIND, e);
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

/// Decode one slot inside a read-modify-write; every failure is fatal
pub fn decode_strict<T: StoredObject>(key: &str, raw: Option<String>) -> Result<Option<T>> {
    raw.map(|raw| codec::decode::<T>(key, &raw).map_err(ObjStoreError::from))
        .transpose()
}

/// Fill a missing record with a default when the caller asked for one
pub fn materialize<T: StoredObject>(key: &str, found: Option<T>, create: bool) -> Option<T> {
    match found {
        Some(obj) => Some(obj),
        None if create => Some(T::with_key(key.to_string())),
        None => None,
    }
}

/// Final shape of a single get
pub fn finish_get<T: StoredObject>(key: &str, found: Option<T>, options: GetOptions) -> Option<T> {
    if found.is_none() && options.log_missing && !T::DEFAULTED {
        warn!(%key, "No {} record found", T::KIND);
    }
    materialize(key, found, options.create_default || T::DEFAULTED)
}

/// Decode an MGET reply slot by slot, keeping order and length
pub fn finish_many<T: StoredObject>(keys: &[String], raws: Vec<Option<String>>) -> Result<Vec<Option<T>>> {
    if raws.len() != keys.len() {
        return Err(ObjStoreError::Protocol(format!(
            "MGET returned {} values for {} keys",
            raws.len(),
            keys.len()
        )));
    }
    keys.iter()
        .zip(raws)
        .map(|(key, raw)| Ok(materialize(key, decode_slot::<T>(key, raw)?, T::DEFAULTED)))
        .collect()
}

/// Like `finish_many`, but one undecodable slot fails only itself
pub fn finish_each<T: StoredObject>(
    keys: &[String],
    raws: Vec<Option<String>>,
) -> Result<Vec<Result<Option<T>>>> {
    if raws.len() != keys.len() {
        return Err(ObjStoreError::Protocol(format!(
            "MGET returned {} values for {} keys",
            raws.len(),
            keys.len()
        )));
    }
    Ok(keys
        .iter()
        .zip(raws)
        .map(|(key, raw)| Ok(materialize(key, decode_slot::<T>(key, raw)?, T::DEFAULTED)))
        .collect())
}

// =============================================================================
// Writes
// =============================================================================

/// Stamp `updated` and serialize
fn prepare<T: StoredObject>(obj: &mut T) -> Result<String> {
    obj.meta_mut().updated = Utc::now();
    codec::encode(obj)
}

/// Ops persisting one record: entity-set membership plus payload
pub fn save_ops<T: StoredObject>(obj: &mut T) -> Result<Vec<WriteOp>> {
    let key = obj.key().to_string();
    if key.is_empty() {
        return Err(ObjStoreError::Internal(format!(
            "cannot save a {} record without a key",
            T::KIND
        )));
    }
    let payload = prepare(obj)?;
    Ok(vec![
        WriteOp::SAdd {
            set: T::set_key_for(&key),
            members: vec![key.clone()],
        },
        WriteOp::Set {
            key,
            value: payload,
        },
    ])
}

/// Ops persisting many records: one SADD per distinct set, then payloads
pub fn save_all_ops<T: StoredObject>(objs: &mut [T]) -> Result<Vec<WriteOp>> {
    let mut sets: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut payloads = Vec::with_capacity(objs.len());

    for obj in objs.iter_mut() {
        let key = obj.key().to_string();
        let payload = prepare(obj)?;
        sets.entry(T::set_key_for(&key)).or_default().push(key.clone());
        payloads.push(WriteOp::Set {
            key,
            value: payload,
        });
    }

    let mut ops: Vec<WriteOp> = sets
        .into_iter()
        .map(|(set, members)| WriteOp::SAdd { set, members })
        .collect();
    ops.extend(payloads);
    Ok(ops)
}

/// Ops removing records and their set memberships
pub fn delete_ops<T: StoredObject>(keys: &[String]) -> Vec<WriteOp> {
    let mut sets: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for key in keys {
        sets.entry(T::set_key_for(key)).or_default().push(key.clone());
    }

    let mut ops: Vec<WriteOp> = sets
        .into_iter()
        .map(|(set, members)| WriteOp::SRem { set, members })
        .collect();
    ops.extend(keys.iter().map(|key| WriteOp::Del { key: key.clone() }));
    ops
}

/// Canonical content of a record before mutation
pub fn snapshot<T: StoredObject>(obj: Option<&T>) -> Result<Option<Value>> {
    obj.map(codec::canonical).transpose()
}

/// Ops writing back a mutated record, or nothing if its content is
/// unchanged. `before` is the snapshot of the stored version (`None` when
/// the record did not exist).
pub fn modify_ops<T: StoredObject>(
    key: &str,
    before: Option<&Value>,
    obj: &mut T,
) -> Result<Vec<WriteOp>> {
    // Keys never change once assigned
    obj.meta_mut().key = key.to_string();

    match before {
        Some(before) if *before == codec::canonical(obj)? => Ok(Vec::new()),
        Some(_) => Ok(vec![WriteOp::Set {
            key: key.to_string(),
            value: prepare(obj)?,
        }]),
        None => save_ops(obj),
    }
}

/// Ops for a whole modify-many batch.
///
/// `entries` pairs each caller id with its storage key; `before` and
/// `records` are keyed by caller id.
pub fn modify_many_ops<T: StoredObject>(
    entries: &[(String, String)],
    before: &BTreeMap<String, Option<Value>>,
    records: &mut BTreeMap<String, Option<T>>,
) -> Result<Vec<WriteOp>> {
    let mut sets: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut payloads = Vec::new();

    for (id, key) in entries {
        let Some(Some(obj)) = records.get_mut(id) else {
            continue;
        };
        let prior = before.get(id).and_then(Option::as_ref);
        for op in modify_ops(key, prior, obj)? {
            match op {
                WriteOp::SAdd { set, members } => sets.entry(set).or_default().extend(members),
                other => payloads.push(other),
            }
        }
    }

    let mut ops: Vec<WriteOp> = sets
        .into_iter()
        .map(|(set, members)| WriteOp::SAdd { set, members })
        .collect();
    ops.extend(payloads);
    Ok(ops)
}
