//! Change events and the sinks that deliver them

use std::fmt;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{error, trace};

use crate::error::Result;
use crate::keyspace::KEYSPACE_CHANNEL_PREFIX;
use crate::record::codec;
use crate::record::StoredObject;
use crate::store::ObjectStore;

/// Operation named by a keyspace notification
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChangeOp {
    Set,
    Del,
    SAdd,
    SRem,
    Other(String),
}

impl ChangeOp {
    pub fn parse(payload: &str) -> Self {
        match payload {
            "set" => ChangeOp::Set,
            "del" => ChangeOp::Del,
            "sadd" => ChangeOp::SAdd,
            "srem" => ChangeOp::SRem,
            other => ChangeOp::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ChangeOp::Set => "set",
            ChangeOp::Del => "del",
            ChangeOp::SAdd => "sadd",
            ChangeOp::SRem => "srem",
            ChangeOp::Other(op) => op,
        }
    }
}

impl fmt::Display for ChangeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One change to one record
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent<T> {
    /// Non-namespaced id of the changed record
    pub id: String,

    /// Record as read after the change; `None` when it is gone or the
    /// subscription does not fetch objects
    pub record: Option<T>,

    pub op: ChangeOp,
}

/// Storage key and operation carried by one notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub key: String,
    pub op: ChangeOp,
}

impl Notification {
    /// Parse a keyspace notification; `None` for other channels
    pub fn from_channel(channel: &str, payload: &str) -> Option<Self> {
        channel
            .strip_prefix(KEYSPACE_CHANNEL_PREFIX)
            .map(|key| Notification {
                key: key.to_string(),
                op: ChangeOp::parse(payload),
            })
    }
}

/// Receives batches of notifications on the bus worker thread
pub trait ChangeSink: Send + Sync {
    fn deliver(&self, batch: Vec<Notification>);
}

/// Handler signature for typed subscriptions
pub type ChangeHandler<T> = Arc<dyn Fn(ChangeEvent<T>) -> Result<()> + Send + Sync>;

/// Turns notifications into typed events for one record family
pub struct TypedSink<T: StoredObject> {
    store: ObjectStore,
    handler: ChangeHandler<T>,
    get_object: bool,
    _family: PhantomData<fn() -> T>,
}

impl<T: StoredObject> TypedSink<T> {
    pub fn new(store: ObjectStore, handler: ChangeHandler<T>, get_object: bool) -> Self {
        Self {
            store,
            handler,
            get_object,
            _family: PhantomData,
        }
    }

    fn invoke(&self, event: ChangeEvent<T>) {
        let id = event.id.clone();
        let op = event.op.clone();
        match panic::catch_unwind(AssertUnwindSafe(|| (self.handler)(event))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(kind = %T::KIND, %id, %op, "Change handler failed: {}", e);
            }
            Err(_) => {
                error!(kind = %T::KIND, %id, %op, "Change handler panicked");
            }
        }
    }
}

impl<T: StoredObject> ChangeSink for TypedSink<T> {
    fn deliver(&self, batch: Vec<Notification>) {
        let prefix = format!("{}_", T::KIND.namespace());
        let (ids, ops): (Vec<String>, Vec<ChangeOp>) = batch
            .into_iter()
            .filter(|note| note.key.starts_with(&prefix))
            .map(|note| (codec::key_to_id(T::KIND, &note.key).to_string(), note.op))
            .filter(|(id, _)| T::is_valid_id(id))
            .unzip();

        if ids.is_empty() {
            return;
        }
        trace!(kind = %T::KIND, count = ids.len(), "Delivering change batch");

        if !self.get_object {
            for (id, op) in ids.into_iter().zip(ops) {
                self.invoke(ChangeEvent { id, record: None, op });
            }
            return;
        }

        let records = match self.store.get_each::<T>(&ids) {
            Ok(records) => records,
            Err(e) => {
                error!(kind = %T::KIND, count = ids.len(), "Could not load changed records: {}", e);
                return;
            }
        };

        for ((id, record), op) in ids.into_iter().zip(records).zip(ops) {
            match record {
                Ok(record) => self.invoke(ChangeEvent { id, record, op }),
                Err(e) => {
                    error!(kind = %T::KIND, %id, %op, "Skipping change for unreadable record: {}", e);
                }
            }
        }
    }
}
