//! Keyspace Module
//!
//! The in-memory backend engine: strings, sets, optimistic transactions
//! and pub/sub with keyspace notifications.
//!
//! ## Responsibilities
//! - Execute every non-subscribe `Request` atomically
//! - Track a version per key so watched transactions detect conflicts
//! - Publish `__keyspace@0__:<key>` notifications for each write
//!
//! ## Concurrency Model
//! - One `RwLock` over all data; reads share it, writes take it exclusively
//! - Notifications are published after the data lock is released
//! - Deletes bump the version too, so a watched key deleted and re-created
//!   still conflicts

mod glob;
mod pubsub;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::protocol::{ErrorKind, Request, Response, WriteOp};

pub use glob::{glob_match, is_pattern};
pub use pubsub::{PubSubHub, SubscriberId};

/// Channel prefix of keyspace notifications
pub const KEYSPACE_CHANNEL_PREFIX: &str = "__keyspace@0__:";

/// Keyspace notification channel of a key
pub fn keyspace_channel(key: &str) -> String {
    format!("{}{}", KEYSPACE_CHANNEL_PREFIX, key)
}

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Set(BTreeSet<String>),
}

const WRONG_TYPE: &str = "WRONGTYPE Operation against a key holding the wrong kind of value";

#[derive(Default)]
struct Data {
    entries: BTreeMap<String, Value>,
    /// Last write version of every live key
    versions: HashMap<String, u64>,
    /// Clock of the latest removal; the version of every absent key
    removed_at: u64,
    clock: u64,
}

impl Data {
    fn version(&self, key: &str) -> u64 {
        self.versions.get(key).copied().unwrap_or(self.removed_at)
    }

    fn touch(&mut self, key: &str) {
        self.clock += 1;
        self.versions.insert(key.to_string(), self.clock);
    }

    /// Drop a removed key's version. Absent keys share the removal
    /// watermark, so a watcher of any absent key sees a conflict.
    fn forget(&mut self, key: &str) {
        self.clock += 1;
        self.versions.remove(key);
        self.removed_at = self.clock;
    }

    fn get_str(&self, key: &str) -> Result<Option<&String>, Response> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(Value::Str(s)) => Ok(Some(s)),
            Some(Value::Set(_)) => Err(wrong_type()),
        }
    }

    fn get_set(&self, key: &str) -> Result<Option<&BTreeSet<String>>, Response> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(Value::Set(s)) => Ok(Some(s)),
            Some(Value::Str(_)) => Err(wrong_type()),
        }
    }

    /// Fails without changing anything if the op cannot be applied
    fn check(&self, op: &WriteOp) -> Result<(), Response> {
        match op {
            WriteOp::SAdd { set, .. } | WriteOp::SRem { set, .. } => self.get_set(set).map(|_| ()),
            WriteOp::Set { .. } | WriteOp::Del { .. } => Ok(()),
        }
    }

    /// Apply a checked op, recording notifications. Returns the number of
    /// elements changed.
    fn apply(&mut self, op: WriteOp, events: &mut Vec<(String, &'static str)>) -> usize {
        match op {
            WriteOp::Set { key, value } => {
                self.entries.insert(key.clone(), Value::Str(value));
                self.touch(&key);
                events.push((key, "set"));
                1
            }
            WriteOp::Del { key } => {
                if self.entries.remove(&key).is_some() {
                    self.forget(&key);
                    events.push((key, "del"));
                    1
                } else {
                    0
                }
            }
            WriteOp::SAdd { set, members } => {
                let entry = self
                    .entries
                    .entry(set.clone())
                    .or_insert_with(|| Value::Set(BTreeSet::new()));
                let added = match entry {
                    Value::Set(s) => members.into_iter().filter(|m| s.insert(m.clone())).count(),
                    Value::Str(_) => 0,
                };
                if added > 0 {
                    self.touch(&set);
                    events.push((set, "sadd"));
                }
                added
            }
            WriteOp::SRem { set, members } => {
                let (removed, now_empty) = match self.entries.get_mut(&set) {
                    Some(Value::Set(s)) => {
                        let removed = members.iter().filter(|m| s.remove(*m)).count();
                        (removed, s.is_empty())
                    }
                    _ => (0, false),
                };
                if now_empty {
                    self.entries.remove(&set);
                    self.forget(&set);
                } else if removed > 0 {
                    self.touch(&set);
                }
                if removed > 0 {
                    events.push((set, "srem"));
                }
                removed
            }
        }
    }
}

fn wrong_type() -> Response {
    Response::error(ErrorKind::WrongType, WRONG_TYPE)
}

/// One page of a cursor scan over sorted items.
///
/// The cursor is the number of items already walked; 0 means done.
fn scan_page<'a>(
    items: impl Iterator<Item = &'a String>,
    cursor: u64,
    pattern: Option<&str>,
    count: usize,
) -> (u64, Vec<String>) {
    let count = count.max(1);
    let mut walked = 0u64;
    let mut keys = Vec::new();
    let mut exhausted = true;

    for item in items.skip(cursor as usize) {
        if walked as usize == count {
            exhausted = false;
            break;
        }
        walked += 1;
        if pattern.map_or(true, |p| glob_match(p, item)) {
            keys.push(item.clone());
        }
    }

    let next = if exhausted { 0 } else { cursor + walked };
    (next, keys)
}

/// In-memory backend engine
#[derive(Default)]
pub struct Keyspace {
    data: RwLock<Data>,
    hub: PubSubHub,
    loading: AtomicBool,
}

impl Keyspace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pub/sub registry shared by every subscriber connection
    pub fn hub(&self) -> &PubSubHub {
        &self.hub
    }

    /// While loading, data commands answer `BusyLoading`
    pub fn set_loading(&self, loading: bool) {
        self.loading.store(loading, Ordering::SeqCst);
    }

    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::SeqCst)
    }

    pub fn key_count(&self) -> usize {
        self.data.read().entries.len()
    }

    /// Execute a request and build its response
    pub fn execute(&self, request: Request) -> Response {
        trace!(op = ?request.opcode(), "Executing request");

        if request.is_pubsub() {
            return Response::error(
                ErrorKind::Protocol,
                "subscribe commands need a subscriber connection",
            );
        }
        if self.is_loading() && !matches!(request, Request::Ping) {
            return Response::error(
                ErrorKind::BusyLoading,
                "LOADING backend is loading the dataset in memory",
            );
        }

        match request {
            Request::Ping => Response::Pong,
            Request::Get { key } => {
                let data = self.data.read();
                match data.get_str(&key) {
                    Ok(value) => Response::Value(value.cloned()),
                    Err(e) => e,
                }
            }
            Request::MGet { keys } => {
                let data = self.data.read();
                Response::Values(
                    keys.iter()
                        .map(|k| data.get_str(k).ok().flatten().cloned())
                        .collect(),
                )
            }
            Request::SMembers { set } => {
                let data = self.data.read();
                match data.get_set(&set) {
                    Ok(members) => {
                        Response::Members(members.map(|s| s.iter().cloned().collect()).unwrap_or_default())
                    }
                    Err(e) => e,
                }
            }
            Request::SScan {
                set,
                cursor,
                pattern,
                count,
            } => {
                let data = self.data.read();
                match data.get_set(&set) {
                    Ok(Some(members)) => {
                        let (cursor, keys) =
                            scan_page(members.iter(), cursor, pattern.as_deref(), count);
                        Response::Scan { cursor, keys }
                    }
                    Ok(None) => Response::Scan {
                        cursor: 0,
                        keys: Vec::new(),
                    },
                    Err(e) => e,
                }
            }
            Request::Scan {
                cursor,
                pattern,
                count,
            } => {
                let data = self.data.read();
                let (cursor, keys) =
                    scan_page(data.entries.keys(), cursor, pattern.as_deref(), count);
                Response::Scan { cursor, keys }
            }
            Request::WatchGet { keys } => {
                let data = self.data.read();
                Response::Versioned(
                    keys.iter()
                        .map(|k| (data.get_str(k).ok().flatten().cloned(), data.version(k)))
                        .collect(),
                )
            }
            Request::Set { key, value } => match self.write(vec![WriteOp::Set { key, value }]) {
                Ok(_) => Response::Ok,
                Err(e) => e,
            },
            Request::MSet { pairs } => {
                let ops = pairs
                    .into_iter()
                    .map(|(key, value)| WriteOp::Set { key, value })
                    .collect();
                match self.write(ops) {
                    Ok(_) => Response::Ok,
                    Err(e) => e,
                }
            }
            Request::Del { keys } => {
                let ops = keys.into_iter().map(|key| WriteOp::Del { key }).collect();
                match self.write(ops) {
                    Ok(n) => Response::Int(n as i64),
                    Err(e) => e,
                }
            }
            Request::SAdd { set, members } => match self.write(vec![WriteOp::SAdd { set, members }]) {
                Ok(n) => Response::Int(n as i64),
                Err(e) => e,
            },
            Request::SRem { set, members } => match self.write(vec![WriteOp::SRem { set, members }]) {
                Ok(n) => Response::Int(n as i64),
                Err(e) => e,
            },
            Request::Exec { watched, ops } => self.exec(watched, ops),
            Request::Publish { channel, message } => {
                Response::Int(self.hub.publish(&channel, &message) as i64)
            }
            Request::FlushDb => {
                self.flush();
                Response::Ok
            }
            Request::Subscribe { .. }
            | Request::PSubscribe { .. }
            | Request::Unsubscribe { .. }
            | Request::PUnsubscribe { .. } => {
                Response::error(ErrorKind::Protocol, "unexpected subscribe command")
            }
        }
    }

    /// Apply ops atomically; all are type-checked before any is applied.
    ///
    /// Notifications go out before the write lock is released so that
    /// subscribers see each key's changes in commit order.
    fn write(&self, ops: Vec<WriteOp>) -> Result<usize, Response> {
        let mut data = self.data.write();
        for op in &ops {
            data.check(op)?;
        }
        let mut events = Vec::with_capacity(ops.len());
        let changed = ops.into_iter().map(|op| data.apply(op, &mut events)).sum();
        self.notify(events);
        Ok(changed)
    }

    fn exec(&self, watched: Vec<(String, u64)>, ops: Vec<WriteOp>) -> Response {
        let mut data = self.data.write();
        if let Some((key, _)) = watched.iter().find(|(k, v)| data.version(k) != *v) {
            debug!(key = %key, "Watched key changed; aborting transaction");
            return Response::Committed(false);
        }
        for op in &ops {
            if let Err(e) = data.check(op) {
                return e;
            }
        }
        let mut events = Vec::with_capacity(ops.len());
        for op in ops {
            data.apply(op, &mut events);
        }
        self.notify(events);
        Response::Committed(true)
    }

    fn flush(&self) {
        let mut data = self.data.write();
        let keys = data.entries.len();
        data.entries.clear();
        data.versions.clear();
        data.clock += 1;
        data.removed_at = data.clock;
        debug!(keys, "Flushed keyspace");
    }

    fn notify(&self, events: Vec<(String, &'static str)>) {
        for (key, op) in events {
            self.hub.publish(&keyspace_channel(&key), op);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(key: &str, value: &str) -> Request {
        Request::Set {
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    #[test]
    fn test_scan_pages_cover_everything() {
        let ks = Keyspace::new();
        for i in 0..25 {
            ks.execute(set(&format!("k{:02}", i), "v"));
        }

        let mut cursor = 0;
        let mut seen = Vec::new();
        loop {
            let (next, keys) = ks
                .execute(Request::Scan {
                    cursor,
                    pattern: None,
                    count: 10,
                })
                .into_scan()
                .unwrap();
            seen.extend(keys);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        assert_eq!(seen.len(), 25);
    }

    #[test]
    fn test_delete_bumps_version() {
        let ks = Keyspace::new();
        ks.execute(set("a", "1"));
        let v1 = ks.execute(Request::WatchGet { keys: vec!["a".into()] }).into_versioned().unwrap()[0].1;
        ks.execute(Request::Del { keys: vec!["a".into()] });
        let v2 = ks.execute(Request::WatchGet { keys: vec!["a".into()] }).into_versioned().unwrap()[0].1;
        assert!(v2 > v1);
    }

    #[test]
    fn test_removed_keys_keep_no_version() {
        let ks = Keyspace::new();
        for i in 0..10 {
            ks.execute(set(&format!("k{}", i), "v"));
            ks.execute(Request::Del { keys: vec![format!("k{}", i)] });
        }
        ks.execute(Request::SAdd { set: "s".into(), members: vec!["m".into()] });
        ks.execute(Request::SRem { set: "s".into(), members: vec!["m".into()] });
        assert!(ks.data.read().versions.is_empty());

        ks.execute(set("live", "v"));
        ks.execute(Request::FlushDb);
        assert!(ks.data.read().versions.is_empty());
    }

    #[test]
    fn test_absent_key_watch_sees_recreate_and_delete() {
        let ks = Keyspace::new();
        let absent = ks.execute(Request::WatchGet { keys: vec!["a".into()] }).into_versioned().unwrap()[0].1;

        ks.execute(set("a", "1"));
        ks.execute(Request::Del { keys: vec!["a".into()] });

        let response = ks.execute(Request::Exec {
            watched: vec![("a".into(), absent)],
            ops: vec![WriteOp::Set { key: "a".into(), value: "mine".into() }],
        });
        assert_eq!(response, Response::Committed(false));
    }

    #[test]
    fn test_wrong_type_rejects_whole_exec() {
        let ks = Keyspace::new();
        ks.execute(set("s", "str"));
        let resp = ks.execute(Request::Exec {
            watched: vec![],
            ops: vec![
                WriteOp::Set { key: "x".into(), value: "1".into() },
                WriteOp::SAdd { set: "s".into(), members: vec!["m".into()] },
            ],
        });
        assert!(matches!(resp, Response::Error { kind: ErrorKind::WrongType, .. }));
        assert_eq!(ks.execute(Request::Get { key: "x".into() }), Response::Value(None));
    }
}
