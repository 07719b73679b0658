//! Blocking client with retries
//!
//! Every call resolves the entity kind's binding, sends the request and
//! classifies failures through the `RetryPolicy`.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{error, warn};

use super::retry::{Decision, RetryEvent, RetryHook, RetryPolicy, RetryState};
use crate::backend::PubSub;
use crate::connection::ConnectionManager;
use crate::error::Result;
use crate::protocol::{Request, Response, WriteOp};
use crate::record::EntityKind;

/// Sleeps between retries; swapped out in tests
pub type Sleeper = Arc<dyn Fn(Duration) + Send + Sync>;

/// Blocking backend client
#[derive(Clone)]
pub struct RetryingClient {
    manager: Arc<ConnectionManager>,
    policy: RetryPolicy,
    sleeper: Sleeper,
    hook: Option<RetryHook>,
}

impl RetryingClient {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        let policy = RetryPolicy::from_config(manager.config());
        Self {
            manager,
            policy,
            sleeper: Arc::new(thread::sleep),
            hook: None,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Sleeper) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_retry_hook(mut self, hook: RetryHook) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Send `request` to the backend of `kind`, retrying per the policy
    pub fn call(&self, kind: EntityKind, request: Request) -> Result<Response> {
        let mut state = RetryState::default();
        loop {
            let result = self
                .manager
                .get(kind)
                .and_then(|binding| binding.backend().call(request.clone()));

            let err = match result {
                Ok(response) => return Ok(response),
                Err(e) => e,
            };

            match self.policy.on_error(&mut state, &err) {
                Decision::Retry { delay, busy } => {
                    let attempt = if busy { state.busy_retries } else { state.retries };
                    warn!(
                        %kind,
                        op = ?request.opcode(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        busy,
                        "Retrying backend call: {}",
                        err
                    );
                    if let Some(hook) = &self.hook {
                        hook(&RetryEvent {
                            kind,
                            op: request.opcode(),
                            attempt,
                            delay,
                            busy,
                            error: err.to_string(),
                        });
                    }
                    (self.sleeper)(delay);
                }
                Decision::Fail => {
                    if state.total() > 0 {
                        error!(
                            %kind,
                            op = ?request.opcode(),
                            retries = state.total(),
                            "Backend call failed after retries: {}",
                            err
                        );
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Dedicated subscriber connection to the backend of `kind`
    pub fn pubsub(&self, kind: EntityKind) -> Result<Box<dyn PubSub>> {
        self.manager.get(kind)?.backend().pubsub()
    }

    // =========================================================================
    // Verbs
    // =========================================================================

    pub fn ping(&self, kind: EntityKind) -> Result<()> {
        self.call(kind, Request::Ping)?.into_unit()
    }

    pub fn get(&self, kind: EntityKind, key: &str) -> Result<Option<String>> {
        self.call(kind, Request::Get { key: key.to_string() })?
            .into_value()
    }

    pub fn set(&self, kind: EntityKind, key: &str, value: &str) -> Result<()> {
        self.call(
            kind,
            Request::Set {
                key: key.to_string(),
                value: value.to_string(),
            },
        )?
        .into_unit()
    }

    pub fn del(&self, kind: EntityKind, keys: Vec<String>) -> Result<i64> {
        self.call(kind, Request::Del { keys })?.into_int()
    }

    pub fn mget(&self, kind: EntityKind, keys: Vec<String>) -> Result<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        self.call(kind, Request::MGet { keys })?.into_values()
    }

    pub fn mset(&self, kind: EntityKind, pairs: Vec<(String, String)>) -> Result<()> {
        if pairs.is_empty() {
            return Ok(());
        }
        self.call(kind, Request::MSet { pairs })?.into_unit()
    }

    pub fn sadd(&self, kind: EntityKind, set: &str, members: Vec<String>) -> Result<i64> {
        self.call(
            kind,
            Request::SAdd {
                set: set.to_string(),
                members,
            },
        )?
        .into_int()
    }

    pub fn srem(&self, kind: EntityKind, set: &str, members: Vec<String>) -> Result<i64> {
        self.call(
            kind,
            Request::SRem {
                set: set.to_string(),
                members,
            },
        )?
        .into_int()
    }

    pub fn smembers(&self, kind: EntityKind, set: &str) -> Result<Vec<String>> {
        self.call(kind, Request::SMembers { set: set.to_string() })?
            .into_members()
    }

    pub fn sscan(
        &self,
        kind: EntityKind,
        set: &str,
        cursor: u64,
        pattern: Option<&str>,
        count: usize,
    ) -> Result<(u64, Vec<String>)> {
        self.call(
            kind,
            Request::SScan {
                set: set.to_string(),
                cursor,
                pattern: pattern.map(str::to_string),
                count,
            },
        )?
        .into_scan()
    }

    /// Every member of a set, collected with repeated SSCANs
    pub fn sscan_all(&self, kind: EntityKind, set: &str, count: usize) -> Result<Vec<String>> {
        let mut cursor = 0;
        let mut members = Vec::new();
        loop {
            let (next, page) = self.sscan(kind, set, cursor, None, count)?;
            members.extend(page);
            if next == 0 {
                return Ok(members);
            }
            cursor = next;
        }
    }

    pub fn scan(
        &self,
        kind: EntityKind,
        cursor: u64,
        pattern: Option<&str>,
        count: usize,
    ) -> Result<(u64, Vec<String>)> {
        self.call(
            kind,
            Request::Scan {
                cursor,
                pattern: pattern.map(str::to_string),
                count,
            },
        )?
        .into_scan()
    }

    /// Every key matching `pattern`, collected with repeated SCANs
    pub fn scan_all(&self, kind: EntityKind, pattern: &str, count: usize) -> Result<Vec<String>> {
        let mut cursor = 0;
        let mut keys = Vec::new();
        loop {
            let (next, page) = self.scan(kind, cursor, Some(pattern), count)?;
            keys.extend(page);
            if next == 0 {
                return Ok(keys);
            }
            cursor = next;
        }
    }

    /// Values and versions to watch in a following `exec`
    pub fn watch_get(&self, kind: EntityKind, keys: Vec<String>) -> Result<Vec<(Option<String>, u64)>> {
        self.call(kind, Request::WatchGet { keys })?.into_versioned()
    }

    /// Commit `ops` if no watched key moved; false on conflict
    pub fn exec(&self, kind: EntityKind, watched: Vec<(String, u64)>, ops: Vec<WriteOp>) -> Result<bool> {
        self.call(kind, Request::Exec { watched, ops })?.into_committed()
    }

    pub fn publish(&self, kind: EntityKind, channel: &str, message: &str) -> Result<i64> {
        self.call(
            kind,
            Request::Publish {
                channel: channel.to_string(),
                message: message.to_string(),
            },
        )?
        .into_int()
    }

    pub fn flush_db(&self, kind: EntityKind) -> Result<()> {
        self.call(kind, Request::FlushDb)?.into_unit()
    }
}
