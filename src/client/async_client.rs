//! Async client
//!
//! Non-blocking façade over the blocking drivers. Each attempt runs on a
//! bounded worker pool (`spawn_blocking` gated by a semaphore); retry
//! delays are tokio timers on the caller's runtime, so no worker is held
//! while waiting.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use super::retry::{Decision, RetryEvent, RetryHook, RetryPolicy, RetryState};
use crate::connection::ConnectionManager;
use crate::error::{ObjStoreError, Result};
use crate::protocol::{Request, Response, WriteOp};
use crate::record::EntityKind;

/// Bounded pool for blocking backend calls
#[derive(Debug, Clone)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Permits not currently held by a running call
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Run `work` on a blocking thread once a permit is free
    pub async fn run<F, T>(&self, work: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| ObjStoreError::Internal("worker pool closed".to_string()))?;

        tokio::task::spawn_blocking(move || {
            // Released when the work finishes, even if the caller went away
            let _permit = permit;
            work()
        })
        .await
        .map_err(|e| ObjStoreError::Internal(format!("worker task failed: {}", e)))?
    }
}

/// Async backend client
#[derive(Clone)]
pub struct AsyncClient {
    manager: Arc<ConnectionManager>,
    policy: RetryPolicy,
    pool: WorkerPool,
    hook: Option<RetryHook>,
}

impl AsyncClient {
    pub fn new(manager: Arc<ConnectionManager>, pool: WorkerPool) -> Self {
        let policy = RetryPolicy::from_config(manager.config());
        Self {
            manager,
            policy,
            pool,
            hook: None,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_retry_hook(mut self, hook: RetryHook) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Send `request` to the backend of `kind`, retrying per the policy
    pub async fn call(&self, kind: EntityKind, request: Request) -> Result<Response> {
        let mut state = RetryState::default();
        loop {
            let manager = Arc::clone(&self.manager);
            let attempt_request = request.clone();
            let result = self
                .pool
                .run(move || manager.get(kind)?.backend().call(attempt_request))
                .await;

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
                    tokio::time::sleep(delay).await;
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

    /// Callback form of `call`. Must be invoked inside a tokio runtime;
    /// the callback runs exactly once.
    pub fn submit<F>(&self, kind: EntityKind, request: Request, callback: F) -> JoinHandle<()>
    where
        F: FnOnce(Result<Response>) + Send + 'static,
    {
        let client = self.clone();
        tokio::spawn(async move {
            let result = client.call(kind, request).await;
            callback(result);
        })
    }

    // =========================================================================
    // Verbs
    // =========================================================================

    pub async fn ping(&self, kind: EntityKind) -> Result<()> {
        self.call(kind, Request::Ping).await?.into_unit()
    }

    pub async fn get(&self, kind: EntityKind, key: &str) -> Result<Option<String>> {
        self.call(kind, Request::Get { key: key.to_string() })
            .await?
            .into_value()
    }

    pub async fn set(&self, kind: EntityKind, key: &str, value: &str) -> Result<()> {
        let request = Request::Set {
            key: key.to_string(),
            value: value.to_string(),
        };
        self.call(kind, request).await?.into_unit()
    }

    pub async fn del(&self, kind: EntityKind, keys: Vec<String>) -> Result<i64> {
        self.call(kind, Request::Del { keys }).await?.into_int()
    }

    pub async fn mget(&self, kind: EntityKind, keys: Vec<String>) -> Result<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        self.call(kind, Request::MGet { keys }).await?.into_values()
    }

    pub async fn mset(&self, kind: EntityKind, pairs: Vec<(String, String)>) -> Result<()> {
        if pairs.is_empty() {
            return Ok(());
        }
        self.call(kind, Request::MSet { pairs }).await?.into_unit()
    }

    pub async fn sadd(&self, kind: EntityKind, set: &str, members: Vec<String>) -> Result<i64> {
        let request = Request::SAdd {
            set: set.to_string(),
            members,
        };
        self.call(kind, request).await?.into_int()
    }

    pub async fn srem(&self, kind: EntityKind, set: &str, members: Vec<String>) -> Result<i64> {
        let request = Request::SRem {
            set: set.to_string(),
            members,
        };
        self.call(kind, request).await?.into_int()
    }

    pub async fn smembers(&self, kind: EntityKind, set: &str) -> Result<Vec<String>> {
        self.call(kind, Request::SMembers { set: set.to_string() })
            .await?
            .into_members()
    }

    /// Every member of a set, collected with repeated SSCANs
    pub async fn sscan_all(&self, kind: EntityKind, set: &str, count: usize) -> Result<Vec<String>> {
        let mut cursor = 0;
        let mut members = Vec::new();
        loop {
            let request = Request::SScan {
                set: set.to_string(),
                cursor,
                pattern: None,
                count,
            };
            let (next, page) = self.call(kind, request).await?.into_scan()?;
            members.extend(page);
            if next == 0 {
                return Ok(members);
            }
            cursor = next;
        }
    }

    /// Every key matching `pattern`, collected with repeated SCANs
    pub async fn scan_all(&self, kind: EntityKind, pattern: &str, count: usize) -> Result<Vec<String>> {
        let mut cursor = 0;
        let mut keys = Vec::new();
        loop {
            let request = Request::Scan {
                cursor,
                pattern: Some(pattern.to_string()),
                count,
            };
            let (next, page) = self.call(kind, request).await?.into_scan()?;
            keys.extend(page);
            if next == 0 {
                return Ok(keys);
            }
            cursor = next;
        }
    }

    pub async fn watch_get(
        &self,
        kind: EntityKind,
        keys: Vec<String>,
    ) -> Result<Vec<(Option<String>, u64)>> {
        self.call(kind, Request::WatchGet { keys })
            .await?
            .into_versioned()
    }

    pub async fn exec(
        &self,
        kind: EntityKind,
        watched: Vec<(String, u64)>,
        ops: Vec<WriteOp>,
    ) -> Result<bool> {
        self.call(kind, Request::Exec { watched, ops })
            .await?
            .into_committed()
    }

    pub async fn publish(&self, kind: EntityKind, channel: &str, message: &str) -> Result<i64> {
        let request = Request::Publish {
            channel: channel.to_string(),
            message: message.to_string(),
        };
        self.call(kind, request).await?.into_int()
    }

    pub async fn flush_db(&self, kind: EntityKind) -> Result<()> {
        self.call(kind, Request::FlushDb).await?.into_unit()
    }
}
