//! ChangeBus Module
//!
//! Typed change notifications built on backend keyspace notifications.
//!
//! ## Responsibilities
//! - One worker thread per entity kind, started on first subscription
//! - Subscribe/unsubscribe that wait for the backend's acknowledgement
//! - Reconnect with backoff and re-subscribe; notifications published
//!   while disconnected are lost
//! - Load the changed records with one MGET per batch and call handlers
//!
//! ## Delivery
//! Events for one key arrive in the order the backend published them.
//! There is no ordering across keys within a batch. Handlers run on the
//! worker thread; a failing or panicking handler is logged and skipped.

mod event;
mod state;
mod worker;

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

use crossbeam::channel::{unbounded, Sender};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{ObjStoreError, Result, SubscriptionError};
use crate::keyspace::keyspace_channel;
use crate::record::codec::format_key;
use crate::record::{EntityKind, StoredObject};
use crate::store::ObjectStore;
use worker::{Command, Worker};

pub use event::{ChangeEvent, ChangeHandler, ChangeOp, ChangeSink, Notification, TypedSink};
pub use state::BusStatus;

type AckReceiver = oneshot::Receiver<std::result::Result<(), SubscriptionError>>;

struct WorkerHandle {
    commands: Sender<Command>,
    status: Arc<Mutex<BusStatus>>,
    thread: Option<thread::JoinHandle<()>>,
}

/// Registry of change bus workers, one per entity kind
pub struct ChangeBus {
    store: ObjectStore,
    workers: Mutex<HashMap<EntityKind, WorkerHandle>>,
}

impl ChangeBus {
    pub fn new(store: ObjectStore) -> Self {
        Self {
            store,
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Keyspace channel (or channel pattern) for a typed id pattern
    pub fn channel_for(kind: EntityKind, pattern: &str) -> String {
        keyspace_channel(&format_key(kind, pattern))
    }

    /// Subscribe to changes of records whose id matches `pattern`.
    ///
    /// Blocks until the backend confirms or the subscribe timeout passes.
    /// Must not be called from inside an async runtime; use
    /// `subscribe_async` there. A handler of the same kind cannot call it
    /// either, since the ack would come from the thread it is blocking;
    /// that call fails with `SubscriptionError::OnWorkerThread`.
    pub fn subscribe<T, F>(&self, pattern: &str, handler: F, get_object: bool) -> Result<()>
    where
        T: StoredObject,
        F: Fn(ChangeEvent<T>) -> Result<()> + Send + Sync + 'static,
    {
        ensure_off_worker(T::KIND)?;
        let (kind, ack) = self.request_subscribe::<T>(pattern, Arc::new(handler), get_object)?;
        wait_blocking(kind, ack)
    }

    pub async fn subscribe_async<T, F>(&self, pattern: &str, handler: F, get_object: bool) -> Result<()>
    where
        T: StoredObject,
        F: Fn(ChangeEvent<T>) -> Result<()> + Send + Sync + 'static,
    {
        let (kind, ack) = self.request_subscribe::<T>(pattern, Arc::new(handler), get_object)?;
        wait_async(kind, ack).await
    }

    /// Stop receiving changes for a pattern given to `subscribe`.
    /// Same blocking rules as `subscribe`.
    pub fn unsubscribe<T: StoredObject>(&self, pattern: &str) -> Result<()> {
        ensure_off_worker(T::KIND)?;
        let (kind, ack) = self.request_unsubscribe::<T>(pattern)?;
        wait_blocking(kind, ack)
    }

    pub async fn unsubscribe_async<T: StoredObject>(&self, pattern: &str) -> Result<()> {
        let (kind, ack) = self.request_unsubscribe::<T>(pattern)?;
        wait_async(kind, ack).await
    }

    /// Current state of the worker for `kind`, if one was started
    pub fn state(&self, kind: EntityKind) -> Option<BusStatus> {
        self.workers
            .lock()
            .get(&kind)
            .map(|handle| handle.status.lock().clone())
    }

    /// Stop every worker and wait for them to exit
    pub fn shutdown(&self) {
        let handles: Vec<(EntityKind, WorkerHandle)> = self.workers.lock().drain().collect();
        for (kind, mut handle) in handles {
            let _ = handle.commands.send(Command::Shutdown);
            if let Some(thread) = handle.thread.take() {
                if thread.join().is_err() {
                    warn!(%kind, "Change bus worker panicked");
                }
            }
        }
    }

    // =========================================================================
    // Internal
    // =========================================================================

    fn request_subscribe<T: StoredObject>(
        &self,
        pattern: &str,
        handler: ChangeHandler<T>,
        get_object: bool,
    ) -> Result<(EntityKind, AckReceiver)> {
        let channel = Self::channel_for(T::KIND, pattern);
        let sink = Arc::new(TypedSink::new(self.store.clone(), handler, get_object));
        let (ack, rx) = oneshot::channel();
        self.send(
            T::KIND,
            Command::Subscribe {
                channel,
                sink,
                ack,
            },
        )?;
        Ok((T::KIND, rx))
    }

    fn request_unsubscribe<T: StoredObject>(&self, pattern: &str) -> Result<(EntityKind, AckReceiver)> {
        let channel = Self::channel_for(T::KIND, pattern);
        let (ack, rx) = oneshot::channel();
        self.send(T::KIND, Command::Unsubscribe { channel, ack })?;
        Ok((T::KIND, rx))
    }

    fn send(&self, kind: EntityKind, command: Command) -> Result<()> {
        let mut workers = self.workers.lock();
        if !workers.contains_key(&kind) {
            workers.insert(kind, self.spawn(kind)?);
        }
        let handle = workers
            .get(&kind)
            .ok_or_else(|| ObjStoreError::Internal(format!("no change bus worker for {}", kind)))?;
        handle
            .commands
            .send(command)
            .map_err(|_| SubscriptionError::WorkerGone(kind.to_string()).into())
    }

    fn spawn(&self, kind: EntityKind) -> Result<WorkerHandle> {
        let (commands, receiver) = unbounded();
        let status = Arc::new(Mutex::new(BusStatus::Disconnected { failures: 0 }));
        let worker = Worker::new(
            kind,
            Arc::clone(self.store.manager()),
            receiver,
            Arc::clone(&status),
        );

        let thread = thread::Builder::new()
            .name(worker_thread_name(kind))
            .spawn(move || worker.run())?;
        debug!(%kind, "Spawned change bus worker");

        Ok(WorkerHandle {
            commands,
            status,
            thread: Some(thread),
        })
    }
}

impl Drop for ChangeBus {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_thread_name(kind: EntityKind) -> String {
    format!("changebus-{}", kind)
}

/// Refuse to block the worker thread on its own ack
fn ensure_off_worker(kind: EntityKind) -> Result<()> {
    if thread::current().name() == Some(worker_thread_name(kind).as_str()) {
        return Err(SubscriptionError::OnWorkerThread(kind.to_string()).into());
    }
    Ok(())
}

fn wait_blocking(kind: EntityKind, ack: AckReceiver) -> Result<()> {
    match ack.blocking_recv() {
        Ok(result) => result.map_err(ObjStoreError::from),
        Err(_) => Err(SubscriptionError::WorkerGone(kind.to_string()).into()),
    }
}

async fn wait_async(kind: EntityKind, ack: AckReceiver) -> Result<()> {
    match ack.await {
        Ok(result) => result.map_err(ObjStoreError::from),
        Err(_) => Err(SubscriptionError::WorkerGone(kind.to_string()).into()),
    }
}
