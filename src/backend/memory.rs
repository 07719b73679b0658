//! In-process backend driver
//!
//! Binds directly to a shared `Keyspace`. `MemoryCluster` maps addresses
//! to keyspaces so several "hosts" can live in one process.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError, TryRecvError};
use parking_lot::RwLock;
use tracing::debug;

use super::{Backend, Connector, PubSub};
use crate::config::{BackendAddr, StoreConfig};
use crate::error::{ObjStoreError, Result};
use crate::keyspace::{Keyspace, SubscriberId};
use crate::protocol::{PubSubMessage, Request, Response};

/// Driver calling into an in-process keyspace
pub struct MemoryBackend {
    addr: BackendAddr,
    keyspace: Arc<Keyspace>,
}

impl MemoryBackend {
    pub fn new(addr: BackendAddr, keyspace: Arc<Keyspace>) -> Self {
        Self { addr, keyspace }
    }

    pub fn keyspace(&self) -> &Arc<Keyspace> {
        &self.keyspace
    }
}

impl Backend for MemoryBackend {
    fn call(&self, request: Request) -> Result<Response> {
        self.keyspace.execute(request).into_result()
    }

    fn pubsub(&self) -> Result<Box<dyn PubSub>> {
        Ok(Box::new(MemoryPubSub::new(Arc::clone(&self.keyspace))))
    }

    fn addr(&self) -> &BackendAddr {
        &self.addr
    }
}

/// Subscriber registered directly with a keyspace hub
pub struct MemoryPubSub {
    keyspace: Arc<Keyspace>,
    id: SubscriberId,
    receiver: Receiver<PubSubMessage>,
}

impl MemoryPubSub {
    pub fn new(keyspace: Arc<Keyspace>) -> Self {
        let (id, receiver) = keyspace.hub().register();
        Self {
            keyspace,
            id,
            receiver,
        }
    }
}

fn disconnected() -> ObjStoreError {
    ObjStoreError::Connection("subscriber connection closed".to_string())
}

impl PubSub for MemoryPubSub {
    fn send(&mut self, request: Request) -> Result<()> {
        let hub = self.keyspace.hub();
        match request {
            Request::Subscribe { channels } => hub.subscribe(self.id, &channels),
            Request::PSubscribe { patterns } => hub.psubscribe(self.id, &patterns),
            Request::Unsubscribe { channels } => hub.unsubscribe(self.id, &channels),
            Request::PUnsubscribe { patterns } => hub.punsubscribe(self.id, &patterns),
            other => {
                return Err(ObjStoreError::Protocol(format!(
                    "{:?} is not allowed on a subscriber connection",
                    other.opcode()
                )))
            }
        }
        Ok(())
    }

    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<PubSubMessage>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(message) => Ok(Some(message)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(disconnected()),
        }
    }

    fn try_recv(&mut self) -> Result<Option<PubSubMessage>> {
        match self.receiver.try_recv() {
            Ok(message) => Ok(Some(message)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(disconnected()),
        }
    }
}

impl Drop for MemoryPubSub {
    fn drop(&mut self) {
        self.keyspace.hub().remove(self.id);
    }
}

/// Address book of in-process keyspaces; a `Connector` for tests and
/// single-process deployments
#[derive(Default)]
pub struct MemoryCluster {
    nodes: RwLock<HashMap<BackendAddr, Arc<Keyspace>>>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keyspace at `addr`, created on first use
    pub fn node(&self, addr: &BackendAddr) -> Arc<Keyspace> {
        if let Some(keyspace) = self.nodes.read().get(addr) {
            return Arc::clone(keyspace);
        }
        let mut nodes = self.nodes.write();
        Arc::clone(nodes.entry(addr.clone()).or_default())
    }

    /// Take a node down; connecting to it fails until it is added again
    pub fn remove(&self, addr: &BackendAddr) -> Option<Arc<Keyspace>> {
        let removed = self.nodes.write().remove(addr);
        if let Some(keyspace) = &removed {
            keyspace.hub().disconnect_all();
        }
        removed
    }

    pub fn contains(&self, addr: &BackendAddr) -> bool {
        self.nodes.read().contains_key(addr)
    }
}

impl Connector for MemoryCluster {
    fn connect(&self, addr: &BackendAddr, _config: &StoreConfig) -> Result<Arc<dyn Backend>> {
        let keyspace = self
            .nodes
            .read()
            .get(addr)
            .cloned()
            .ok_or_else(|| ObjStoreError::Connection(format!("no backend at {}", addr)))?;
        debug!(%addr, "Bound in-memory backend");
        Ok(Arc::new(MemoryBackend::new(addr.clone(), keyspace)))
    }
}
