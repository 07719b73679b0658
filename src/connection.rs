//! Connection Manager
//!
//! One backend binding per entity kind, bound to whatever address the
//! `AddressSource` currently reports.
//!
//! ## Concurrency Model
//! - Lookups take the read guard only; a cache hit never blocks another hit
//! - Building a binding happens outside any lock
//! - The write guard is held just long enough to swap the new binding in,
//!   re-checking in case a concurrent caller won the race

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::backend::{Backend, Connector};
use crate::config::{AddressSource, BackendAddr, StoreConfig};
use crate::error::Result;
use crate::record::EntityKind;

/// A backend driver together with the address it was built for
pub struct Binding {
    addr: BackendAddr,
    backend: Arc<dyn Backend>,
}

impl Binding {
    pub fn addr(&self) -> &BackendAddr {
        &self.addr
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding").field("addr", &self.addr).finish()
    }
}

/// Registry of per-kind backend bindings
pub struct ConnectionManager {
    config: StoreConfig,
    addresses: Arc<dyn AddressSource>,
    connector: Arc<dyn Connector>,
    bindings: RwLock<HashMap<EntityKind, Arc<Binding>>>,
}

impl ConnectionManager {
    pub fn new(
        config: StoreConfig,
        addresses: Arc<dyn AddressSource>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            config,
            addresses,
            connector,
            bindings: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Binding for `kind`, rebuilt if the address moved since last time
    pub fn get(&self, kind: EntityKind) -> Result<Arc<Binding>> {
        let addr = self.addresses.resolve(kind)?;

        if let Some(binding) = self.bindings.read().get(&kind) {
            if binding.addr == addr {
                return Ok(Arc::clone(binding));
            }
        }

        self.rebuild(kind, addr)
    }

    /// Re-resolve the address of `kind`; returns whether the binding changed
    pub fn refresh(&self, kind: EntityKind) -> Result<bool> {
        let before = self.cached_addr(kind);
        let binding = self.get(kind)?;
        Ok(before.as_ref() != Some(&binding.addr))
    }

    /// Drop the cached binding of one kind
    pub fn invalidate(&self, kind: EntityKind) {
        if self.bindings.write().remove(&kind).is_some() {
            debug!(%kind, "Invalidated backend binding");
        }
    }

    /// Drop every cached binding
    pub fn clear(&self) {
        self.bindings.write().clear();
    }

    /// Address the cached binding of `kind` points at, if any
    pub fn cached_addr(&self, kind: EntityKind) -> Option<BackendAddr> {
        self.bindings.read().get(&kind).map(|b| b.addr.clone())
    }

    /// Current address of `kind` according to the address source
    pub fn resolve(&self, kind: EntityKind) -> Result<BackendAddr> {
        self.addresses.resolve(kind)
    }

    fn rebuild(&self, kind: EntityKind, addr: BackendAddr) -> Result<Arc<Binding>> {
        let backend = self.connector.connect(&addr, &self.config)?;

        let mut bindings = self.bindings.write();
        if let Some(existing) = bindings.get(&kind) {
            if existing.addr == addr {
                return Ok(Arc::clone(existing));
            }
            info!(%kind, from = %existing.addr, to = %addr, "Backend address changed");
        } else {
            debug!(%kind, %addr, "Binding backend");
        }

        let binding = Arc::new(Binding { addr, backend });
        bindings.insert(kind, Arc::clone(&binding));
        Ok(binding)
    }
}
