//! Shared fixtures for integration tests
//!
//! Every fixture runs against an in-process `MemoryCluster`. The
//! connector wraps each backend so tests can inject errors and observe
//! the requests that reached the backend.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use objstore::backend::{Backend, Connector, MemoryCluster, PubSub};
use objstore::config::{BackendAddr, StaticAddresses, StoreConfig};
use objstore::error::{ObjStoreError, Result};
use objstore::keyspace::Keyspace;
use objstore::protocol::{Request, Response};
use objstore::store::ObjectStore;
use parking_lot::Mutex;

pub const HOST: &str = "node-a";
pub const PORT: u16 = 6379;

/// Error injected in place of a backend call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Transient,
    Busy,
    WrongType,
}

impl Fault {
    fn error(self) -> ObjStoreError {
        match self {
            Fault::Transient => ObjStoreError::Connection("injected connection reset".to_string()),
            Fault::Busy => ObjStoreError::Busy("LOADING injected".to_string()),
            Fault::WrongType => ObjStoreError::Command("WRONGTYPE injected".to_string()),
        }
    }
}

/// Runs before a watched EXEC reaches the backend; returns whether to
/// stay installed
pub type ExecHook = Box<dyn FnMut() -> bool + Send>;

/// Script and log shared by every wrapped backend
#[derive(Default)]
pub struct Recorder {
    pub faults: Mutex<VecDeque<Fault>>,
    pub requests: Mutex<Vec<Request>>,
    pub before_exec: Mutex<Option<ExecHook>>,
}

impl Recorder {
    pub fn inject(&self, fault: Fault, times: usize) {
        let mut faults = self.faults.lock();
        for _ in 0..times {
            faults.push_back(fault);
        }
    }

    pub fn count(&self, pred: impl Fn(&Request) -> bool) -> usize {
        self.requests.lock().iter().filter(|r| pred(r)).count()
    }

    pub fn exec_count(&self) -> usize {
        self.count(|r| matches!(r, Request::Exec { .. }))
    }

    pub fn clear(&self) {
        self.requests.lock().clear();
    }
}

struct ScriptedBackend {
    inner: Arc<dyn Backend>,
    recorder: Arc<Recorder>,
}

impl Backend for ScriptedBackend {
    fn call(&self, request: Request) -> Result<Response> {
        self.recorder.requests.lock().push(request.clone());
        if let Some(fault) = self.recorder.faults.lock().pop_front() {
            return Err(fault.error());
        }

        if matches!(&request, Request::Exec { watched, .. } if !watched.is_empty()) {
            let hook = self.recorder.before_exec.lock().take();
            if let Some(mut hook) = hook {
                if hook() {
                    *self.recorder.before_exec.lock() = Some(hook);
                }
            }
        }
        self.inner.call(request)
    }

    fn pubsub(&self) -> Result<Box<dyn PubSub>> {
        self.inner.pubsub()
    }

    fn addr(&self) -> &BackendAddr {
        self.inner.addr()
    }
}

pub struct ScriptedConnector {
    pub cluster: Arc<MemoryCluster>,
    pub recorder: Arc<Recorder>,
}

impl Connector for ScriptedConnector {
    fn connect(&self, addr: &BackendAddr, config: &StoreConfig) -> Result<Arc<dyn Backend>> {
        let inner = self.cluster.connect(addr, config)?;
        Ok(Arc::new(ScriptedBackend {
            inner,
            recorder: Arc::clone(&self.recorder),
        }))
    }
}

pub struct Fixture {
    pub store: ObjectStore,
    pub cluster: Arc<MemoryCluster>,
    pub keyspace: Arc<Keyspace>,
    pub recorder: Arc<Recorder>,
    pub addresses: Arc<StaticAddresses>,
}

/// Fast timings so retry and bus tests finish quickly
pub fn test_config() -> StoreConfig {
    StoreConfig::builder()
        .max_retries(3)
        .base_retry_wait_ms(1)
        .busy_base_wait_ms(1)
        .max_busy_retries(3)
        .busy_max_wait_ms(4)
        .max_txn_retries(5)
        .async_pool_size(4)
        .subscribe_timeout_ms(2000)
        .bus_poll_interval_ms(5)
        .bus_reconnect_base_ms(10)
        .bus_reconnect_max_ms(50)
        .page_size(10)
        .keys_per_scan(7)
        .build()
}

pub fn fixture() -> Fixture {
    fixture_with(test_config())
}

pub fn fixture_with(config: StoreConfig) -> Fixture {
    let cluster = Arc::new(MemoryCluster::new());
    let keyspace = cluster.node(&BackendAddr::new(HOST, PORT));
    let recorder = Arc::new(Recorder::default());
    let addresses = Arc::new(StaticAddresses::single(HOST, PORT));
    let connector = Arc::new(ScriptedConnector {
        cluster: Arc::clone(&cluster),
        recorder: Arc::clone(&recorder),
    });
    let store = ObjectStore::connect(config, addresses.clone(), connector);

    Fixture {
        store,
        cluster,
        keyspace,
        recorder,
        addresses,
    }
}

/// Poll `cond` until it holds or `timeout` passes
pub fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}
