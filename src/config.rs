//! Configuration for objstore
//!
//! Centralized configuration with sensible defaults, loadable from a TOML
//! file with `[store]` and `[addresses]` tables.
//!
//! ```toml
//! [store]
//! max_retries = 5
//! base_retry_wait_ms = 100
//!
//! [addresses]
//! account_db = "10.0.0.5"
//! video_db = "10.0.0.6"
//! port = 6379
//! ```
//!
//! Backend addresses are resolved through an `AddressSource`, which may
//! change while the process runs. `FileAddressSource` re-reads its file
//! when it changes on disk; `StaticAddresses` is changed in code.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{ObjStoreError, Result};
use crate::record::EntityKind;

// =============================================================================
// Store Configuration
// =============================================================================

/// Tuning knobs for the clients, the object store and the change bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    // -------------------------------------------------------------------------
    // Retry Configuration
    // -------------------------------------------------------------------------
    /// Retries granted to a call failing with a transient error
    pub max_retries: u32,

    /// First transient retry delay; doubles on every retry
    pub base_retry_wait_ms: u64,

    /// First delay while the backend is loading its dataset
    pub busy_base_wait_ms: u64,

    /// Retries granted while the backend keeps answering busy
    pub max_busy_retries: u32,

    /// Upper bound of a single busy delay
    pub busy_max_wait_ms: u64,

    /// Attempts of an optimistic transaction before giving up on a conflict
    pub max_txn_retries: u32,

    // -------------------------------------------------------------------------
    // Connection Configuration
    // -------------------------------------------------------------------------
    /// Concurrent blocking calls the async client may run
    pub async_pool_size: usize,

    pub connect_timeout_ms: u64,

    pub socket_timeout_ms: u64,

    /// Idle connections kept per backend pool
    pub max_idle_connections: usize,

    // -------------------------------------------------------------------------
    // Change Bus Configuration
    // -------------------------------------------------------------------------
    /// How long (un)subscribe waits for the backend ack
    pub subscribe_timeout_ms: u64,

    /// Worker loop tick
    pub bus_poll_interval_ms: u64,

    pub bus_reconnect_base_ms: u64,

    pub bus_reconnect_max_ms: u64,

    // -------------------------------------------------------------------------
    // Iteration Configuration
    // -------------------------------------------------------------------------
    /// Records fetched per page by iterators
    pub page_size: usize,

    /// COUNT hint for SSCAN/SCAN
    pub keys_per_scan: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_retry_wait_ms: 100,
            busy_base_wait_ms: 200,
            max_busy_retries: 10,
            busy_max_wait_ms: 5000,
            max_txn_retries: 10,
            async_pool_size: 10,
            connect_timeout_ms: 2000,
            socket_timeout_ms: 10_000,
            max_idle_connections: 8,
            subscribe_timeout_ms: 10_000,
            bus_poll_interval_ms: 50,
            bus_reconnect_base_ms: 1000,
            bus_reconnect_max_ms: 30_000,
            page_size: 100,
            keys_per_scan: 1000,
        }
    }
}

impl StoreConfig {
    /// Create a new config builder
    pub fn builder() -> StoreConfigBuilder {
        StoreConfigBuilder::default()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn socket_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_timeout_ms)
    }

    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_millis(self.subscribe_timeout_ms)
    }

    pub fn bus_poll_interval(&self) -> Duration {
        Duration::from_millis(self.bus_poll_interval_ms)
    }

    /// Reconnect delay after `failures` consecutive failed attempts
    pub fn bus_reconnect_delay(&self, failures: u32) -> Duration {
        let factor = 1u64.checked_shl(failures.min(32)).unwrap_or(u64::MAX);
        let ms = self
            .bus_reconnect_base_ms
            .saturating_mul(factor)
            .min(self.bus_reconnect_max_ms);
        Duration::from_millis(ms)
    }
}

/// Builder for StoreConfig
#[derive(Default)]
pub struct StoreConfigBuilder {
    config: StoreConfig,
}

impl StoreConfigBuilder {
    /// Set the transient retry budget
    pub fn max_retries(mut self, count: u32) -> Self {
        self.config.max_retries = count;
        self
    }

    /// Set the first transient retry delay (in milliseconds)
    pub fn base_retry_wait_ms(mut self, ms: u64) -> Self {
        self.config.base_retry_wait_ms = ms;
        self
    }

    /// Set the first busy retry delay (in milliseconds)
    pub fn busy_base_wait_ms(mut self, ms: u64) -> Self {
        self.config.busy_base_wait_ms = ms;
        self
    }

    /// Set the busy retry budget
    pub fn max_busy_retries(mut self, count: u32) -> Self {
        self.config.max_busy_retries = count;
        self
    }

    /// Set the cap on a single busy delay (in milliseconds)
    pub fn busy_max_wait_ms(mut self, ms: u64) -> Self {
        self.config.busy_max_wait_ms = ms;
        self
    }

    /// Set the optimistic transaction attempt budget
    pub fn max_txn_retries(mut self, count: u32) -> Self {
        self.config.max_txn_retries = count;
        self
    }

    /// Set the async worker pool size
    pub fn async_pool_size(mut self, size: usize) -> Self {
        self.config.async_pool_size = size;
        self
    }

    pub fn connect_timeout_ms(mut self, ms: u64) -> Self {
        self.config.connect_timeout_ms = ms;
        self
    }

    pub fn socket_timeout_ms(mut self, ms: u64) -> Self {
        self.config.socket_timeout_ms = ms;
        self
    }

    pub fn max_idle_connections(mut self, count: usize) -> Self {
        self.config.max_idle_connections = count;
        self
    }

    /// Set the (un)subscribe ack timeout (in milliseconds)
    pub fn subscribe_timeout_ms(mut self, ms: u64) -> Self {
        self.config.subscribe_timeout_ms = ms;
        self
    }

    pub fn bus_poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.bus_poll_interval_ms = ms;
        self
    }

    pub fn bus_reconnect_base_ms(mut self, ms: u64) -> Self {
        self.config.bus_reconnect_base_ms = ms;
        self
    }

    pub fn bus_reconnect_max_ms(mut self, ms: u64) -> Self {
        self.config.bus_reconnect_max_ms = ms;
        self
    }

    pub fn page_size(mut self, size: usize) -> Self {
        self.config.page_size = size;
        self
    }

    pub fn keys_per_scan(mut self, count: usize) -> Self {
        self.config.keys_per_scan = count;
        self
    }

    pub fn build(self) -> StoreConfig {
        self.config
    }
}

// =============================================================================
// Backend Addresses
// =============================================================================

/// Host and port of one backend instance
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendAddr {
    pub host: String,
    pub port: u16,
}

impl BackendAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for BackendAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Which host serves which entity kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AddressConfig {
    /// Accounts, integrations, requests, statuses
    pub account_db: String,

    /// Video metadata
    pub video_db: String,

    /// Thumbnail metadata
    pub thumbnail_db: String,

    pub port: u16,
}

impl Default for AddressConfig {
    fn default() -> Self {
        Self {
            account_db: "127.0.0.1".to_string(),
            video_db: "127.0.0.1".to_string(),
            thumbnail_db: "127.0.0.1".to_string(),
            port: 6379,
        }
    }
}

impl AddressConfig {
    /// Address for an entity kind
    pub fn addr_for(&self, kind: EntityKind) -> BackendAddr {
        let host = match kind {
            EntityKind::Video => &self.video_db,
            EntityKind::Thumbnail => &self.thumbnail_db,
            _ => &self.account_db,
        };
        BackendAddr::new(host.clone(), self.port)
    }
}

/// Resolves the backend address of an entity kind.
///
/// Called on every connection lookup, so implementations must be cheap
/// and may return a different address from one call to the next.
pub trait AddressSource: Send + Sync {
    fn resolve(&self, kind: EntityKind) -> Result<BackendAddr>;
}

/// In-code address table; `set` swaps it at runtime
#[derive(Debug, Default)]
pub struct StaticAddresses {
    config: RwLock<AddressConfig>,
}

impl StaticAddresses {
    pub fn new(config: AddressConfig) -> Self {
        Self {
            config: RwLock::new(config),
        }
    }

    /// Every kind on a single host
    pub fn single(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        Self::new(AddressConfig {
            account_db: host.clone(),
            video_db: host.clone(),
            thumbnail_db: host,
            port,
        })
    }

    pub fn set(&self, config: AddressConfig) {
        *self.config.write() = config;
    }

    pub fn current(&self) -> AddressConfig {
        self.config.read().clone()
    }
}

impl AddressSource for StaticAddresses {
    fn resolve(&self, kind: EntityKind) -> Result<BackendAddr> {
        Ok(self.config.read().addr_for(kind))
    }
}

/// Addresses read from the `[addresses]` table of a TOML file.
///
/// The file is stat'ed at most once per `poll_interval` and re-read when
/// its modification time or size changed. A file that fails to parse
/// leaves the previous addresses in place. Only one caller polls at a
/// time; the others read the current addresses and move on.
pub struct FileAddressSource {
    path: PathBuf,
    poll_interval: Duration,
    config: RwLock<AddressConfig>,
    poll: Mutex<PollState>,
}

struct PollState {
    stamp: Option<(SystemTime, u64)>,
    checked_at: Instant,
}

impl FileAddressSource {
    pub fn open(path: impl Into<PathBuf>, poll_interval: Duration) -> Result<Self> {
        let path = path.into();
        let config = ConfigFile::load(&path)?.addresses;
        let stamp = file_stamp(&path);

        Ok(Self {
            path,
            poll_interval,
            config: RwLock::new(config),
            poll: Mutex::new(PollState {
                stamp,
                checked_at: Instant::now(),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn current(&self) -> AddressConfig {
        self.config.read().clone()
    }

    fn reload_if_changed(&self, poll: &mut PollState) {
        if poll.checked_at.elapsed() < self.poll_interval {
            return;
        }
        poll.checked_at = Instant::now();

        let stamp = file_stamp(&self.path);
        if stamp == poll.stamp {
            return;
        }
        poll.stamp = stamp;

        match ConfigFile::load(&self.path) {
            Ok(file) => {
                if file.addresses != *self.config.read() {
                    info!(path = %self.path.display(), "Backend addresses changed");
                    *self.config.write() = file.addresses;
                }
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Keeping previous addresses");
            }
        }
    }
}

impl AddressSource for FileAddressSource {
    fn resolve(&self, kind: EntityKind) -> Result<BackendAddr> {
        // Someone else is already polling
        if let Some(mut poll) = self.poll.try_lock() {
            self.reload_if_changed(&mut poll);
        }
        Ok(self.config.read().addr_for(kind))
    }
}

fn file_stamp(path: &Path) -> Option<(SystemTime, u64)> {
    let meta = std::fs::metadata(path).ok()?;
    Some((meta.modified().ok()?, meta.len()))
}

// =============================================================================
// Config File
// =============================================================================

/// Parsed TOML configuration file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub store: StoreConfig,
    pub addresses: AddressConfig,
}

impl ConfigFile {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            ObjStoreError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }
}

// =============================================================================
// Server Configuration
// =============================================================================

/// Configuration of the TCP backend host
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP listen address
    pub listen_addr: String,

    /// Max concurrent client connections
    pub max_connections: usize,

    /// Connection read timeout (milliseconds); 0 blocks forever
    pub read_timeout_ms: u64,

    /// Connection write timeout (milliseconds)
    pub write_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:6379".to_string(),
            max_connections: 1024,
            read_timeout_ms: 0,
            write_timeout_ms: 5000,
        }
    }
}

impl ServerConfig {
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }
}

/// Builder for ServerConfig
#[derive(Default)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    /// Set the TCP listen address
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.listen_addr = addr.into();
        self
    }

    /// Set the maximum number of concurrent connections
    pub fn max_connections(mut self, count: usize) -> Self {
        self.config.max_connections = count;
        self
    }

    /// Set the read timeout (in milliseconds)
    pub fn read_timeout_ms(mut self, ms: u64) -> Self {
        self.config.read_timeout_ms = ms;
        self
    }

    /// Set the write timeout (in milliseconds)
    pub fn write_timeout_ms(mut self, ms: u64) -> Self {
        self.config.write_timeout_ms = ms;
        self
    }

    pub fn build(self) -> ServerConfig {
        self.config
    }
}
