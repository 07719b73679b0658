//! # objstore
//!
//! Typed object persistence and change notification over a shared
//! key-value backend:
//! - Namespaced keys and polymorphic JSON envelopes for every record family
//! - Per-kind backend connections that follow address changes at runtime
//! - Blocking and async clients sharing one retry policy
//! - Atomic save/delete and optimistic read-modify-write
//! - A pub/sub change bus delivering typed change events
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────┐   ┌─────────────────────────────┐
//! │         ObjectStore         │   │          ChangeBus          │
//! │  (AsyncObjectStore, ObjIter)│   │   (one worker per kind)     │
//! └──────────────┬──────────────┘   └──────────────┬──────────────┘
//!                │                                 │
//! ┌──────────────▼──────────────┐                  │
//! │ RetryingClient / AsyncClient│                  │
//! │  (RetryPolicy, WorkerPool)  │                  │
//! └──────────────┬──────────────┘                  │
//!                │                                 │
//! ┌──────────────▼─────────────────────────────────▼──────────────┐
//! │                     ConnectionManager                         │
//! │            (AddressSource -> Connector -> Backend)            │
//! └──────────────┬─────────────────────────────────┬──────────────┘
//!                │                                 │
//!         ┌──────▼──────┐                   ┌──────▼──────┐
//!         │ TcpBackend  │──── network ────▶ │   Server    │
//!         └─────────────┘                   └──────┬──────┘
//!         ┌─────────────┐                          │
//!         │MemoryBackend│──────────────────▶ ┌─────▼───────┐
//!         └─────────────┘                    │  Keyspace   │
//!                                            └─────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod error;

pub mod backend;
pub mod changebus;
pub mod client;
pub mod connection;
pub mod keyspace;
pub mod network;
pub mod protocol;
pub mod record;
pub mod store;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use changebus::{BusStatus, ChangeBus, ChangeEvent, ChangeOp};
pub use client::{AsyncClient, RetryPolicy, RetryingClient, WorkerPool};
pub use config::{AddressConfig, AddressSource, BackendAddr, StaticAddresses, StoreConfig};
pub use connection::ConnectionManager;
pub use error::{ObjStoreError, Result};
pub use record::{EntityKind, Record, RecordTag, StoredObject};
pub use store::{AsyncObjectStore, GetOptions, ObjectStore};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of objstore
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
