//! Backend Module
//!
//! Drivers that carry `Request`s to a backend and bring `Response`s back.
//!
//! ## Drivers
//! - `MemoryBackend`: calls straight into an in-process `Keyspace`
//! - `TcpBackend`: framed protocol over pooled TCP connections
//!
//! A `Connector` turns an address into a driver. Building a driver does
//! no network I/O; TCP connections are opened on first use.

mod memory;
mod tcp;

use std::sync::Arc;
use std::time::Duration;

use crate::config::{BackendAddr, StoreConfig};
use crate::error::Result;
use crate::protocol::{PubSubMessage, Request, Response};

pub use memory::{MemoryBackend, MemoryCluster, MemoryPubSub};
pub use tcp::{TcpBackend, TcpConnector, TcpPubSub};

/// A connection (or pool of connections) to one backend instance
pub trait Backend: Send + Sync {
    /// Execute one request. Backend error responses come back as `Err`.
    fn call(&self, request: Request) -> Result<Response>;

    /// Open a dedicated subscriber connection
    fn pubsub(&self) -> Result<Box<dyn PubSub>>;

    fn addr(&self) -> &BackendAddr;
}

/// A subscriber connection.
///
/// Acks and messages arrive through `recv_timeout` / `try_recv` in the
/// order the backend sent them. An `Err` from either means the connection
/// is gone.
pub trait PubSub: Send {
    /// Send a SUBSCRIBE-family request; its acks arrive as messages
    fn send(&mut self, request: Request) -> Result<()>;

    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<PubSubMessage>>;

    fn try_recv(&mut self) -> Result<Option<PubSubMessage>>;

    fn subscribe(&mut self, channel: &str) -> Result<()> {
        self.send(Request::Subscribe {
            channels: vec![channel.to_string()],
        })
    }

    fn psubscribe(&mut self, pattern: &str) -> Result<()> {
        self.send(Request::PSubscribe {
            patterns: vec![pattern.to_string()],
        })
    }

    fn unsubscribe(&mut self, channel: &str) -> Result<()> {
        self.send(Request::Unsubscribe {
            channels: vec![channel.to_string()],
        })
    }

    fn punsubscribe(&mut self, pattern: &str) -> Result<()> {
        self.send(Request::PUnsubscribe {
            patterns: vec![pattern.to_string()],
        })
    }
}

/// Builds backend drivers for addresses
pub trait Connector: Send + Sync {
    fn connect(&self, addr: &BackendAddr, config: &StoreConfig) -> Result<Arc<dyn Backend>>;
}
