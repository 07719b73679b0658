//! Network Module
//!
//! TCP server hosting a `Keyspace`.
//!
//! ## Architecture
//! - Single acceptor thread
//! - One thread per connection, capped by `max_connections`
//! - Requests executed directly against the shared keyspace
//! - Subscriber connections get an extra forwarder thread for pushes

mod connection;
mod server;

pub use connection::Connection;
pub use server::{Server, ShutdownHandle};
