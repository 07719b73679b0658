//! Connection Handler
//!
//! Handles individual client connections.
//!
//! A connection starts in request/response mode. The first
//! SUBSCRIBE-family request switches it to subscribe mode: a forwarder
//! thread then writes every hub message as a `Push` frame, and only
//! subscription requests and PING are accepted from the client.

use std::io::{self, BufReader, BufWriter};
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{ObjStoreError, Result};
use crate::keyspace::{Keyspace, SubscriberId};
use crate::protocol::{read_request, write_response, ErrorKind, Request, Response};

/// Subscribe-mode state of a connection
struct Subscriber {
    id: SubscriberId,
    forwarder: thread::JoinHandle<()>,
}

/// Handles a single client connection
pub struct Connection {
    /// TCP stream reader (buffered for efficiency)
    reader: BufReader<TcpStream>,

    /// Shared with the push forwarder once in subscribe mode
    writer: Arc<Mutex<BufWriter<TcpStream>>>,

    keyspace: Arc<Keyspace>,

    /// Peer address for logging
    peer_addr: String,

    subscriber: Option<Subscriber>,
}

impl Connection {
    /// Create a new connection handler
    pub fn new(stream: TcpStream, keyspace: Arc<Keyspace>) -> Result<Self> {
        let peer_addr = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        // Disable Nagle's algorithm for low latency
        stream.set_nodelay(true)?;

        let read_stream = stream.try_clone()?;
        Ok(Self {
            reader: BufReader::new(read_stream),
            writer: Arc::new(Mutex::new(BufWriter::new(stream))),
            keyspace,
            peer_addr,
            subscriber: None,
        })
    }

    /// Configure connection timeouts; zero leaves a direction unbounded
    pub fn set_timeouts(&mut self, read_ms: u64, write_ms: u64) -> Result<()> {
        if read_ms > 0 {
            self.reader
                .get_ref()
                .set_read_timeout(Some(Duration::from_millis(read_ms)))?;
        }
        if write_ms > 0 {
            self.writer
                .lock()
                .get_ref()
                .set_write_timeout(Some(Duration::from_millis(write_ms)))?;
        }
        Ok(())
    }

    /// Serve requests until the client goes away
    pub fn handle(&mut self) -> Result<()> {
        tracing::debug!("Connection established from {}", self.peer_addr);
        let result = self.serve();
        self.leave_subscribe_mode();
        result
    }

    fn serve(&mut self) -> Result<()> {
        loop {
            let request = match read_request(&mut self.reader) {
                Ok(request) => request,
                Err(ObjStoreError::Io(ref e)) if is_disconnect(e) => {
                    tracing::debug!("Client {} disconnected ({})", self.peer_addr, e.kind());
                    return Ok(());
                }
                Err(ObjStoreError::Io(ref e)) if is_timeout(e) => {
                    tracing::debug!("Read timeout for client {}", self.peer_addr);
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!("Error reading from {}: {}", self.peer_addr, e);
                    let _ = self.send_response(Response::error(ErrorKind::Protocol, e.to_string()));
                    return Err(e);
                }
            };

            tracing::trace!("Received request from {}: {:?}", self.peer_addr, request.opcode());

            let response = if request.is_pubsub() {
                self.apply_subscription(request)?;
                continue;
            } else if self.subscriber.is_some() && !matches!(request, Request::Ping) {
                Response::error(
                    ErrorKind::Protocol,
                    "only (P)SUBSCRIBE / (P)UNSUBSCRIBE / PING are allowed in subscribe mode",
                )
            } else {
                self.keyspace.execute(request)
            };

            if let Err(e) = self.send_response(response) {
                if let ObjStoreError::Io(ref io_err) = e {
                    if is_disconnect(io_err) {
                        tracing::debug!(
                            "Client {} disconnected before response could be sent: {}",
                            self.peer_addr,
                            e
                        );
                        return Ok(());
                    }
                }
                tracing::warn!("Error writing to {}: {}", self.peer_addr, e);
                return Err(e);
            }
        }
    }

    /// Acks come back through the forwarder, in hub order
    fn apply_subscription(&mut self, request: Request) -> Result<()> {
        let id = self.enter_subscribe_mode()?;
        let hub = self.keyspace.hub();
        match request {
            Request::Subscribe { channels } => hub.subscribe(id, &channels),
            Request::PSubscribe { patterns } => hub.psubscribe(id, &patterns),
            Request::Unsubscribe { channels } => hub.unsubscribe(id, &channels),
            Request::PUnsubscribe { patterns } => hub.punsubscribe(id, &patterns),
            _ => {}
        }
        Ok(())
    }

    fn enter_subscribe_mode(&mut self) -> Result<SubscriberId> {
        if let Some(subscriber) = &self.subscriber {
            return Ok(subscriber.id);
        }

        let (id, receiver) = self.keyspace.hub().register();
        let writer = Arc::clone(&self.writer);
        let peer = self.peer_addr.clone();
        let forwarder = thread::Builder::new()
            .name(format!("push-{}", peer))
            .spawn(move || {
                for message in receiver.iter() {
                    let mut writer = writer.lock();
                    if let Err(e) = write_response(&mut *writer, &Response::Push(message)) {
                        tracing::debug!("Stopped pushing to {}: {}", peer, e);
                        return;
                    }
                }
            })?;

        tracing::debug!("Client {} entered subscribe mode", self.peer_addr);
        self.subscriber = Some(Subscriber { id, forwarder });
        Ok(id)
    }

    fn leave_subscribe_mode(&mut self) {
        if let Some(subscriber) = self.subscriber.take() {
            // Dropping the hub entry closes the forwarder's channel
            self.keyspace.hub().remove(subscriber.id);
            let _ = subscriber.forwarder.join();
        }
    }

    /// Send a response to the client
    fn send_response(&mut self, response: Response) -> Result<()> {
        write_response(&mut *self.writer.lock(), &response)
    }

    /// Get the peer address string
    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }
}

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    )
}

/// Windows reports read timeouts as TimedOut instead of WouldBlock
fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}
