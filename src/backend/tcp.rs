//! TCP backend driver
//!
//! Speaks the framed protocol to an `objstore-server`. Request/response
//! connections are pooled; a subscriber connection gets its own socket
//! and a reader thread feeding pushes into a channel.

use std::io::{BufReader, BufWriter};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, TryRecvError};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::{Backend, Connector, PubSub};
use crate::config::{BackendAddr, StoreConfig};
use crate::error::{ObjStoreError, Result};
use crate::protocol::{read_response, write_request, PubSubMessage, Request, Response};

/// One open request/response connection
struct Channel {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
}

impl Channel {
    fn open(addr: &BackendAddr, config: &StoreConfig) -> Result<Self> {
        let stream = connect_stream(addr, config)?;
        let timeout = non_zero(config.socket_timeout());
        stream.set_read_timeout(timeout)?;
        stream.set_write_timeout(timeout)?;

        let read_stream = stream.try_clone()?;
        Ok(Self {
            reader: BufReader::new(read_stream),
            writer: BufWriter::new(stream),
        })
    }

    fn round_trip(&mut self, request: &Request) -> Result<Response> {
        write_request(&mut self.writer, request)?;
        read_response(&mut self.reader)
    }
}

fn non_zero(d: Duration) -> Option<Duration> {
    if d.is_zero() {
        None
    } else {
        Some(d)
    }
}

fn resolve(addr: &BackendAddr) -> Result<SocketAddr> {
    (addr.host.as_str(), addr.port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| ObjStoreError::Connection(format!("cannot resolve {}", addr)))
}

fn connect_stream(addr: &BackendAddr, config: &StoreConfig) -> Result<TcpStream> {
    let socket_addr = resolve(addr)?;
    let stream = match non_zero(config.connect_timeout()) {
        Some(timeout) => TcpStream::connect_timeout(&socket_addr, timeout),
        None => TcpStream::connect(socket_addr),
    }
    .map_err(|e| ObjStoreError::Connection(format!("connect to {} failed: {}", addr, e)))?;

    // Disable Nagle's algorithm for low latency
    stream.set_nodelay(true)?;
    debug!(%addr, "Opened backend connection");
    Ok(stream)
}

/// Pooled TCP driver for one backend address
pub struct TcpBackend {
    addr: BackendAddr,
    config: StoreConfig,
    idle: Mutex<Vec<Channel>>,
}

impl TcpBackend {
    /// No connection is opened until the first call
    pub fn new(addr: BackendAddr, config: StoreConfig) -> Self {
        Self {
            addr,
            config,
            idle: Mutex::new(Vec::new()),
        }
    }

    pub fn idle_connections(&self) -> usize {
        self.idle.lock().len()
    }

    fn checkout(&self) -> Result<Channel> {
        if let Some(channel) = self.idle.lock().pop() {
            return Ok(channel);
        }
        Channel::open(&self.addr, &self.config)
    }

    fn checkin(&self, channel: Channel) {
        let mut idle = self.idle.lock();
        if idle.len() < self.config.max_idle_connections {
            idle.push(channel);
        }
    }
}

impl Backend for TcpBackend {
    fn call(&self, request: Request) -> Result<Response> {
        let mut channel = self.checkout()?;
        match channel.round_trip(&request) {
            Ok(response) => {
                self.checkin(channel);
                response.into_result()
            }
            Err(e) => {
                // The stream may hold half a frame; never reuse it
                trace!(addr = %self.addr, error = %e, "Dropping broken connection");
                Err(e)
            }
        }
    }

    fn pubsub(&self) -> Result<Box<dyn PubSub>> {
        Ok(Box::new(TcpPubSub::connect(&self.addr, &self.config)?))
    }

    fn addr(&self) -> &BackendAddr {
        &self.addr
    }
}

/// Subscriber connection over its own socket
pub struct TcpPubSub {
    writer: BufWriter<TcpStream>,
    receiver: Receiver<PubSubMessage>,
}

impl TcpPubSub {
    pub fn connect(addr: &BackendAddr, config: &StoreConfig) -> Result<Self> {
        let stream = connect_stream(addr, config)?;
        stream.set_write_timeout(non_zero(config.socket_timeout()))?;

        let mut reader = BufReader::new(stream.try_clone()?);
        let (sender, receiver) = unbounded();
        let peer = addr.to_string();

        thread::Builder::new()
            .name(format!("pubsub-reader-{}", peer))
            .spawn(move || loop {
                match read_response(&mut reader) {
                    Ok(Response::Push(message)) => {
                        if sender.send(message).is_err() {
                            return;
                        }
                    }
                    Ok(Response::Error { kind, message }) => {
                        warn!(peer = %peer, ?kind, "Subscriber connection error: {}", message);
                    }
                    Ok(other) => {
                        trace!(peer = %peer, "Ignoring non-push response {:?}", other);
                    }
                    Err(e) => {
                        debug!(peer = %peer, error = %e, "Subscriber connection closed");
                        return;
                    }
                }
            })?;

        Ok(Self {
            writer: BufWriter::new(stream),
            receiver,
        })
    }

    fn closed() -> ObjStoreError {
        ObjStoreError::Connection("subscriber connection closed".to_string())
    }
}

impl PubSub for TcpPubSub {
    fn send(&mut self, request: Request) -> Result<()> {
        if !request.is_pubsub() {
            return Err(ObjStoreError::Protocol(format!(
                "{:?} is not allowed on a subscriber connection",
                request.opcode()
            )));
        }
        write_request(&mut self.writer, &request)
    }

    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<PubSubMessage>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(message) => Ok(Some(message)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(Self::closed()),
        }
    }

    fn try_recv(&mut self) -> Result<Option<PubSubMessage>> {
        match self.receiver.try_recv() {
            Ok(message) => Ok(Some(message)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(Self::closed()),
        }
    }
}

impl Drop for TcpPubSub {
    fn drop(&mut self) {
        // Unblocks the reader thread
        let _ = self.writer.get_ref().shutdown(Shutdown::Both);
    }
}

/// Connector producing lazily connected TCP drivers
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect(&self, addr: &BackendAddr, config: &StoreConfig) -> Result<Arc<dyn Backend>> {
        Ok(Arc::new(TcpBackend::new(addr.clone(), config.clone())))
    }
}
