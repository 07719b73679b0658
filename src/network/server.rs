//! TCP Server
//!
//! Accepts connections and runs each one on its own thread.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use tracing::{debug, info, warn};

use super::connection::Connection;
use crate::config::ServerConfig;
use crate::error::{ObjStoreError, Result};
use crate::keyspace::Keyspace;
use crate::protocol::{write_response, ErrorKind, Response};

/// TCP server hosting one keyspace
pub struct Server {
    config: ServerConfig,
    keyspace: Arc<Keyspace>,
    listener: Option<TcpListener>,
    shutdown: Arc<AtomicBool>,
    active: Arc<AtomicUsize>,
}

/// Stops a running server from another thread
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    addr: SocketAddr,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::SeqCst);
        // Wake the blocking accept
        let _ = TcpStream::connect(self.addr);
    }
}

/// Decrements the active connection count when a handler exits
struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Server {
    pub fn new(config: ServerConfig, keyspace: Arc<Keyspace>) -> Self {
        Self {
            config,
            keyspace,
            listener: None,
            shutdown: Arc::new(AtomicBool::new(false)),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Bind the listen address; port 0 picks a free port
    pub fn bind(&mut self) -> Result<SocketAddr> {
        if let Some(listener) = &self.listener {
            return Ok(listener.local_addr()?);
        }
        let listener = TcpListener::bind(&self.config.listen_addr)?;
        let addr = listener.local_addr()?;
        self.listener = Some(listener);
        Ok(addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn keyspace(&self) -> &Arc<Keyspace> {
        &self.keyspace
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Handle for stopping the server; binds first if needed
    pub fn shutdown_handle(&mut self) -> Result<ShutdownHandle> {
        let addr = self.bind()?;
        Ok(ShutdownHandle {
            flag: Arc::clone(&self.shutdown),
            addr,
        })
    }

    /// Start the server (blocking until shutdown)
    pub fn run(&mut self) -> Result<()> {
        let addr = self.bind()?;
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| ObjStoreError::Internal("listener not bound".to_string()))?;
        info!(%addr, max_connections = self.config.max_connections, "Server listening");

        for stream in listener.incoming() {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    continue;
                }
            };

            if self.active.load(Ordering::SeqCst) >= self.config.max_connections {
                warn!("Rejecting connection: {} connections open", self.config.max_connections);
                let mut stream = stream;
                let _ = write_response(
                    &mut stream,
                    &Response::error(ErrorKind::Internal, "max connections reached"),
                );
                continue;
            }

            self.active.fetch_add(1, Ordering::SeqCst);
            let guard = ActiveGuard(Arc::clone(&self.active));
            let keyspace = Arc::clone(&self.keyspace);
            let (read_ms, write_ms) = (self.config.read_timeout_ms, self.config.write_timeout_ms);

            let spawned = thread::Builder::new()
                .name("objstore-conn".to_string())
                .spawn(move || {
                    let _guard = guard;
                    let mut connection = match Connection::new(stream, keyspace) {
                        Ok(connection) => connection,
                        Err(e) => {
                            warn!("Could not set up connection: {}", e);
                            return;
                        }
                    };
                    if let Err(e) = connection.set_timeouts(read_ms, write_ms) {
                        warn!("Could not set timeouts for {}: {}", connection.peer_addr(), e);
                    }
                    if let Err(e) = connection.handle() {
                        debug!("Connection {} ended with error: {}", connection.peer_addr(), e);
                    }
                });
            if let Err(e) = spawned {
                warn!("Could not spawn connection thread: {}", e);
            }
        }

        info!("Server stopped");
        Ok(())
    }

    /// Signal the server to shut down; takes effect at the next accept
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(addr) = self.local_addr() {
            let _ = TcpStream::connect(addr);
        }
    }
}
