//! objstore Server Binary
//!
//! Hosts an in-memory keyspace over the framed TCP protocol.

use std::sync::Arc;

use clap::Parser;
use objstore::config::ServerConfig;
use objstore::keyspace::Keyspace;
use objstore::network::Server;
use tracing_subscriber::{fmt, EnvFilter};

/// objstore backend server
#[derive(Parser, Debug)]
#[command(name = "objstore-server")]
#[command(about = "In-memory backend for the objstore persistence layer")]
#[command(version)]
struct Args {
    /// Listen address (host:port)
    #[arg(short, long, default_value = "127.0.0.1:6379")]
    listen: String,

    /// Maximum concurrent connections
    #[arg(short, long, default_value = "1024")]
    max_connections: usize,

    /// Close idle request connections after this many ms (0 = never)
    #[arg(long, default_value = "0")]
    read_timeout_ms: u64,
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,objstore=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();

    tracing::info!("objstore server v{}", objstore::VERSION);
    tracing::info!("Listen address: {}", args.listen);

    let config = ServerConfig::builder()
        .listen_addr(&args.listen)
        .max_connections(args.max_connections)
        .read_timeout_ms(args.read_timeout_ms)
        .build();

    let mut server = Server::new(config, Arc::new(Keyspace::new()));
    if let Err(e) = server.run() {
        tracing::error!("Server error: {}", e);
        std::process::exit(1);
    }
}
