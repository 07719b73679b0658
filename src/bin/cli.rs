//! objstore CLI Client
//!
//! Command-line interface for inspecting an objstore backend.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::{Parser, Subcommand};
use objstore::backend::TcpConnector;
use objstore::changebus::{ChangeBus, ChangeEvent};
use objstore::config::{StaticAddresses, StoreConfig};
use objstore::error::{ObjStoreError, Result};
use objstore::record::codec::envelope;
use objstore::record::{
    Account, CdnHostingList, EntityKind, Integration, Request, StoredObject, ThumbnailMetadata,
    ThumbnailStatus, VideoMetadata, VideoStatus,
};
use objstore::store::{GetOptions, ObjectStore};
use tracing_subscriber::{fmt, EnvFilter};

/// objstore CLI
#[derive(Parser, Debug)]
#[command(name = "objstore-cli")]
#[command(about = "CLI for an objstore backend")]
#[command(version)]
struct Args {
    /// Server address (host:port)
    #[arg(short, long, default_value = "127.0.0.1:6379")]
    server: String,

    /// Entity kind whose connection raw commands use
    #[arg(short, long, default_value = "account")]
    kind: EntityKind,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Ping the server
    Ping,

    /// Get a raw value by key
    Get {
        key: String,
    },

    /// Set a raw key-value pair
    Set {
        key: String,
        value: String,
    },

    /// Delete raw keys
    Del {
        keys: Vec<String>,
    },

    /// List the members of a set
    Members {
        set: String,
    },

    /// Fetch one typed record and print its envelope
    Record {
        kind: EntityKind,
        id: String,
    },

    /// List the ids stored for an entity kind
    List {
        kind: EntityKind,
    },

    /// Print change events until interrupted
    Watch {
        kind: EntityKind,

        /// Id pattern to watch
        #[arg(default_value = "*")]
        pattern: String,

        /// Only print ids and operations
        #[arg(long)]
        no_fetch: bool,
    },
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    fmt().with_env_filter(filter).with_target(true).init();

    let args = Args::parse();
    if let Err(e) = run(args) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let (host, port) = args
        .server
        .rsplit_once(':')
        .ok_or_else(|| ObjStoreError::Config(format!("expected host:port, got {}", args.server)))?;
    let port: u16 = port
        .parse()
        .map_err(|_| ObjStoreError::Config(format!("invalid port: {}", port)))?;

    let store = ObjectStore::connect(
        StoreConfig::default(),
        Arc::new(StaticAddresses::single(host, port)),
        Arc::new(TcpConnector),
    );
    let client = store.client();

    match args.command {
        Commands::Ping => {
            client.ping(args.kind)?;
            println!("PONG");
        }
        Commands::Get { key } => match client.get(args.kind, &key)? {
            Some(value) => println!("{}", value),
            None => println!("(nil)"),
        },
        Commands::Set { key, value } => {
            client.set(args.kind, &key, &value)?;
            println!("OK");
        }
        Commands::Del { keys } => {
            println!("(integer) {}", client.del(args.kind, keys)?);
        }
        Commands::Members { set } => {
            for member in client.smembers(args.kind, &set)? {
                println!("{}", member);
            }
        }
        Commands::Record { kind, id } => match fetch(&store, kind, &id)? {
            Some(json) => println!("{}", json),
            None => println!("(nil)"),
        },
        Commands::List { kind } => {
            for id in list(&store, kind)? {
                println!("{}", id);
            }
        }
        Commands::Watch {
            kind,
            pattern,
            no_fetch,
        } => watch(store, kind, &pattern, !no_fetch)?,
    }
    Ok(())
}

// =============================================================================
// Typed dispatch
// =============================================================================

fn fetch_as<T: StoredObject>(store: &ObjectStore, id: &str) -> Result<Option<String>> {
    let options = GetOptions::quiet();
    match store.get::<T>(id, options)? {
        Some(obj) => Ok(Some(serde_json::to_string_pretty(&envelope(&obj.into_record())?)?)),
        None => Ok(None),
    }
}

fn fetch(store: &ObjectStore, kind: EntityKind, id: &str) -> Result<Option<String>> {
    match kind {
        EntityKind::Account => fetch_as::<Account>(store, id),
        EntityKind::Integration => fetch_as::<Integration>(store, id),
        EntityKind::Request => fetch_as::<Request>(store, id),
        EntityKind::Video => fetch_as::<VideoMetadata>(store, id),
        EntityKind::Thumbnail => fetch_as::<ThumbnailMetadata>(store, id),
        EntityKind::ThumbnailStatus => fetch_as::<ThumbnailStatus>(store, id),
        EntityKind::VideoStatus => fetch_as::<VideoStatus>(store, id),
        EntityKind::CdnHosting => fetch_as::<CdnHostingList>(store, id),
    }
}

fn list(store: &ObjectStore, kind: EntityKind) -> Result<Vec<String>> {
    match kind {
        EntityKind::Account => store.all_ids::<Account>(),
        EntityKind::Integration => store.all_ids::<Integration>(),
        EntityKind::Request => store.all_ids::<Request>(),
        EntityKind::Video => store.all_ids::<VideoMetadata>(),
        EntityKind::Thumbnail => store.all_ids::<ThumbnailMetadata>(),
        EntityKind::ThumbnailStatus => store.all_ids::<ThumbnailStatus>(),
        EntityKind::VideoStatus => store.all_ids::<VideoStatus>(),
        EntityKind::CdnHosting => store.all_ids::<CdnHostingList>(),
    }
}

fn print_event<T: StoredObject>(event: ChangeEvent<T>) -> Result<()> {
    match event.record {
        Some(obj) => println!(
            "{} {} {}",
            event.op,
            event.id,
            serde_json::to_string(&envelope(&obj.into_record())?)?
        ),
        None => println!("{} {}", event.op, event.id),
    }
    Ok(())
}

fn watch_as<T: StoredObject>(bus: &ChangeBus, pattern: &str, get_object: bool) -> Result<()> {
    bus.subscribe::<T, _>(pattern, print_event::<T>, get_object)
}

fn watch(store: ObjectStore, kind: EntityKind, pattern: &str, get_object: bool) -> Result<()> {
    let bus = ChangeBus::new(store);
    match kind {
        EntityKind::Account => watch_as::<Account>(&bus, pattern, get_object)?,
        EntityKind::Integration => watch_as::<Integration>(&bus, pattern, get_object)?,
        EntityKind::Request => watch_as::<Request>(&bus, pattern, get_object)?,
        EntityKind::Video => watch_as::<VideoMetadata>(&bus, pattern, get_object)?,
        EntityKind::Thumbnail => watch_as::<ThumbnailMetadata>(&bus, pattern, get_object)?,
        EntityKind::ThumbnailStatus => watch_as::<ThumbnailStatus>(&bus, pattern, get_object)?,
        EntityKind::VideoStatus => watch_as::<VideoStatus>(&bus, pattern, get_object)?,
        EntityKind::CdnHosting => watch_as::<CdnHostingList>(&bus, pattern, get_object)?,
    }
    eprintln!("Watching {} {} (Ctrl+C to stop)", kind, pattern);

    loop {
        thread::sleep(Duration::from_secs(5));
        if let Some(status) = bus.state(kind) {
            if !status.is_connected() {
                eprintln!("change bus {}", status);
            }
        }
    }
}
