//! Change Bus Tests
//!
//! Subscriptions, delivery, reconnects and address moves over the
//! in-process backend.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{fixture, fixture_with, test_config, wait_for, Fixture, PORT};
use objstore::backend::{Backend, Connector, MemoryCluster, PubSub};
use objstore::changebus::{BusStatus, ChangeBus, ChangeEvent, ChangeOp};
use objstore::config::{AddressConfig, BackendAddr, StaticAddresses, StoreConfig};
use objstore::error::{ObjStoreError, Result, SubscriptionError};
use objstore::protocol::{PubSubMessage, Request, Response};
use objstore::record::{Account, EntityKind, VideoMetadata};
use objstore::store::ObjectStore;
use parking_lot::Mutex;

type Seen = Arc<Mutex<Vec<(String, Option<String>, ChangeOp)>>>;

fn recorder() -> (Seen, impl Fn(ChangeEvent<Account>) -> Result<()> + Send + Sync + 'static) {
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let handler = move |event: ChangeEvent<Account>| {
        let name = event.record.and_then(|a| a.name);
        sink.lock().push((event.id, name, event.op));
        Ok(())
    };
    (seen, handler)
}

fn rename(f: &Fixture, id: &str, name: &str) {
    let name = name.to_string();
    f.store
        .modify::<Account, _>(id, move |a| a.name = Some(name.clone()), true)
        .unwrap();
}

const WAIT: Duration = Duration::from_secs(5);

// =============================================================================
// Delivery
// =============================================================================

#[test]
fn test_subscribe_receives_typed_event() {
    let f = fixture();
    let bus = ChangeBus::new(f.store.clone());
    let (seen, handler) = recorder();

    bus.subscribe::<Account, _>("*", handler, true).unwrap();
    rename(&f, "acct1", "Acme");

    assert!(wait_for(WAIT, || !seen.lock().is_empty()));
    let events = seen.lock().clone();
    assert_eq!(events[0], ("acct1".to_string(), Some("Acme".to_string()), ChangeOp::Set));
    assert!(wait_for(WAIT, || bus.state(EntityKind::Account).unwrap().is_connected()));
}

#[test]
fn test_pattern_filters_ids() {
    let f = fixture();
    let bus = ChangeBus::new(f.store.clone());
    let (seen, handler) = recorder();

    bus.subscribe::<Account, _>("red*", handler, true).unwrap();
    rename(&f, "blue1", "b");
    rename(&f, "red1", "r");

    assert!(wait_for(WAIT, || !seen.lock().is_empty()));
    std::thread::sleep(Duration::from_millis(50));
    let ids: Vec<String> = seen.lock().iter().map(|e| e.0.clone()).collect();
    assert_eq!(ids, vec!["red1"]);
}

#[test]
fn test_exact_channel_subscription() {
    let f = fixture();
    let bus = ChangeBus::new(f.store.clone());
    let (seen, handler) = recorder();

    bus.subscribe::<Account, _>("acct7", handler, true).unwrap();
    rename(&f, "acct8", "other");
    rename(&f, "acct7", "mine");

    assert!(wait_for(WAIT, || !seen.lock().is_empty()));
    assert_eq!(seen.lock()[0].0, "acct7");
}

#[test]
fn test_without_fetch_delivers_ids_only() {
    let f = fixture();
    let bus = ChangeBus::new(f.store.clone());
    let (seen, handler) = recorder();

    bus.subscribe::<Account, _>("*", handler, false).unwrap();
    rename(&f, "acct1", "Acme");

    assert!(wait_for(WAIT, || !seen.lock().is_empty()));
    assert_eq!(seen.lock()[0], ("acct1".to_string(), None, ChangeOp::Set));
    // Only the modify itself touched the backend
    assert_eq!(f.recorder.count(|r| matches!(r, Request::MGet { .. })), 0);
}

#[test]
fn test_delete_event_has_no_record() {
    let f = fixture();
    rename(&f, "acct1", "Acme");
    let bus = ChangeBus::new(f.store.clone());
    let (seen, handler) = recorder();

    bus.subscribe::<Account, _>("*", handler, true).unwrap();
    f.store.delete::<Account>("acct1").unwrap();

    assert!(wait_for(WAIT, || !seen.lock().is_empty()));
    assert_eq!(seen.lock()[0], ("acct1".to_string(), None, ChangeOp::Del));
}

#[test]
fn test_failing_handler_does_not_stop_delivery() {
    let f = fixture();
    let bus = ChangeBus::new(f.store.clone());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);

    bus.subscribe::<Account, _>(
        "*",
        move |event: ChangeEvent<Account>| {
            sink.lock().push(event.id.clone());
            match event.id.as_str() {
                "boom" => panic!("handler panic"),
                "fail" => Err(ObjStoreError::Internal("handler failed".into())),
                _ => Ok(()),
            }
        },
        true,
    )
    .unwrap();

    rename(&f, "boom", "x");
    rename(&f, "fail", "x");
    rename(&f, "fine", "x");

    assert!(wait_for(WAIT, || seen.lock().len() >= 3));
    assert!(wait_for(WAIT, || bus.state(EntityKind::Account).unwrap().is_connected()));
}

#[test]
fn test_invalid_ids_are_dropped() {
    let f = fixture();
    let bus = ChangeBus::new(f.store.clone());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);

    bus.subscribe::<VideoMetadata, _>(
        "*",
        move |event: ChangeEvent<VideoMetadata>| {
            sink.lock().push(event.id);
            Ok(())
        },
        true,
    )
    .unwrap();

    // Video ids need an account part
    f.store
        .client()
        .set(EntityKind::Video, "video_noowner", "{}")
        .unwrap();
    f.store.save(&mut VideoMetadata::new("acct1_v1")).unwrap();

    assert!(wait_for(WAIT, || !seen.lock().is_empty()));
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(*seen.lock(), vec!["acct1_v1"]);
}

#[test]
fn test_unreadable_record_does_not_drop_its_batch() {
    let f = fixture();
    let bus = ChangeBus::new(f.store.clone());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let gate = Arc::new(AtomicBool::new(false));
    let held = Arc::clone(&gate);

    bus.subscribe::<Account, _>(
        "*",
        move |event: ChangeEvent<Account>| {
            if event.id == "first" {
                // Hold the worker so the next notifications land in one batch
                wait_for(WAIT, || held.load(Ordering::SeqCst));
            }
            sink.lock().push(event.id);
            Ok(())
        },
        true,
    )
    .unwrap();

    rename(&f, "first", "x");
    f.store
        .client()
        .set(EntityKind::Account, "account_bad", r#"{"_type":"Mystery","_data":{}}"#)
        .unwrap();
    rename(&f, "good", "x");
    gate.store(true, Ordering::SeqCst);

    assert!(wait_for(WAIT, || seen.lock().len() >= 2));
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(*seen.lock(), vec!["first", "good"]);
}

#[test]
fn test_blocking_subscribe_from_handler_is_refused() {
    let f = fixture();
    let bus = Arc::new(ChangeBus::new(f.store.clone()));
    let weak = Arc::downgrade(&bus);
    let outcome = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&outcome);

    bus.subscribe::<Account, _>(
        "*",
        move |_event: ChangeEvent<Account>| {
            if let Some(bus) = weak.upgrade() {
                let result = bus.subscribe::<Account, _>("other*", |_| Ok(()), false);
                *sink.lock() = Some(result);
            }
            Ok(())
        },
        false,
    )
    .unwrap();

    rename(&f, "acct1", "x");
    assert!(wait_for(WAIT, || outcome.lock().is_some()));
    let result = outcome.lock().take().unwrap();
    assert!(matches!(
        result,
        Err(ObjStoreError::Subscription(SubscriptionError::OnWorkerThread(_)))
    ));
    assert!(wait_for(WAIT, || bus.state(EntityKind::Account).unwrap().is_connected()));
    bus.shutdown();
}

// =============================================================================
// Lifecycle
// =============================================================================

#[test]
fn test_unsubscribe_stops_delivery() {
    let f = fixture();
    let bus = ChangeBus::new(f.store.clone());
    let (seen, handler) = recorder();

    bus.subscribe::<Account, _>("*", handler, true).unwrap();
    rename(&f, "acct1", "one");
    assert!(wait_for(WAIT, || seen.lock().len() == 1));

    bus.unsubscribe::<Account>("*").unwrap();
    rename(&f, "acct1", "two");
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(seen.lock().len(), 1);
}

#[test]
fn test_unsubscribe_unknown_pattern_is_ok() {
    let f = fixture();
    let bus = ChangeBus::new(f.store.clone());
    bus.unsubscribe::<Account>("never").unwrap();
}

#[test]
fn test_state_and_shutdown() {
    let f = fixture();
    let bus = ChangeBus::new(f.store.clone());
    assert!(bus.state(EntityKind::Account).is_none());

    let (_seen, handler) = recorder();
    bus.subscribe::<Account, _>("*", handler, true).unwrap();
    assert!(wait_for(WAIT, || matches!(
        bus.state(EntityKind::Account),
        Some(BusStatus::Connected { .. })
    )));

    bus.shutdown();
    assert!(bus.state(EntityKind::Account).is_none());
    assert_eq!(f.keyspace.hub().subscriber_count(), 0);
}

#[test]
fn test_resubscribes_after_connection_loss() {
    let f = fixture();
    let bus = ChangeBus::new(f.store.clone());
    let (seen, handler) = recorder();
    bus.subscribe::<Account, _>("*", handler, true).unwrap();

    f.keyspace.hub().disconnect_all();

    // Notifications published while disconnected are lost, so keep writing
    // until one arrives over the new session
    let mut n = 0;
    let delivered = wait_for(WAIT, || {
        n += 1;
        rename(&f, "acct1", &format!("v{}", n));
        !seen.lock().is_empty()
    });
    assert!(delivered);
    assert_eq!(f.keyspace.hub().subscriber_count(), 1);
}

#[test]
fn test_reconnects_when_node_returns() {
    let f = fixture();
    let bus = ChangeBus::new(f.store.clone());
    let (seen, handler) = recorder();
    bus.subscribe::<Account, _>("*", handler, true).unwrap();

    let addr = BackendAddr::new(common::HOST, PORT);
    f.store.manager().invalidate(EntityKind::Account);
    f.cluster.remove(&addr);

    assert!(wait_for(WAIT, || matches!(
        bus.state(EntityKind::Account),
        Some(BusStatus::Disconnected { failures }) if failures > 0
    )));

    let revived = f.cluster.node(&addr);
    assert!(wait_for(WAIT, || bus.state(EntityKind::Account).unwrap().is_connected()));

    let mut n = 0;
    assert!(wait_for(WAIT, || {
        n += 1;
        rename(&f, "acct1", &format!("v{}", n));
        !seen.lock().is_empty()
    }));
    assert_eq!(revived.hub().subscriber_count(), 1);
}

#[test]
fn test_follows_address_change() {
    let f = fixture();
    let node_b = f.cluster.node(&BackendAddr::new("node-b", PORT));
    let bus = ChangeBus::new(f.store.clone());
    let (seen, handler) = recorder();
    bus.subscribe::<Account, _>("*", handler, true).unwrap();

    f.addresses.set(AddressConfig {
        account_db: "node-b".to_string(),
        video_db: "node-b".to_string(),
        thumbnail_db: "node-b".to_string(),
        port: PORT,
    });

    assert!(wait_for(WAIT, || node_b.hub().subscriber_count() == 1));
    assert!(wait_for(WAIT, || f.keyspace.hub().subscriber_count() == 0));

    let mut n = 0;
    assert!(wait_for(WAIT, || {
        n += 1;
        rename(&f, "acct1", &format!("v{}", n));
        !seen.lock().is_empty()
    }));
    assert!(node_b.key_count() > 0);
    assert!(matches!(
        bus.state(EntityKind::Account),
        Some(BusStatus::Connected { addr }) if addr.host == "node-b"
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_async_subscribe() {
    let f = fixture();
    let bus = ChangeBus::new(f.store.clone());
    let (seen, handler) = recorder();

    bus.subscribe_async::<Account, _>("*", handler, true).await.unwrap();
    let store = f.store.async_store();
    store
        .modify::<Account, _>("acct1", |a| a.name = Some("async".into()), true)
        .await
        .unwrap();

    for _ in 0..100 {
        if !seen.lock().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(seen.lock()[0].1.as_deref(), Some("async"));
    bus.unsubscribe_async::<Account>("*").await.unwrap();
}

// =============================================================================
// Acknowledgement timeouts
// =============================================================================

/// Subscriber connection that never acknowledges anything
struct SilentPubSub;

impl PubSub for SilentPubSub {
    fn send(&mut self, _request: Request) -> Result<()> {
        Ok(())
    }

    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<PubSubMessage>> {
        std::thread::sleep(timeout);
        Ok(None)
    }

    fn try_recv(&mut self) -> Result<Option<PubSubMessage>> {
        Ok(None)
    }
}

struct SilentBackend {
    inner: Arc<dyn Backend>,
}

impl Backend for SilentBackend {
    fn call(&self, request: Request) -> Result<Response> {
        self.inner.call(request)
    }

    fn pubsub(&self) -> Result<Box<dyn PubSub>> {
        Ok(Box::new(SilentPubSub))
    }

    fn addr(&self) -> &BackendAddr {
        self.inner.addr()
    }
}

struct SilentConnector(Arc<MemoryCluster>);

impl Connector for SilentConnector {
    fn connect(&self, addr: &BackendAddr, config: &StoreConfig) -> Result<Arc<dyn Backend>> {
        Ok(Arc::new(SilentBackend {
            inner: self.0.connect(addr, config)?,
        }))
    }
}

#[test]
fn test_subscribe_times_out_without_ack() {
    let cluster = Arc::new(MemoryCluster::new());
    cluster.node(&BackendAddr::new("silent", PORT));
    let mut config = test_config();
    config.subscribe_timeout_ms = 100;
    let store = ObjectStore::connect(
        config,
        Arc::new(StaticAddresses::single("silent", PORT)),
        Arc::new(SilentConnector(cluster)),
    );
    let bus = ChangeBus::new(store);
    let (_seen, handler) = recorder();

    let err = bus.subscribe::<Account, _>("*", handler, true).unwrap_err();
    assert!(matches!(
        err,
        ObjStoreError::Subscription(SubscriptionError::Timeout { action: "subscribe", .. })
    ));
}

#[test]
fn test_subscribe_waits_for_backend() {
    // No node yet: the worker keeps retrying until the timeout
    let mut config = test_config();
    config.subscribe_timeout_ms = 150;
    let f = fixture_with(config);
    f.cluster.remove(&BackendAddr::new(common::HOST, PORT));

    let bus = ChangeBus::new(f.store.clone());
    let (_seen, handler) = recorder();
    let err = bus.subscribe::<Account, _>("*", handler, true).unwrap_err();
    assert!(matches!(err, ObjStoreError::Subscription(SubscriptionError::Timeout { .. })));
    assert!(matches!(
        bus.state(EntityKind::Account),
        Some(BusStatus::Disconnected { .. }) | Some(BusStatus::Connecting)
    ));
}
