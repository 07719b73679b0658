//! Retry Tests
//!
//! Retry schedules of the blocking and async clients over injected faults.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{fixture, test_config, Fault, Fixture, ScriptedConnector};
use objstore::client::{AsyncClient, RetryEvent, RetryHook, RetryingClient, WorkerPool};
use objstore::connection::ConnectionManager;
use objstore::error::ObjStoreError;
use objstore::protocol::Opcode;
use objstore::record::EntityKind;
use parking_lot::Mutex;

fn manager(f: &Fixture) -> Arc<ConnectionManager> {
    Arc::new(ConnectionManager::new(
        test_config(),
        f.addresses.clone(),
        Arc::new(ScriptedConnector {
            cluster: Arc::clone(&f.cluster),
            recorder: Arc::clone(&f.recorder),
        }),
    ))
}

fn recording_hook() -> (RetryHook, Arc<Mutex<Vec<RetryEvent>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let hook: RetryHook = Arc::new(move |event: &RetryEvent| sink.lock().push(event.clone()));
    (hook, events)
}

fn recording_client(f: &Fixture) -> (RetryingClient, Arc<Mutex<Vec<Duration>>>, Arc<Mutex<Vec<RetryEvent>>>) {
    let slept = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&slept);
    let (hook, events) = recording_hook();
    let client = RetryingClient::new(manager(f))
        .with_sleeper(Arc::new(move |d: Duration| log.lock().push(d)))
        .with_retry_hook(hook);
    (client, slept, events)
}

fn ms(values: &[u64]) -> Vec<Duration> {
    values.iter().map(|v| Duration::from_millis(*v)).collect()
}

// =============================================================================
// Blocking client
// =============================================================================

#[test]
fn test_transient_delays_double() {
    let f = fixture();
    let (client, slept, events) = recording_client(&f);
    f.recorder.inject(Fault::Transient, 3);

    client.set(EntityKind::Account, "k", "v").unwrap();

    assert_eq!(*slept.lock(), ms(&[1, 2, 4]));
    let attempts: Vec<u32> = events.lock().iter().map(|e| e.attempt).collect();
    assert_eq!(attempts, vec![1, 2, 3]);
    assert!(events.lock().iter().all(|e| e.op == Opcode::Set && !e.busy));
    assert_eq!(f.recorder.requests.lock().len(), 4);
}

#[test]
fn test_transient_exhaustion_fails() {
    let f = fixture();
    let (client, slept, _) = recording_client(&f);
    f.recorder.inject(Fault::Transient, 4);

    let err = client.get(EntityKind::Account, "k").unwrap_err();
    assert!(matches!(err, ObjStoreError::Connection(_)));
    assert_eq!(slept.lock().len(), 3);
    assert_eq!(f.recorder.requests.lock().len(), 4);
}

#[test]
fn test_busy_delays_capped_and_bounded() {
    let f = fixture();
    let (client, slept, events) = recording_client(&f);
    f.recorder.inject(Fault::Busy, 3);

    client.ping(EntityKind::Account).unwrap();
    assert_eq!(*slept.lock(), ms(&[1, 2, 4]));
    assert!(events.lock().iter().all(|e| e.busy));

    f.recorder.inject(Fault::Busy, 4);
    let err = client.ping(EntityKind::Account).unwrap_err();
    assert!(err.is_busy());
}

#[test]
fn test_busy_then_transient_use_separate_budgets() {
    let f = fixture();
    let (client, slept, _) = recording_client(&f);
    f.recorder.inject(Fault::Busy, 2);
    f.recorder.inject(Fault::Transient, 3);

    client.ping(EntityKind::Account).unwrap();
    assert_eq!(*slept.lock(), ms(&[1, 2, 1, 2, 4]));
}

#[test]
fn test_permanent_error_not_retried() {
    let f = fixture();
    let (client, slept, events) = recording_client(&f);
    f.recorder.inject(Fault::WrongType, 1);

    let err = client.smembers(EntityKind::Account, "s").unwrap_err();
    assert!(matches!(err, ObjStoreError::Command(_)));
    assert!(slept.lock().is_empty());
    assert!(events.lock().is_empty());
}

#[test]
fn test_busy_backend_recovers() {
    let f = fixture();
    let (client, slept, _) = recording_client(&f);

    f.keyspace.set_loading(true);
    let err = client.get(EntityKind::Account, "k").unwrap_err();
    assert!(err.is_busy());
    assert_eq!(slept.lock().len(), 3);

    f.keyspace.set_loading(false);
    assert!(client.get(EntityKind::Account, "k").unwrap().is_none());
}

// =============================================================================
// Async client
// =============================================================================

#[tokio::test]
async fn test_async_matches_blocking_schedule() {
    let f = fixture();
    let (sync_client, _, sync_events) = recording_client(&f);
    f.recorder.inject(Fault::Busy, 1);
    f.recorder.inject(Fault::Transient, 2);
    sync_client.set(EntityKind::Account, "k", "v").unwrap();

    let (hook, async_events) = recording_hook();
    let async_client = AsyncClient::new(manager(&f), WorkerPool::new(2)).with_retry_hook(hook);
    f.recorder.inject(Fault::Busy, 1);
    f.recorder.inject(Fault::Transient, 2);
    async_client.set(EntityKind::Account, "k", "v").await.unwrap();

    let strip = |events: &[RetryEvent]| -> Vec<(Opcode, u32, Duration, bool)> {
        events.iter().map(|e| (e.op, e.attempt, e.delay, e.busy)).collect()
    };
    assert_eq!(strip(&sync_events.lock()), strip(&async_events.lock()));
    assert_eq!(async_events.lock().len(), 3);
}

#[tokio::test]
async fn test_async_exhaustion_fails() {
    let f = fixture();
    let client = AsyncClient::new(manager(&f), WorkerPool::new(2));
    f.recorder.inject(Fault::Transient, 4);

    let err = client.get(EntityKind::Account, "k").await.unwrap_err();
    assert!(err.is_transient());
    assert_eq!(f.recorder.requests.lock().len(), 4);
}

#[tokio::test]
async fn test_submit_runs_callback_once() {
    let f = fixture();
    let client = AsyncClient::new(manager(&f), WorkerPool::new(2));
    f.recorder.inject(Fault::Transient, 1);

    let calls = Arc::new(Mutex::new(0));
    let seen = Arc::clone(&calls);
    client
        .submit(EntityKind::Account, objstore::protocol::Request::Ping, move |result| {
            assert!(result.is_ok());
            *seen.lock() += 1;
        })
        .await
        .unwrap();

    assert_eq!(*calls.lock(), 1);
}
