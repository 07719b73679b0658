//! Object Store Tests
//!
//! Save/get/modify/delete against an in-process backend.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use common::{fixture, Fault};
use objstore::error::{DecodeError, ObjStoreError};
use objstore::protocol::{Request, WriteOp};
use objstore::record::codec::{encode, entity_set_key, owner_set_key};
use objstore::record::{
    Account, EntityKind, Integration, JobRequest, Request as JobFamily, RequestState, StoredObject,
    ThumbnailStatus, VideoMetadata, VideoStatus,
};
use objstore::store::GetOptions;

fn raw_get(f: &common::Fixture, key: &str) -> Option<String> {
    f.store.client().get(EntityKind::Account, key).unwrap()
}

fn members(f: &common::Fixture, set: &str) -> Vec<String> {
    f.store.client().smembers(EntityKind::Account, set).unwrap()
}

// =============================================================================
// Save / Get
// =============================================================================

#[test]
fn test_save_then_get() {
    let f = fixture();
    let mut account = Account::new("acct1");
    account.name = Some("Acme".to_string());
    f.store.save(&mut account).unwrap();

    let loaded: Account = f.store.get("acct1", GetOptions::default()).unwrap().unwrap();
    assert_eq!(loaded, account);
    assert_eq!(loaded.id(), "acct1");
    assert_eq!(members(&f, &entity_set_key(EntityKind::Account)), vec!["account_acct1"]);
}

#[test]
fn test_save_is_one_transaction() {
    let f = fixture();
    f.store.save(&mut Account::new("acct1")).unwrap();

    let requests = f.recorder.requests.lock();
    assert_eq!(requests.len(), 1);
    match &requests[0] {
        Request::Exec { watched, ops } => {
            assert!(watched.is_empty());
            assert!(matches!(&ops[0], WriteOp::SAdd { set, .. } if set == "objset:account"));
            assert!(matches!(&ops[1], WriteOp::Set { key, .. } if key == "account_acct1"));
        }
        other => panic!("expected EXEC, got {:?}", other),
    }
}

#[test]
fn test_save_stamps_updated() {
    let f = fixture();
    let mut account = Account::new("acct1");
    let created = account.meta.created;
    let before = account.meta.updated;
    std::thread::sleep(std::time::Duration::from_millis(2));
    f.store.save(&mut account).unwrap();

    assert_eq!(account.meta.created, created);
    assert!(account.meta.updated > before);
}

#[test]
fn test_get_missing_is_none() {
    let f = fixture();
    let loaded: Option<Account> = f.store.get("nobody", GetOptions::default()).unwrap();
    assert!(loaded.is_none());
}

#[test]
fn test_get_missing_with_default() {
    let f = fixture();
    let loaded: Account = f.store.get("nobody", GetOptions::or_default()).unwrap().unwrap();
    assert_eq!(loaded.meta.key, "account_nobody");
    assert_eq!(loaded.processing_priority, 1);
    assert_eq!(f.recorder.exec_count(), 0);
}

#[test]
fn test_defaulted_kind_never_none() {
    let f = fixture();
    let status: Option<VideoStatus> = f.store.get("acct1_vid1", GetOptions::default()).unwrap();
    assert_eq!(status.unwrap().meta.key, "videostatus_acct1_vid1");

    let many: Vec<Option<ThumbnailStatus>> = f
        .store
        .get_many(&["t1".to_string(), "t2".to_string()])
        .unwrap();
    assert!(many.iter().all(Option::is_some));
}

#[test]
fn test_get_many_preserves_order_and_length() {
    let f = fixture();
    f.store.save(&mut Account::new("a")).unwrap();
    f.store.save(&mut Account::new("c")).unwrap();

    let ids: Vec<String> = ["c", "missing", "a", "c"].iter().map(|s| s.to_string()).collect();
    let loaded: Vec<Option<Account>> = f.store.get_many(&ids).unwrap();

    assert_eq!(loaded.len(), 4);
    assert_eq!(loaded[0].as_ref().unwrap().id(), "c");
    assert!(loaded[1].is_none());
    assert_eq!(loaded[2].as_ref().unwrap().id(), "a");
    assert_eq!(loaded[3].as_ref().unwrap().id(), "c");
}

#[test]
fn test_get_many_empty_makes_no_call() {
    let f = fixture();
    let loaded: Vec<Option<Account>> = f.store.get_many(&[]).unwrap();
    assert!(loaded.is_empty());
    assert!(f.recorder.requests.lock().is_empty());
}

#[test]
fn test_save_all_single_transaction() {
    let f = fixture();
    let mut jobs = vec![
        JobFamily::Neon(JobRequest::new("j1", "acctA")),
        JobFamily::Neon(JobRequest::new("j2", "acctA")),
        JobFamily::Neon(JobRequest::new("j3", "acctB")),
    ];
    f.store.save_all(&mut jobs).unwrap();

    assert_eq!(f.recorder.exec_count(), 1);
    assert_eq!(members(&f, &owner_set_key(EntityKind::Request, "acctA")).len(), 2);
    assert_eq!(members(&f, &owner_set_key(EntityKind::Request, "acctB")).len(), 1);

    let loaded: JobFamily = f.store.get("acctA_j2", GetOptions::default()).unwrap().unwrap();
    assert_eq!(loaded.job().job_id, "j2");
}

// =============================================================================
// Decoding
// =============================================================================

#[test]
fn test_malformed_payload_reads_as_missing() {
    let f = fixture();
    f.store.client().set(EntityKind::Account, "account_bad", "{not json").unwrap();

    let single: Option<Account> = f.store.get("bad", GetOptions::quiet()).unwrap();
    assert!(single.is_none());

    let many: Vec<Option<Account>> = f.store.get_many(&["bad".to_string()]).unwrap();
    assert_eq!(many, vec![None]);
}

#[test]
fn test_unknown_type_is_hard_error() {
    let f = fixture();
    f.store
        .client()
        .set(EntityKind::Account, "account_x", r#"{"_type":"Martian","_data":{}}"#)
        .unwrap();

    let err = f.store.get::<Account>("x", GetOptions::default()).unwrap_err();
    assert!(matches!(err, ObjStoreError::Decode(DecodeError::UnknownType { .. })));
}

#[test]
fn test_foreign_family_is_hard_error() {
    let f = fixture();
    let video = VideoMetadata::new("acct1_v1");
    f.store
        .client()
        .set(EntityKind::Account, "account_v", &encode(&video).unwrap())
        .unwrap();

    let err = f.store.get::<Account>("v", GetOptions::default()).unwrap_err();
    assert!(matches!(err, ObjStoreError::Decode(DecodeError::WrongFamily { .. })));
}

#[test]
fn test_legacy_flat_request() {
    let f = fixture();
    let flat = r#"{"key":"request_wrong","job_id":"j9","api_key":"acct1","request_type":"brightcove","publisher_id":"p1"}"#;
    f.store.client().set(EntityKind::Request, "request_acct1_j9", flat).unwrap();

    let loaded: JobFamily = f.store.get("acct1_j9", GetOptions::default()).unwrap().unwrap();
    assert!(matches!(loaded, JobFamily::Brightcove(_)));
    assert_eq!(loaded.key(), "request_acct1_j9");
}

#[test]
fn test_polymorphic_integration_round_trip() {
    let f = fixture();
    let mut integration = Integration::with_key("integration_i1".to_string());
    if let Integration::Neon(neon) = &mut integration {
        neon.account_id = "acct1".to_string();
    }
    f.store.save(&mut integration).unwrap();

    let loaded: Integration = f.store.get("i1", GetOptions::default()).unwrap().unwrap();
    assert_eq!(loaded, integration);
    assert_eq!(loaded.account_id(), "acct1");
}

// =============================================================================
// Modify
// =============================================================================

#[test]
fn test_modify_missing_without_create() {
    let f = fixture();
    let result = f
        .store
        .modify::<Account, _>("ghost", |a| a.name = Some("x".into()), false)
        .unwrap();

    assert!(result.is_none());
    assert_eq!(f.recorder.exec_count(), 0);
    assert!(raw_get(&f, "account_ghost").is_none());
}

#[test]
fn test_modify_creates_when_asked() {
    let f = fixture();
    let created = f
        .store
        .modify::<Account, _>("new", |a| a.name = Some("Fresh".into()), true)
        .unwrap()
        .unwrap();

    assert_eq!(created.meta.key, "account_new");
    let loaded: Account = f.store.get("new", GetOptions::default()).unwrap().unwrap();
    assert_eq!(loaded.name.as_deref(), Some("Fresh"));
    assert!(members(&f, "objset:account").contains(&"account_new".to_string()));
}

#[test]
fn test_modify_unchanged_writes_nothing() {
    let f = fixture();
    f.store.save(&mut Account::new("acct1")).unwrap();
    f.recorder.clear();

    f.store.modify::<Account, _>("acct1", |_| {}, false).unwrap();
    assert_eq!(f.recorder.exec_count(), 0);
}

#[test]
fn test_modify_cannot_change_key() {
    let f = fixture();
    f.store.save(&mut Account::new("acct1")).unwrap();

    let out = f
        .store
        .modify::<Account, _>("acct1", |a| a.meta.key = "account_hijack".into(), false)
        .unwrap()
        .unwrap();
    assert_eq!(out.meta.key, "account_acct1");
    assert!(raw_get(&f, "account_hijack").is_none());
}

#[test]
fn test_modify_retries_after_conflict() {
    let f = fixture();
    f.store.save(&mut Account::new("acct1")).unwrap();

    // A competing writer lands between the read and the commit once
    let keyspace = Arc::clone(&f.keyspace);
    let mut rival = Account::new("acct1");
    rival.name = Some("Rival".into());
    let payload = encode(&rival).unwrap();
    *f.recorder.before_exec.lock() = Some(Box::new(move || {
        keyspace.execute(Request::Set {
            key: "account_acct1".into(),
            value: payload.clone(),
        });
        false
    }));

    let mut calls = 0;
    let out = f
        .store
        .modify::<Account, _>(
            "acct1",
            |a| {
                calls += 1;
                a.users.push("u1".into());
            },
            false,
        )
        .unwrap()
        .unwrap();

    assert_eq!(calls, 2);
    assert_eq!(out.name.as_deref(), Some("Rival"));
    assert_eq!(out.users, vec!["u1"]);
    let loaded: Account = f.store.get("acct1", GetOptions::default()).unwrap().unwrap();
    assert_eq!(loaded.users, vec!["u1"]);
}

#[test]
fn test_modify_gives_up_after_budget() {
    let f = fixture();
    f.store.save(&mut Account::new("acct1")).unwrap();

    let keyspace = Arc::clone(&f.keyspace);
    let mut n = 0u32;
    *f.recorder.before_exec.lock() = Some(Box::new(move || {
        n += 1;
        let mut rival = Account::new("acct1");
        rival.processing_priority = (n % 200) as u8;
        keyspace.execute(Request::Set {
            key: "account_acct1".into(),
            value: encode(&rival).unwrap(),
        });
        true
    }));

    let err = f
        .store
        .modify::<Account, _>("acct1", |a| a.users.push("u".into()), false)
        .unwrap_err();
    match err {
        ObjStoreError::TransactionConflict { keys, attempts } => {
            assert_eq!(keys, vec!["account_acct1"]);
            assert_eq!(attempts, 5);
        }
        other => panic!("expected conflict, got {:?}", other),
    }
}

#[test]
fn test_modify_decode_failure_is_fatal() {
    let f = fixture();
    f.store.client().set(EntityKind::Account, "account_bad", "{oops").unwrap();

    let err = f
        .store
        .modify::<Account, _>("bad", |a| a.name = Some("x".into()), true)
        .unwrap_err();
    assert!(matches!(err, ObjStoreError::Decode(DecodeError::Malformed { .. })));
}

// =============================================================================
// Modify many
// =============================================================================

#[test]
fn test_modify_many_identity_writes_nothing() {
    let f = fixture();
    f.store.save(&mut Account::new("a1")).unwrap();
    f.store.save(&mut Account::new("a2")).unwrap();
    f.recorder.clear();

    let ids = vec!["a1".to_string(), "a2".to_string(), "a3".to_string()];
    let out = f.store.modify_many::<Account, _>(&ids, |_| {}, false).unwrap();

    assert_eq!(out.len(), 3);
    assert!(out["a3"].is_none());
    assert_eq!(f.recorder.exec_count(), 0);
}

#[test]
fn test_modify_many_changes_and_creates() {
    let f = fixture();
    f.store.save(&mut Account::new("a1")).unwrap();
    f.store.save(&mut Account::new("a2")).unwrap();
    f.recorder.clear();

    let ids = vec!["a1".to_string(), "a2".to_string(), "a3".to_string()];
    f.store
        .modify_many::<Account, _>(
            &ids,
            |records: &mut BTreeMap<String, Option<Account>>| {
                if let Some(Some(a1)) = records.get_mut("a1") {
                    a1.name = Some("one".into());
                }
                records.insert("a3".into(), Some(Account::new("a3")));
            },
            false,
        )
        .unwrap();

    assert_eq!(f.recorder.exec_count(), 1);
    let requests = f.recorder.requests.lock().clone();
    let exec_ops = requests
        .iter()
        .find_map(|r| match r {
            Request::Exec { ops, .. } => Some(ops.clone()),
            _ => None,
        })
        .unwrap();
    let sets = exec_ops.iter().filter(|op| matches!(op, WriteOp::Set { .. })).count();
    assert_eq!(sets, 2, "only a1 and a3 are written");

    let loaded: Vec<Option<Account>> = f.store.get_many(&ids).unwrap();
    assert_eq!(loaded[0].as_ref().unwrap().name.as_deref(), Some("one"));
    assert!(loaded[2].is_some());
    assert!(members(&f, "objset:account").contains(&"account_a3".to_string()));
}

#[test]
fn test_modify_many_create_missing() {
    let f = fixture();
    let ids = vec!["v1".to_string()];
    let out = f
        .store
        .modify_many::<VideoStatus, _>(&ids, |_| {}, true)
        .unwrap();
    assert!(out["v1"].is_some());
    // A freshly materialized record is new content
    assert_eq!(f.recorder.exec_count(), 1);
}

// =============================================================================
// Delete
// =============================================================================

#[test]
fn test_delete_removes_payload_and_membership() {
    let f = fixture();
    f.store.save(&mut Account::new("a1")).unwrap();
    f.store.save(&mut Account::new("a2")).unwrap();

    f.store.delete::<Account>("a1").unwrap();

    assert!(f.store.get::<Account>("a1", GetOptions::quiet()).unwrap().is_none());
    assert_eq!(members(&f, "objset:account"), vec!["account_a2"]);
}

#[test]
fn test_delete_many_owner_sets() {
    let f = fixture();
    let mut videos = vec![
        VideoMetadata::new("acct1_v1"),
        VideoMetadata::new("acct1_v2"),
        VideoMetadata::new("acct2_v1"),
    ];
    f.store.save_all(&mut videos).unwrap();

    f.store
        .delete_many::<VideoMetadata>(&["acct1_v1".to_string(), "acct2_v1".to_string()])
        .unwrap();

    assert_eq!(members(&f, "objset:video:acct1"), vec!["video_acct1_v2"]);
    assert!(members(&f, "objset:video:acct2").is_empty());
}

// =============================================================================
// Listing
// =============================================================================

#[test]
fn test_all_ids_entity_set() {
    let f = fixture();
    for i in 0..20 {
        f.store.save(&mut Account::new(&format!("a{:02}", i))).unwrap();
    }
    let mut ids = f.store.all_ids::<Account>().unwrap();
    ids.sort();
    assert_eq!(ids.len(), 20);
    assert_eq!(ids[0], "a00");
}

#[test]
fn test_all_ids_owner_grouped() {
    let f = fixture();
    let mut jobs = vec![
        JobFamily::Neon(JobRequest::new("j1", "acctA")),
        JobFamily::Neon(JobRequest::new("j2", "acctB")),
    ];
    f.store.save_all(&mut jobs).unwrap();

    let mut ids = f.store.all_ids::<JobFamily>().unwrap();
    ids.sort();
    assert_eq!(ids, vec!["acctA_j1", "acctB_j2"]);

    assert_eq!(f.store.owner_ids::<JobFamily>("acctA").unwrap(), vec!["acctA_j1"]);
    assert!(f.store.owner_ids::<Account>("acctA").is_err());
}

#[test]
fn test_get_all_and_pattern() {
    let f = fixture();
    for id in ["red1", "red2", "blue1"] {
        f.store.save(&mut Account::new(id)).unwrap();
    }

    assert_eq!(f.store.get_all::<Account>().unwrap().len(), 3);

    let mut reds: Vec<String> = f
        .store
        .get_many_with_pattern::<Account>("red*")
        .unwrap()
        .iter()
        .map(|a| a.id().to_string())
        .collect();
    reds.sort();
    assert_eq!(reds, vec!["red1", "red2"]);
}

#[test]
fn test_erase_all() {
    let f = fixture();
    f.store.save(&mut Account::new("a1")).unwrap();
    f.store.erase_all::<Account>().unwrap();
    assert_eq!(f.keyspace.key_count(), 0);
}

// =============================================================================
// Errors
// =============================================================================

#[test]
fn test_non_transient_error_not_retried() {
    let f = fixture();
    f.recorder.inject(Fault::WrongType, 1);

    let err = f.store.get::<Account>("a1", GetOptions::default()).unwrap_err();
    assert!(matches!(err, ObjStoreError::Command(_)));
    assert_eq!(f.recorder.requests.lock().len(), 1);
}

#[test]
fn test_transient_errors_absorbed() {
    let f = fixture();
    f.store.save(&mut Account::new("a1")).unwrap();
    f.recorder.inject(Fault::Transient, 2);

    let loaded: Option<Account> = f.store.get("a1", GetOptions::default()).unwrap();
    assert!(loaded.is_some());
}

#[test]
fn test_job_state_round_trip() {
    let f = fixture();
    let mut job = JobFamily::Neon(JobRequest::new("j1", "acct1"));
    job.job_mut().state = RequestState::Finished;
    f.store.save(&mut job).unwrap();

    let loaded: JobFamily = f.store.get("acct1_j1", GetOptions::default()).unwrap().unwrap();
    assert_eq!(loaded.job().state, RequestState::Finished);
}
