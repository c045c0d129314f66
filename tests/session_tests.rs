/// Session tests
///
/// Tests for root and child sessions: open/close, single-operation wrappers,
/// forking onto partitions and snapshots, encodings
/// Run with: cargo test --test session_tests

use kvsession::{
    ConnectionRegistry, DbError, DbOptions, Encoding, MemorySubstrate, RangeOptions, Session,
    SessionOptions, SessionStatus,
};
use std::sync::Arc;

async fn open_session() -> (Arc<MemorySubstrate>, Session) {
    let substrate = Arc::new(MemorySubstrate::new());
    let registry = ConnectionRegistry::new(substrate.clone());
    let session = registry.session("db", DbOptions::default()).unwrap();
    session.open().await.unwrap();
    (substrate, session)
}

#[tokio::test]
async fn test_put_get_delete() {
    let (_substrate, session) = open_session().await;

    session.put("alpha", "1").await.unwrap();
    assert_eq!(session.get("alpha").await.unwrap(), Some(b"1".to_vec()));

    session.put("alpha", "2").await.unwrap();
    assert_eq!(session.get("alpha").await.unwrap(), Some(b"2".to_vec()));

    session.delete("alpha").await.unwrap();
    assert_eq!(session.get("alpha").await.unwrap(), None);
}

#[tokio::test]
async fn test_missing_key_is_not_an_error() {
    let (_substrate, session) = open_session().await;
    assert_eq!(session.get("nothing").await.unwrap(), None);
}

#[tokio::test]
async fn test_end_to_end_snapshot_scenario() {
    let (_substrate, session) = open_session().await;

    session.put("a", "1").await.unwrap();
    session.put("b", "2").await.unwrap();
    session.put("c", "3").await.unwrap();
    let snapshot = session.snapshot().await.unwrap();

    session.put("a", "1-updated").await.unwrap();
    session.delete("b").await.unwrap();

    assert_eq!(session.get("a").await.unwrap(), Some(b"1-updated".to_vec()));
    assert_eq!(session.get("b").await.unwrap(), None);
    assert_eq!(snapshot.get_value("a").await.unwrap(), Some(b"1".to_vec()));
    assert_eq!(snapshot.get_value("b").await.unwrap(), Some(b"2".to_vec()));

    let entries = session
        .iterator(RangeOptions::new().gte("a").lte("c"))
        .unwrap()
        .all()
        .await
        .unwrap();
    assert_eq!(
        entries,
        vec![
            (b"a".to_vec(), b"1-updated".to_vec()),
            (b"c".to_vec(), b"3".to_vec()),
        ]
    );

    drop(snapshot);
    session.close().await;
    assert_eq!(session.status(), SessionStatus::Closed);
}

#[tokio::test]
async fn test_status_follows_lifecycle() {
    let substrate = Arc::new(MemorySubstrate::new());
    let registry = ConnectionRegistry::new(substrate);
    let session = registry.session("db", DbOptions::default()).unwrap();

    assert_eq!(session.status(), SessionStatus::Opening);
    session.open().await.unwrap();
    assert_eq!(session.status(), SessionStatus::Open);

    session.suspend().await.unwrap();
    assert_eq!(session.status(), SessionStatus::Suspended);
    session.resume().await.unwrap();
    assert_eq!(session.status(), SessionStatus::Open);

    session.close().await;
    assert_eq!(session.status(), SessionStatus::Closed);
}

#[tokio::test]
async fn test_read_before_open_fails() {
    let registry = ConnectionRegistry::new(Arc::new(MemorySubstrate::new()));
    let session = registry.session("db", DbOptions::default()).unwrap();

    let err = session.get("k").await.unwrap_err();
    assert!(matches!(err, DbError::NotOpen(_)));
}

#[tokio::test]
async fn test_operations_after_close_fail_fast() {
    let (_substrate, session) = open_session().await;
    session.close().await;

    assert!(session.get("k").await.unwrap_err().is_closed());
    assert!(session.put("k", "v").await.unwrap_err().is_closed());
    assert!(session.snapshot().await.unwrap_err().is_closed());
    assert!(session.iterator(RangeOptions::new()).unwrap_err().is_closed());
    assert!(session.open().await.unwrap_err().is_closed());
}

#[tokio::test]
async fn test_child_session_shares_state() {
    let (_substrate, session) = open_session().await;
    let child = session.session(SessionOptions::new()).await.unwrap();

    assert!(!child.is_root());
    assert!(Arc::ptr_eq(&session.state(), &child.state()));

    child.put("shared", "yes").await.unwrap();
    assert_eq!(session.get("shared").await.unwrap(), Some(b"yes".to_vec()));
    assert_eq!(session.state().session_count(), 2);
}

#[tokio::test]
async fn test_child_close_detaches_only_the_child() {
    let (_substrate, session) = open_session().await;
    let child = session.session(SessionOptions::new()).await.unwrap();

    child.close().await;
    assert_eq!(child.status(), SessionStatus::Closed);
    assert!(child.get("k").await.unwrap_err().is_closed());

    assert_eq!(session.status(), SessionStatus::Open);
    session.put("k", "v").await.unwrap();
}

#[tokio::test]
async fn test_root_close_cascades_to_children() {
    let (_substrate, session) = open_session().await;
    let first = session.session(SessionOptions::new()).await.unwrap();
    let second = first.session(SessionOptions::new()).await.unwrap();

    session.close().await;
    assert_eq!(first.status(), SessionStatus::Closed);
    assert_eq!(second.status(), SessionStatus::Closed);
    assert_eq!(session.state().session_count(), 0);
}

#[tokio::test]
async fn test_lifecycle_control_is_root_only() {
    let (_substrate, session) = open_session().await;
    let child = session.session(SessionOptions::new()).await.unwrap();

    assert!(matches!(child.suspend().await, Err(DbError::InvalidArgument(_))));
    assert!(matches!(child.resume().await, Err(DbError::InvalidArgument(_))));
}

#[tokio::test]
async fn test_partitions_are_isolated() {
    let (substrate, session) = open_session().await;
    let users = session
        .session(SessionOptions::new().partition("users"))
        .await
        .unwrap();

    users.put("k", "user").await.unwrap();
    session.put("k", "default").await.unwrap();

    assert_eq!(users.get("k").await.unwrap(), Some(b"user".to_vec()));
    assert_eq!(session.get("k").await.unwrap(), Some(b"default".to_vec()));
    assert_eq!(users.partition(), "users");

    let stored = substrate.dump("db", "users").await.unwrap();
    assert_eq!(stored, vec![(b"k".to_vec(), b"user".to_vec())]);
    assert_eq!(substrate.schema_version("db").await.unwrap(), 2);
}

#[tokio::test]
async fn test_partition_registered_before_open_is_created_on_open() {
    let substrate = Arc::new(MemorySubstrate::new());
    let registry = ConnectionRegistry::new(substrate.clone());
    let session = registry.session("db", DbOptions::default()).unwrap();

    let events = session
        .session(SessionOptions::new().partition("events"))
        .await
        .unwrap();
    session.open().await.unwrap();

    events.put("e1", "x").await.unwrap();
    assert_eq!(substrate.dump("db", "events").await.unwrap().len(), 1);
    assert_eq!(substrate.schema_version("db").await.unwrap(), 1);
}

#[tokio::test]
async fn test_json_value_encoding_validates() {
    let (_substrate, session) = open_session().await;
    let json = session
        .session(SessionOptions::new().value_encoding(Encoding::Json))
        .await
        .unwrap();

    json.put("doc", r#"{ "name": "kv" }"#).await.unwrap();
    assert_eq!(json.get("doc").await.unwrap(), Some(br#"{"name":"kv"}"#.to_vec()));

    let err = json.put("bad", "not json").await.unwrap_err();
    assert!(matches!(err, DbError::EncodingError(_)));
    assert_eq!(json.get("bad").await.unwrap(), None);
}

#[tokio::test]
async fn test_child_inherits_parent_snapshot() {
    let (_substrate, session) = open_session().await;
    session.put("k", "old").await.unwrap();
    let snapshot = session.snapshot().await.unwrap();

    let pinned = session
        .session(SessionOptions::new().snapshot(&snapshot))
        .await
        .unwrap();
    let inherited = pinned.session(SessionOptions::new()).await.unwrap();
    let live = pinned.session(SessionOptions::new().live()).await.unwrap();

    session.put("k", "new").await.unwrap();

    assert_eq!(pinned.get("k").await.unwrap(), Some(b"old".to_vec()));
    assert_eq!(inherited.get("k").await.unwrap(), Some(b"old".to_vec()));
    assert_eq!(live.get("k").await.unwrap(), Some(b"new".to_vec()));
    assert_eq!(inherited.snapshot_id(), Some(snapshot.id()));
    assert_eq!(live.snapshot_id(), None);
}

#[tokio::test]
async fn test_snapshot_must_match_partition() {
    let (_substrate, session) = open_session().await;
    let snapshot = session.snapshot().await.unwrap();

    let result = session
        .session(SessionOptions::new().partition("other").snapshot(&snapshot))
        .await;
    assert!(matches!(result, Err(DbError::InvalidArgument(_))));
}

#[tokio::test]
async fn test_session_from_url() {
    let registry = ConnectionRegistry::new(Arc::new(MemorySubstrate::new()));
    let session = registry
        .from_url("kvsession://urls?partition=links&window=8")
        .unwrap();
    session.open().await.unwrap();

    assert_eq!(session.location(), "urls");
    assert_eq!(session.partition(), "links");
    assert_eq!(session.state().options().iterator_high_water, 8);
    session.put("home", "/").await.unwrap();
}

#[tokio::test]
async fn test_handles_settle_at_zero() {
    let (_substrate, session) = open_session().await;
    for i in 0..10 {
        session.put(format!("k{}", i), "v").await.unwrap();
        session.get(format!("k{}", i)).await.unwrap();
    }
    let counts = session.handles();
    assert_eq!(counts.io, 0);
    assert_eq!(counts.refs, 0);
}

#[tokio::test]
async fn test_children_and_snapshots_release_every_reference() {
    let (_substrate, session) = open_session().await;
    let state = session.state();
    session.put("k", "v").await.unwrap();

    let mut snapshots = Vec::new();
    let mut children = Vec::new();
    for _ in 0..5 {
        let snapshot = session.snapshot().await.unwrap();
        children.push(
            session
                .session(SessionOptions::new().snapshot(&snapshot))
                .await
                .unwrap(),
        );
        snapshots.push(snapshot);
    }
    assert_eq!(state.session_count(), 6);
    assert_eq!(state.snapshot_count(), 5);

    for child in &children {
        assert_eq!(child.get("k").await.unwrap(), Some(b"v".to_vec()));
        child.close().await;
    }
    drop(snapshots);

    assert_eq!(state.session_count(), 1);
    assert_eq!(state.snapshot_count(), 0);
    assert_eq!(session.handles().refs, 0);
    assert_eq!(session.handles().io, 0);

    let mut idle = tokio_test::task::spawn(state.ref_handles().idle());
    tokio_test::assert_ready!(idle.poll());
}
