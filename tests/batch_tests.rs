/// Batch tests
///
/// Tests for read/write batches: read-your-own-writes, atomic flush,
/// pooling, capacity and the destroyed/read-only rules
/// Run with: cargo test --test batch_tests

use kvsession::{
    BatchKind, BatchOptions, ConnectionRegistry, DbError, DbOptions, MemorySubstrate, Session,
};
use std::sync::Arc;
use std::time::Duration;

async fn open_session() -> (Arc<MemorySubstrate>, Session) {
    let substrate = Arc::new(MemorySubstrate::new());
    let registry = ConnectionRegistry::new(substrate.clone());
    let session = registry.session("db", DbOptions::default()).unwrap();
    session.open().await.unwrap();
    (substrate, session)
}

#[tokio::test]
async fn test_read_your_own_writes_before_flush() {
    let (_substrate, session) = open_session().await;
    let batch = session.write(BatchOptions::new()).unwrap();

    batch.put("k", "buffered").unwrap();
    assert_eq!(batch.get("k").await.unwrap(), Some(b"buffered".to_vec()));

    // Other sessions only see committed state.
    assert_eq!(session.get("k").await.unwrap(), None);

    batch.flush().await.unwrap();
    assert_eq!(session.get("k").await.unwrap(), Some(b"buffered".to_vec()));
    assert!(batch.is_empty());
}

#[tokio::test]
async fn test_buffered_delete_hides_committed_value() {
    let (_substrate, session) = open_session().await;
    session.put("k", "v").await.unwrap();

    let batch = session.write(BatchOptions::new()).unwrap();
    batch.delete("k").unwrap();
    assert_eq!(batch.get("k").await.unwrap(), None);
    assert_eq!(session.get("k").await.unwrap(), Some(b"v".to_vec()));

    batch.flush().await.unwrap();
    assert_eq!(session.get("k").await.unwrap(), None);
}

#[tokio::test]
async fn test_last_write_wins_within_batch() {
    let (substrate, session) = open_session().await;
    let batch = session.write(BatchOptions::new()).unwrap();

    batch.put("k", "1").unwrap();
    batch.put("k", "2").unwrap();
    batch.delete("k").unwrap();
    batch.put("k", "3").unwrap();
    assert_eq!(batch.len(), 1);

    batch.flush().await.unwrap();
    let stored = substrate.dump("db", "default").await.unwrap();
    assert_eq!(stored, vec![(b"k".to_vec(), b"3".to_vec())]);
}

#[tokio::test]
async fn test_delete_range_is_half_open() {
    let (substrate, session) = open_session().await;
    for key in ["a", "b", "c", "d"] {
        session.put(key, "v").await.unwrap();
    }

    let batch = session.write(BatchOptions::new()).unwrap();
    batch.delete_range("b", "d").unwrap();
    assert_eq!(batch.get("c").await.unwrap(), None);
    assert_eq!(batch.get("d").await.unwrap(), Some(b"v".to_vec()));
    batch.flush().await.unwrap();

    let keys: Vec<Vec<u8>> = substrate
        .dump("db", "default")
        .await
        .unwrap()
        .into_iter()
        .map(|(k, _)| k)
        .collect();
    assert_eq!(keys, vec![b"a".to_vec(), b"d".to_vec()]);
}

#[tokio::test]
async fn test_put_after_delete_range_survives() {
    let (_substrate, session) = open_session().await;
    session.put("b", "old").await.unwrap();

    let batch = session.write(BatchOptions::new()).unwrap();
    batch.delete_range("a", "z").unwrap();
    batch.put("b", "new").unwrap();
    batch.flush().await.unwrap();

    assert_eq!(session.get("b").await.unwrap(), Some(b"new".to_vec()));
}

#[tokio::test]
async fn test_inverted_range_is_rejected() {
    let (_substrate, session) = open_session().await;
    let batch = session.write(BatchOptions::new()).unwrap();
    assert!(matches!(batch.delete_range("z", "a"), Err(DbError::InvalidRange(_))));
}

#[tokio::test]
async fn test_failed_put_applies_nothing() {
    let (substrate, session) = open_session().await;
    let batch = session.write(BatchOptions::new()).unwrap();
    batch.put("a", "1").unwrap();
    batch.put("b", "2").unwrap();
    batch.put("c", "3").unwrap();

    substrate.fail_put_on("c").unwrap();
    let err = batch.flush().await.unwrap_err();
    assert!(matches!(err, DbError::SubstrateError { .. }));
    assert!(substrate.dump("db", "default").await.unwrap().is_empty());

    // The buffer is kept for a retry.
    assert_eq!(batch.len(), 3);
    substrate.clear_faults().unwrap();
    batch.flush().await.unwrap();
    assert_eq!(substrate.dump("db", "default").await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_failed_commit_applies_nothing() {
    let (substrate, session) = open_session().await;
    session.put("keep", "1").await.unwrap();

    let batch = session.write(BatchOptions::new()).unwrap();
    batch.put("a", "1").unwrap();
    batch.delete("keep").unwrap();

    substrate.fail_next_commit();
    let err = batch.flush().await.unwrap_err();
    match err {
        DbError::SubstrateError { operation, .. } => assert!(operation.starts_with("flush")),
        other => panic!("unexpected error: {other:?}"),
    }

    assert_eq!(session.get("a").await.unwrap(), None);
    assert_eq!(session.get("keep").await.unwrap(), Some(b"1".to_vec()));
}

#[tokio::test]
async fn test_read_batch_rejects_mutation() {
    let (_substrate, session) = open_session().await;
    let batch = session.read(BatchOptions::new()).unwrap();

    assert_eq!(batch.kind(), BatchKind::Read);
    assert_eq!(batch.put("k", "v"), Err(DbError::ReadOnlyBatch));
    assert_eq!(batch.delete("k"), Err(DbError::ReadOnlyBatch));
    assert_eq!(batch.delete_range("a", "b"), Err(DbError::ReadOnlyBatch));
    assert!(batch.flush().await.is_ok());
}

#[tokio::test]
async fn test_destroyed_batch() {
    let (_substrate, session) = open_session().await;
    let batch = session.write(BatchOptions::new()).unwrap();
    batch.put("k", "v").unwrap();

    batch.destroy();
    batch.destroy();
    assert!(batch.is_destroyed());
    assert!(batch.is_empty());

    // Mutations are ignored; reads and flushes fail.
    assert!(batch.put("k", "v").is_ok());
    assert!(batch.is_empty());
    assert!(batch.get("k").await.unwrap_err().is_closed());
    assert!(batch.flush().await.unwrap_err().is_closed());
    assert_eq!(session.get("k").await.unwrap(), None);
}

#[tokio::test]
async fn test_auto_destroy_after_flush() {
    let (_substrate, session) = open_session().await;
    let batch = session.write(BatchOptions::new().auto_destroy(true)).unwrap();
    batch.put("k", "v").unwrap();
    batch.flush().await.unwrap();

    assert!(batch.is_destroyed());
    assert_eq!(session.get("k").await.unwrap(), Some(b"v".to_vec()));
}

#[tokio::test]
async fn test_destroyed_batches_are_pooled_clean() {
    let (_substrate, session) = open_session().await;
    let state = session.state();

    let first = session.write(BatchOptions::new()).unwrap();
    assert!(!first.recycled());
    first.put("leak", "v").unwrap();
    first.destroy();
    assert_eq!(state.pooled_batches(BatchKind::Write), 1);

    let second = session.write(BatchOptions::new()).unwrap();
    assert!(second.recycled());
    assert!(second.is_empty());
    assert_eq!(second.get("leak").await.unwrap(), None);
    assert_eq!(state.pooled_batches(BatchKind::Write), 0);
}

#[tokio::test]
async fn test_pool_is_bounded() {
    let substrate = Arc::new(MemorySubstrate::new());
    let registry = ConnectionRegistry::new(substrate);
    let session = registry
        .session("db", DbOptions::default().batch_pool_size(2))
        .unwrap();
    session.open().await.unwrap();

    let batches: Vec<_> = (0..4)
        .map(|_| session.read(BatchOptions::new()).unwrap())
        .collect();
    drop(batches);
    assert_eq!(session.state().pooled_batches(BatchKind::Read), 2);
}

#[tokio::test]
async fn test_capacity_limits_distinct_operations() {
    let (_substrate, session) = open_session().await;
    let batch = session.write(BatchOptions::new().capacity(2)).unwrap();

    batch.put("a", "1").unwrap();
    batch.put("b", "1").unwrap();
    batch.put("a", "2").unwrap();
    assert_eq!(batch.put("c", "1"), Err(DbError::BatchFull(2)));
    assert_eq!(batch.len(), 2);
    assert_eq!(batch.get("c").await.unwrap(), None);
}

#[tokio::test]
async fn test_writes_during_flush_stay_buffered() {
    let (substrate, session) = open_session().await;
    substrate.set_commit_latency(Duration::from_millis(50));

    let batch = session.write(BatchOptions::new()).unwrap();
    batch.put("early", "1").unwrap();

    let flushing = {
        let batch = batch.clone();
        tokio::spawn(async move { batch.flush().await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    batch.put("late", "2").unwrap();

    flushing.await.unwrap().unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(session.get("early").await.unwrap(), Some(b"1".to_vec()));
    assert_eq!(session.get("late").await.unwrap(), None);

    substrate.clear_faults().unwrap();
    batch.flush().await.unwrap();
    assert_eq!(session.get("late").await.unwrap(), Some(b"2".to_vec()));
}

#[tokio::test]
async fn test_try_flush_commits_in_background() {
    let (_substrate, session) = open_session().await;
    let batch = session.write(BatchOptions::new()).unwrap();
    batch.put("k", "v").unwrap();

    batch.try_flush().await.unwrap();
    assert_eq!(session.get("k").await.unwrap(), Some(b"v".to_vec()));
}

#[tokio::test]
async fn test_try_flush_swallows_errors() {
    let (substrate, session) = open_session().await;
    let batch = session.write(BatchOptions::new()).unwrap();
    batch.put("k", "v").unwrap();

    substrate.fail_next_commit();
    // The task completes without surfacing the failure.
    batch.try_flush().await.unwrap();
    assert_eq!(session.get("k").await.unwrap(), None);
    assert_eq!(batch.len(), 1);
}

#[tokio::test]
async fn test_batch_on_closed_child_session_fails() {
    let (_substrate, session) = open_session().await;
    let child = session
        .session(kvsession::SessionOptions::new())
        .await
        .unwrap();
    let batch = child.write(BatchOptions::new()).unwrap();

    child.close().await;
    assert!(batch.put("k", "v").unwrap_err().is_closed());
    assert!(batch.flush().await.unwrap_err().is_closed());
}
