// ============================================================================
// Batches
// ============================================================================
//
// A Batch buffers mutations against one Session and commits them as a single
// substrate transaction on flush. Reads check the buffer first, then the
// session's snapshot (if any), then the live substrate.
//
// Buffer mutation happens under a short synchronous lock and never spans an
// await point, so concurrent callers on a multi-threaded runtime see each
// mutation as atomic. Flushes of one batch are serialized.
//
// ============================================================================

use super::change::{BatchCore, Lookup};
use crate::core::{DbError, KeyRange, Result};
use crate::facade::session::SessionInner;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{Instrument, Level, event, info_span};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchKind {
    Read,
    Write,
}

/// Per-batch options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOptions {
    /// Destroy the batch after its first successful flush
    pub auto_destroy: bool,

    /// Maximum number of distinct buffered operations
    pub capacity: Option<usize>,
}

impl BatchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn auto_destroy(mut self, auto_destroy: bool) -> Self {
        self.auto_destroy = auto_destroy;
        self
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Options of the single-operation convenience wrappers.
    pub(crate) fn single() -> Self {
        Self {
            auto_destroy: true,
            capacity: Some(1),
        }
    }
}

/// A read or write batch.
///
/// Cloning yields another handle to the same batch. The batch is destroyed
/// when [`Batch::destroy`] is called or the last handle is dropped.
#[derive(Clone)]
pub struct Batch {
    inner: Arc<BatchInner>,
}

struct BatchInner {
    kind: BatchKind,
    options: BatchOptions,
    recycled: bool,
    slot: Mutex<BatchSlot>,
    flush_lock: tokio::sync::Mutex<()>,
}

/// Both fields are `None` once the batch is destroyed.
struct BatchSlot {
    session: Option<Arc<SessionInner>>,
    core: Option<BatchCore>,
}

impl Batch {
    pub(crate) fn new(
        session: Arc<SessionInner>,
        kind: BatchKind,
        options: BatchOptions,
    ) -> Result<Self> {
        if options.capacity == Some(0) {
            return Err(DbError::InvalidArgument("batch capacity must be > 0".into()));
        }
        session.ensure_attached()?;
        let core = session.state().checkout_core(kind)?;
        let recycled = core.is_recycled();

        Ok(Self {
            inner: Arc::new(BatchInner {
                kind,
                options,
                recycled,
                slot: Mutex::new(BatchSlot {
                    session: Some(session),
                    core: Some(core),
                }),
                flush_lock: tokio::sync::Mutex::new(()),
            }),
        })
    }

    pub fn kind(&self) -> BatchKind {
        self.inner.kind
    }

    pub fn options(&self) -> BatchOptions {
        self.inner.options
    }

    /// Whether the buffer was taken from the State's pool.
    pub fn recycled(&self) -> bool {
        self.inner.recycled
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.lock_slot().core.is_none()
    }

    /// Number of buffered operations
    pub fn len(&self) -> usize {
        self.inner.lock_slot().core.as_ref().map_or(0, BatchCore::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read `key`, seeing this batch's own buffered writes.
    pub async fn get(&self, key: impl AsRef<[u8]>) -> Result<Option<Vec<u8>>> {
        let (session, encoded, buffered) = {
            let slot = self.inner.lock_slot();
            let (Some(session), Some(core)) = (slot.session.as_ref(), slot.core.as_ref()) else {
                return Err(destroyed());
            };
            session.ensure_attached()?;
            let encoded = session.key_encoding.encode(key.as_ref())?;
            let buffered = core.lookup(&encoded);
            (Arc::clone(session), encoded, buffered)
        };

        let stored = match buffered {
            Lookup::Put(value) => Some(value),
            Lookup::Deleted => None,
            Lookup::Miss => {
                let _op = session.state().begin_op()?;
                session.read_committed(&encoded).await?
            }
        };
        stored
            .map(|value| session.value_encoding.decode(&value))
            .transpose()
    }

    /// Buffer a put. Last write for a key wins.
    pub fn put(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Result<()> {
        self.mutate(|session| {
            Ok(Mutation::Put(
                session.key_encoding.encode(key.as_ref())?,
                session.value_encoding.encode(value.as_ref())?,
            ))
        })
    }

    /// Buffer a delete.
    pub fn delete(&self, key: impl AsRef<[u8]>) -> Result<()> {
        self.mutate(|session| Ok(Mutation::Delete(session.key_encoding.encode(key.as_ref())?)))
    }

    /// Buffer deletion of every key in `[start, end)`.
    pub fn delete_range(&self, start: impl AsRef<[u8]>, end: impl AsRef<[u8]>) -> Result<()> {
        self.mutate(|session| {
            let start = session.key_encoding.encode(start.as_ref())?;
            let end = session.key_encoding.encode(end.as_ref())?;
            if start > end {
                return Err(DbError::InvalidRange("range start is after its end".into()));
            }
            Ok(Mutation::Range(KeyRange::half_open(start, end)))
        })
    }

    fn mutate<F>(&self, prepare: F) -> Result<()>
    where
        F: FnOnce(&SessionInner) -> Result<Mutation>,
    {
        let mut guard = self.inner.lock_slot();
        let slot = &mut *guard;
        let (Some(session), Some(core)) = (slot.session.as_ref(), slot.core.as_mut()) else {
            return Ok(());
        };
        if self.inner.kind == BatchKind::Read {
            return Err(DbError::ReadOnlyBatch);
        }
        session.ensure_attached()?;

        let mutation = prepare(session)?;
        if let Some(capacity) = self.inner.options.capacity {
            let grows = match &mutation {
                Mutation::Put(key, _) | Mutation::Delete(key) => !core.contains_key(key),
                Mutation::Range(_) => true,
            };
            if grows && core.len() >= capacity {
                return Err(DbError::BatchFull(capacity));
            }
        }

        match mutation {
            Mutation::Put(key, value) => core.put(key, value),
            Mutation::Delete(key) => core.delete(key),
            Mutation::Range(range) => core.delete_range(range),
        }
        Ok(())
    }

    /// Commit every buffered operation in one atomic transaction.
    ///
    /// On failure nothing is applied and the buffer is kept. Operations
    /// buffered while the flush runs stay buffered for the next one.
    pub async fn flush(&self) -> Result<()> {
        let _serial = self.inner.flush_lock.lock().await;

        let (session, frozen) = {
            let slot = self.inner.lock_slot();
            let (Some(session), Some(core)) = (slot.session.as_ref(), slot.core.as_ref()) else {
                return Err(destroyed());
            };
            let frozen = match self.inner.kind {
                BatchKind::Write if !core.is_empty() => Some(core.freeze()),
                _ => None,
            };
            (Arc::clone(session), frozen)
        };
        session.ensure_attached()?;

        if let Some((ops, watermark)) = frozen {
            let state = session.state();
            let _op = state.begin_op()?;
            let span = info_span!(
                "batch.flush",
                location = %state.location(),
                partition = %session.partition,
                operations = ops.len()
            );
            state.commit(&session.partition, &ops).instrument(span).await?;

            if let Some(core) = self.inner.lock_slot().core.as_mut() {
                core.settle(watermark);
            }
        }

        if self.inner.options.auto_destroy {
            self.destroy();
        }
        Ok(())
    }

    /// Start a flush without waiting for it.
    ///
    /// Unlike [`Batch::flush`], a failure is not returned to the caller: it
    /// is logged at WARN. Await the handle to know when the flush finished.
    /// Must be called from within a tokio runtime.
    pub fn try_flush(&self) -> JoinHandle<()> {
        let batch = self.clone();
        tokio::spawn(async move {
            if let Err(err) = batch.flush().await {
                event!(Level::WARN, error = %err, "background flush failed");
            }
        })
    }

    /// Drop the buffer and the session reference and return the buffer to
    /// the pool. Idempotent.
    pub fn destroy(&self) {
        self.inner.destroy();
    }
}

impl BatchInner {
    fn lock_slot(&self) -> MutexGuard<'_, BatchSlot> {
        // Slot updates are single assignments; poisoning cannot tear them.
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn destroy(&self) {
        let (session, core) = {
            let mut slot = self.lock_slot();
            (slot.session.take(), slot.core.take())
        };
        if let (Some(session), Some(core)) = (session, core) {
            session.state().recycle_core(self.kind, core);
        }
    }
}

impl Drop for BatchInner {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for Batch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batch")
            .field("kind", &self.inner.kind)
            .field("len", &self.len())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

/// An encoded mutation, checked against capacity before it is buffered.
enum Mutation {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
    Range(KeyRange),
}

fn destroyed() -> DbError {
    DbError::Closed("batch".into())
}
