// ============================================================================
// Range Iterators
// ============================================================================
//
// Lazy, ordered, finite sequence over a key range of one session. Entries
// are fetched in windows of `iterator_high_water` entries; a snapshot-bound
// session merges its snapshot overlay into each window so the iterator sees
// the partition as it was when the snapshot was taken.
//
// Uncommitted batch buffers are never visible to iterators.
//
// Advances are serialized per iterator. Destroying an iterator resolves any
// advance in flight to "ended".
//
// ============================================================================

use crate::core::{DbError, Entry, KeyRange, RangeOptions, Result};
use crate::facade::session::SessionInner;
use futures::Stream;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Iterator over a key range.
///
/// Cloning yields another handle to the same iterator; advances through any
/// handle share one position.
#[derive(Clone)]
pub struct RangeIterator {
    inner: Arc<IteratorInner>,
}

struct IteratorInner {
    session: Mutex<Option<Arc<SessionInner>>>,
    reverse: bool,
    limit: Option<usize>,
    high_water: usize,
    cursor: tokio::sync::Mutex<CursorState>,
    destroyed: AtomicBool,
    destroyed_notify: Notify,
}

struct CursorState {
    /// Part of the range not fetched yet.
    remaining: KeyRange,
    buffer: VecDeque<Entry>,
    /// Nothing left to fetch.
    exhausted: bool,
    /// Sequence finished; never restarts.
    ended: bool,
    yielded: usize,
}

impl RangeIterator {
    pub(crate) fn new(session: Arc<SessionInner>, options: RangeOptions) -> Result<Self> {
        session.ensure_attached()?;
        let range = options.resolve(session.key_encoding)?;
        let high_water = session.state().options().iterator_high_water.max(1);
        let exhausted = range.is_empty() || options.limit == Some(0);

        Ok(Self {
            inner: Arc::new(IteratorInner {
                session: Mutex::new(Some(session)),
                reverse: options.reverse,
                limit: options.limit,
                high_water,
                cursor: tokio::sync::Mutex::new(CursorState {
                    remaining: range,
                    buffer: VecDeque::new(),
                    exhausted,
                    ended: false,
                    yielded: 0,
                }),
                destroyed: AtomicBool::new(false),
                destroyed_notify: Notify::new(),
            }),
        })
    }

    /// Next entry, or `None` once the sequence has ended or the iterator was
    /// destroyed.
    pub async fn next(&self) -> Result<Option<Entry>> {
        let destroyed = self.inner.destroyed_notify.notified();
        tokio::pin!(destroyed);
        destroyed.as_mut().enable();
        if self.inner.is_destroyed() {
            return Ok(None);
        }

        tokio::select! {
            biased;
            _ = &mut destroyed => Ok(None),
            entry = self.inner.advance() => entry,
        }
    }

    /// Up to `n` entries; fewer only when the sequence ends.
    pub async fn next_batch(&self, n: usize) -> Result<Vec<Entry>> {
        let mut entries = Vec::with_capacity(n.min(self.inner.high_water));
        while entries.len() < n {
            match self.next().await? {
                Some(entry) => entries.push(entry),
                None => break,
            }
        }
        Ok(entries)
    }

    /// Drain the rest of the sequence.
    pub async fn all(&self) -> Result<Vec<Entry>> {
        let mut entries = Vec::new();
        while let Some(entry) = self.next().await? {
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Consume the iterator as a stream of entries.
    pub fn into_stream(self) -> impl Stream<Item = Result<Entry>> {
        futures::stream::unfold(Some(self), |iterator| async move {
            let iterator = iterator?;
            match iterator.next().await {
                Ok(Some(entry)) => Some((Ok(entry), Some(iterator))),
                Ok(None) => None,
                Err(err) => Some((Err(err), None)),
            }
        })
    }

    /// Release the buffered window and the session reference. Idempotent;
    /// an advance in flight resolves to `None`.
    pub fn destroy(&self) {
        self.inner.destroy();
    }

    /// Alias of [`RangeIterator::destroy`].
    pub fn close(&self) {
        self.destroy();
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.is_destroyed()
    }

    /// True once the sequence has ended or the iterator was destroyed.
    pub fn is_ended(&self) -> bool {
        if self.inner.is_destroyed() {
            return true;
        }
        match self.inner.cursor.try_lock() {
            Ok(cursor) => cursor.ended,
            Err(_) => false,
        }
    }
}

impl IteratorInner {
    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn session(&self) -> Result<Arc<SessionInner>> {
        self.session
            .lock()?
            .clone()
            .ok_or_else(|| DbError::Closed("iterator".into()))
    }

    async fn advance(&self) -> Result<Option<Entry>> {
        let mut cursor = self.cursor.lock().await;
        loop {
            if self.is_destroyed() || cursor.ended {
                return Ok(None);
            }
            if self.limit.is_some_and(|limit| cursor.yielded >= limit) {
                cursor.finish();
                return Ok(None);
            }

            // The session slot only empties on destroy.
            let Ok(session) = self.session() else {
                return Ok(None);
            };
            session.ensure_attached()?;

            if let Some((key, value)) = cursor.buffer.pop_front() {
                cursor.yielded += 1;
                let key = session.key_encoding.decode(&key)?;
                let value = session.value_encoding.decode(&value)?;
                return Ok(Some((key, value)));
            }
            if cursor.exhausted {
                cursor.finish();
                return Ok(None);
            }

            let want = match self.limit {
                Some(limit) => self.high_water.min(limit - cursor.yielded),
                None => self.high_water,
            };
            let state = session.state();
            let _op = state.begin_op()?;
            let window = state
                .read_window(
                    &session.partition,
                    session.snapshot.as_deref(),
                    &cursor.remaining,
                    self.reverse,
                    want,
                )
                .await?;

            match window.boundary {
                Some(last) => cursor.remaining = cursor.remaining.after(&last, self.reverse),
                None => cursor.exhausted = true,
            }
            cursor.buffer.extend(window.entries);
        }
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.destroyed_notify.notify_waiters();
        let session = match self.session.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(session);
        if let Ok(mut cursor) = self.cursor.try_lock() {
            cursor.finish();
        }
    }
}

impl CursorState {
    fn finish(&mut self) {
        self.ended = true;
        self.exhausted = true;
        self.buffer.clear();
    }
}

impl std::fmt::Debug for RangeIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangeIterator")
            .field("reverse", &self.inner.reverse)
            .field("limit", &self.inner.limit)
            .field("destroyed", &self.inner.is_destroyed())
            .finish()
    }
}
