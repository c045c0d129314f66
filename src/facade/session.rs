use crate::connection::{CloseOptions, SessionId, SessionStatus, State};
use crate::core::{DbError, Encoding, RangeOptions, Result};
use crate::iterator::RangeIterator;
use crate::transaction::snapshot::{Snapshot, SnapshotData, SnapshotId};
use crate::transaction::{Batch, BatchKind, BatchOptions};
use std::sync::Arc;
use tracing::{Level, event};

/// Options for forking a child session with [`Session::session`].
///
/// Unset fields are inherited from the parent. A child on the parent's
/// partition also inherits the parent's snapshot unless `live` is set or
/// another snapshot is given.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions<'a> {
    pub partition: Option<String>,
    pub snapshot: Option<&'a Snapshot>,
    pub live: bool,
    pub key_encoding: Option<Encoding>,
    pub value_encoding: Option<Encoding>,
}

impl<'a> SessionOptions<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn partition(mut self, partition: &str) -> Self {
        self.partition = Some(partition.to_string());
        self
    }

    /// Bind the child to `snapshot`.
    pub fn snapshot(mut self, snapshot: &'a Snapshot) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    /// Read live data even when the parent is snapshot-bound.
    pub fn live(mut self) -> Self {
        self.live = true;
        self
    }

    pub fn key_encoding(mut self, encoding: Encoding) -> Self {
        self.key_encoding = Some(encoding);
        self
    }

    pub fn value_encoding(mut self, encoding: Encoding) -> Self {
        self.value_encoding = Some(encoding);
        self
    }
}

/// Snapshot of the two Handles counters of a State.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleCounts {
    /// Substrate transactions in flight
    pub io: usize,
    /// Caller operations in flight
    pub refs: usize,
}

/// A view onto one location, bound to one partition, optionally one
/// snapshot, and a pair of key/value encodings.
///
/// Root sessions come from [`ConnectionRegistry::session`] and control the
/// location's lifecycle; children forked with [`Session::session`] share
/// the same State. Cloning a `Session` yields another handle to the same
/// session.
///
/// [`ConnectionRegistry::session`]: crate::ConnectionRegistry::session
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

pub(crate) struct SessionInner {
    state: Arc<State>,
    id: SessionId,
    pub(crate) partition: String,
    pub(crate) key_encoding: Encoding,
    pub(crate) value_encoding: Encoding,
    /// Read view; the counted reference lives in the State's session arena.
    pub(crate) snapshot: Option<Arc<SnapshotData>>,
    root: bool,
}

impl SessionInner {
    pub(crate) fn state(&self) -> &Arc<State> {
        &self.state
    }

    pub(crate) fn ensure_attached(&self) -> Result<()> {
        if self.state.has_session(self.id) {
            Ok(())
        } else {
            Err(DbError::Closed(format!(
                "session on '{}'",
                self.state.location()
            )))
        }
    }

    /// Committed value of an encoded key as this session sees it.
    pub(crate) async fn read_committed(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match &self.snapshot {
            Some(data) => self.state.snapshot_get(data, key).await,
            None => self.state.live_get(&self.partition, key).await,
        }
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.state.detach_session(self.id);
    }
}

impl Session {
    pub(crate) fn root(state: Arc<State>) -> Result<Self> {
        let id = state.attach_session(None)?;
        let options = state.options();
        let inner = SessionInner {
            partition: options.partition.clone(),
            key_encoding: options.key_encoding,
            value_encoding: options.value_encoding,
            snapshot: None,
            root: true,
            id,
            state,
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Open the location. Concurrent and repeated calls share one attempt.
    pub async fn open(&self) -> Result<()> {
        self.inner.ensure_attached()?;
        self.inner.state.open().await
    }

    /// Close gracefully. On a root session this closes the location and
    /// every session on it; on a child it detaches only the child.
    pub async fn close(&self) {
        self.close_with(CloseOptions::default()).await
    }

    pub async fn close_with(&self, options: CloseOptions) {
        if self.inner.root {
            self.inner.state.close(options).await;
        } else {
            self.inner.state.detach_session(self.inner.id);
            event!(Level::DEBUG, session = self.inner.id, "child session closed");
        }
    }

    /// Drain in-flight I/O and release the connection. Root sessions only.
    pub async fn suspend(&self) -> Result<()> {
        self.require_root("suspend")?;
        self.inner.state.suspend().await
    }

    /// Reconnect after [`Session::suspend`]. Root sessions only.
    pub async fn resume(&self) -> Result<()> {
        self.require_root("resume")?;
        self.inner.state.resume().await
    }

    fn require_root(&self, operation: &str) -> Result<()> {
        if self.inner.root {
            Ok(())
        } else {
            Err(DbError::InvalidArgument(format!(
                "{} is only available on a root session",
                operation
            )))
        }
    }

    // ------------------------------------------------------------------------
    // Forking
    // ------------------------------------------------------------------------

    /// Fork a child session sharing this session's State.
    pub async fn session(&self, options: SessionOptions<'_>) -> Result<Session> {
        self.inner.ensure_attached()?;
        let state = &self.inner.state;
        let _op = state.begin_op()?;

        let partition = options
            .partition
            .clone()
            .unwrap_or_else(|| self.inner.partition.clone());
        if let Some(snapshot) = options.snapshot {
            if snapshot.partition() != partition {
                return Err(DbError::InvalidArgument(format!(
                    "snapshot of partition '{}' cannot bind a session on '{}'",
                    snapshot.partition(),
                    partition
                )));
            }
        }
        if partition != self.inner.partition {
            state.ensure_partition(&partition).await?;
        }

        let handle = match (options.snapshot, &self.inner.snapshot) {
            (Some(snapshot), _) => Some(snapshot.retain()?),
            (None, Some(data)) if !options.live && partition == self.inner.partition => {
                Some(Snapshot::share(data, Arc::downgrade(state))?)
            }
            _ => None,
        };
        let snapshot = handle.as_ref().map(|s| Arc::clone(s.data()));
        let id = state.attach_session(handle)?;

        let inner = SessionInner {
            state: Arc::clone(state),
            id,
            partition,
            key_encoding: options.key_encoding.unwrap_or(self.inner.key_encoding),
            value_encoding: options.value_encoding.unwrap_or(self.inner.value_encoding),
            snapshot,
            root: false,
        };
        event!(
            Level::DEBUG,
            session = id,
            partition = %inner.partition,
            snapshot = ?inner.snapshot.as_ref().map(|d| d.id()),
            "child session created"
        );
        Ok(Session {
            inner: Arc::new(inner),
        })
    }

    // ------------------------------------------------------------------------
    // Batches
    // ------------------------------------------------------------------------

    pub fn read(&self, options: BatchOptions) -> Result<Batch> {
        Batch::new(Arc::clone(&self.inner), BatchKind::Read, options)
    }

    pub fn write(&self, options: BatchOptions) -> Result<Batch> {
        Batch::new(Arc::clone(&self.inner), BatchKind::Write, options)
    }

    pub async fn get(&self, key: impl AsRef<[u8]>) -> Result<Option<Vec<u8>>> {
        let batch = self.read(BatchOptions::single())?;
        let value = batch.get(key).await;
        batch.destroy();
        value
    }

    pub async fn put(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Result<()> {
        let batch = self.write(BatchOptions::single())?;
        batch.put(key, value)?;
        batch.flush().await
    }

    pub async fn delete(&self, key: impl AsRef<[u8]>) -> Result<()> {
        let batch = self.write(BatchOptions::single())?;
        batch.delete(key)?;
        batch.flush().await
    }

    /// Delete every key in `[start, end)`.
    pub async fn delete_range(&self, start: impl AsRef<[u8]>, end: impl AsRef<[u8]>) -> Result<()> {
        let batch = self.write(BatchOptions::single())?;
        batch.delete_range(start, end)?;
        batch.flush().await
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    pub fn iterator(&self, options: RangeOptions) -> Result<RangeIterator> {
        RangeIterator::new(Arc::clone(&self.inner), options)
    }

    /// Create a snapshot of this session's partition. The snapshot reads
    /// with this session's key and value encodings.
    pub async fn snapshot(&self) -> Result<Snapshot> {
        self.inner.ensure_attached()?;
        let state = &self.inner.state;
        let _op = state.begin_op()?;
        let snapshot = state.create_snapshot(&self.inner.partition).await?;
        Ok(snapshot.with_encodings(self.inner.key_encoding, self.inner.value_encoding))
    }

    // ------------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------------

    pub fn status(&self) -> SessionStatus {
        self.inner.state.session_status(self.inner.id)
    }

    pub fn is_root(&self) -> bool {
        self.inner.root
    }

    pub fn partition(&self) -> &str {
        &self.inner.partition
    }

    pub fn location(&self) -> &str {
        self.inner.state.location()
    }

    pub fn key_encoding(&self) -> Encoding {
        self.inner.key_encoding
    }

    pub fn value_encoding(&self) -> Encoding {
        self.inner.value_encoding
    }

    /// Id of the snapshot this session reads through, if any.
    pub fn snapshot_id(&self) -> Option<SnapshotId> {
        self.inner.snapshot.as_ref().map(|data| data.id())
    }

    pub fn handles(&self) -> HandleCounts {
        HandleCounts {
            io: self.inner.state.io_handles().count(),
            refs: self.inner.state.ref_handles().count(),
        }
    }

    pub fn state(&self) -> Arc<State> {
        Arc::clone(&self.inner.state)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("location", &self.location())
            .field("partition", &self.inner.partition)
            .field("root", &self.inner.root)
            .field("status", &self.status())
            .finish()
    }
}
