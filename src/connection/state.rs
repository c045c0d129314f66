// ============================================================================
// Per-location State
// ============================================================================
//
// One State exists per storage location. It owns the substrate connection,
// the lifecycle, the partition registry, the session arena, the batch pools,
// the active-snapshot registry and the two Handles counters:
//
// - `io`   counts substrate transactions in flight
// - `refs` counts caller operations in flight
//
// Lifecycle:
// ```text
// New ──open──> Opening ──> Open ⇄ Suspending/Suspended
//                            │  ⇅ Upgrading
//                            └──────────> Closing ──> Closed
// ```
// `Closed` is terminal and reachable from every other state.
//
// ============================================================================

use super::config::DbOptions;
use super::handles::{HandleGuard, Handles};
use super::registry::StateMap;
use crate::core::{DbError, Entry, KeyRange, Result};
use crate::storage::{
    Direction, PartitionCatalog, Substrate, SubstrateConnection, SubstrateTransaction,
    TransactionMode,
};
use crate::transaction::batch::BatchKind;
use crate::transaction::change::{BatchCore, PendingOp, PendingOps};
use crate::transaction::snapshot::{Snapshot, SnapshotData, SnapshotId};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::{RwLock, oneshot, watch};
use tracing::{Instrument, Level, event, info_span};
use uuid::Uuid;

pub type SessionId = u64;

type OpenAttempt = Shared<BoxFuture<'static, Result<()>>>;

/// Grant handed to a flush queued during suspension; dropping the inner
/// sender tells `resume` the flush has settled.
pub(super) type FlushGrant = oneshot::Sender<oneshot::Sender<()>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    New,
    Opening,
    Open,
    Upgrading,
    Suspending,
    Suspended,
    Closing,
    Closed,
}

impl Lifecycle {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Lifecycle::Closing | Lifecycle::Closed)
    }
}

/// Session state derived from the State lifecycle and the session's slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Opening,
    Open,
    Suspended,
    Closing,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionDescriptor {
    pub name: String,
    /// False while the partition is a placeholder awaiting creation.
    pub created: bool,
}

/// Session arena entry. The slot owns the session's snapshot reference.
pub(crate) struct SessionSlot {
    pub(crate) id: SessionId,
    pub(crate) snapshot: Option<Snapshot>,
}

pub(super) struct StateInner {
    pub(super) lifecycle: Lifecycle,
    pub(super) connection: Option<Arc<dyn SubstrateConnection>>,
    /// Substrate generation observed at our last open or suspension.
    pub(super) generation: u64,
    pub(super) schema_version: u32,
    pub(super) partitions: BTreeMap<String, PartitionDescriptor>,
    pub(super) sessions: Vec<SessionSlot>,
    pub(super) read_pool: Vec<BatchCore>,
    pub(super) write_pool: Vec<BatchCore>,
    pub(super) snapshots: HashMap<SnapshotId, Arc<SnapshotData>>,
    pub(super) flush_queue: VecDeque<FlushGrant>,
}

pub struct State {
    pub(super) location: String,
    pub(super) instance: Uuid,
    pub(super) options: DbOptions,
    pub(super) substrate: Arc<dyn Substrate>,
    pub(super) registry: Weak<StateMap>,
    pub(super) inner: Mutex<StateInner>,
    pub(super) lifecycle_tx: watch::Sender<Lifecycle>,
    opening: Mutex<Option<OpenAttempt>>,
    /// Serializes schema upgrades and resumes.
    pub(super) schema_lock: tokio::sync::Mutex<()>,
    /// Held exclusively by a flush from snapshot capture to commit.
    commit_gate: RwLock<()>,
    pub(super) io: Arc<Handles>,
    pub(super) refs: Arc<Handles>,
    next_id: AtomicU64,
}

impl State {
    pub(crate) fn new(
        location: &str,
        options: DbOptions,
        substrate: Arc<dyn Substrate>,
        registry: Weak<StateMap>,
    ) -> Self {
        let mut partitions = BTreeMap::new();
        partitions.insert(
            options.partition.clone(),
            PartitionDescriptor {
                name: options.partition.clone(),
                created: false,
            },
        );
        let (lifecycle_tx, _) = watch::channel(Lifecycle::New);

        Self {
            location: location.to_string(),
            instance: Uuid::new_v4(),
            options,
            substrate,
            registry,
            inner: Mutex::new(StateInner {
                lifecycle: Lifecycle::New,
                connection: None,
                generation: 0,
                schema_version: 0,
                partitions,
                sessions: Vec::new(),
                read_pool: Vec::new(),
                write_pool: Vec::new(),
                snapshots: HashMap::new(),
                flush_queue: VecDeque::new(),
            }),
            lifecycle_tx,
            opening: Mutex::new(None),
            schema_lock: tokio::sync::Mutex::new(()),
            commit_gate: RwLock::new(()),
            io: Arc::new(Handles::new()),
            refs: Arc::new(Handles::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn instance(&self) -> Uuid {
        self.instance
    }

    pub fn options(&self) -> &DbOptions {
        &self.options
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lock_inner().lifecycle
    }

    pub fn session_count(&self) -> usize {
        self.lock_inner().sessions.len()
    }

    pub fn snapshot_count(&self) -> usize {
        self.lock_inner().snapshots.len()
    }

    pub fn pooled_batches(&self, kind: BatchKind) -> usize {
        let inner = self.lock_inner();
        match kind {
            BatchKind::Read => inner.read_pool.len(),
            BatchKind::Write => inner.write_pool.len(),
        }
    }

    pub fn partitions(&self) -> Vec<PartitionDescriptor> {
        self.lock_inner().partitions.values().cloned().collect()
    }

    /// Substrate transactions in flight.
    pub fn io_handles(&self) -> &Handles {
        &self.io
    }

    /// Caller operations in flight.
    pub fn ref_handles(&self) -> &Handles {
        &self.refs
    }

    pub(super) fn lock_inner(&self) -> MutexGuard<'_, StateInner> {
        // Every mutation of StateInner completes without awaiting; a poisoned
        // lock still holds consistent data.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(super) fn set_lifecycle(&self, inner: &mut StateInner, next: Lifecycle) {
        inner.lifecycle = next;
        self.lifecycle_tx.send_replace(next);
    }

    pub(super) fn closed_error(&self) -> DbError {
        DbError::Closed(format!("database '{}'", self.location))
    }

    fn not_open_error(&self) -> DbError {
        DbError::NotOpen(format!("database '{}'", self.location))
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    // ------------------------------------------------------------------------
    // Open
    // ------------------------------------------------------------------------

    /// Open the substrate connection.
    ///
    /// Idempotent: concurrent callers await one shared attempt and observe
    /// the same outcome.
    pub async fn open(self: &Arc<Self>) -> Result<()> {
        let attempt = {
            let mut slot = self.opening.lock()?;
            match self.lock_inner().lifecycle {
                Lifecycle::Open
                | Lifecycle::Upgrading
                | Lifecycle::Suspending
                | Lifecycle::Suspended => return Ok(()),
                Lifecycle::Closing | Lifecycle::Closed => return Err(self.closed_error()),
                Lifecycle::New | Lifecycle::Opening => {}
            }
            match slot.as_ref() {
                Some(attempt) => attempt.clone(),
                None => {
                    let this = Arc::clone(self);
                    let attempt = async move { this.open_attempt().await }.boxed().shared();
                    *slot = Some(attempt.clone());
                    attempt
                }
            }
        };

        let result = attempt.clone().await;

        if let Ok(mut slot) = self.opening.lock() {
            if slot.as_ref().is_some_and(|current| current.ptr_eq(&attempt)) {
                *slot = None;
            }
        }
        result
    }

    async fn open_attempt(self: Arc<Self>) -> Result<()> {
        let span = info_span!(
            "state.open",
            location = %self.location,
            instance = %self.instance
        );
        async {
            {
                let mut inner = self.lock_inner();
                if inner.lifecycle.is_terminal() {
                    return Err(self.closed_error());
                }
                self.set_lifecycle(&mut inner, Lifecycle::Opening);
            }

            if let Some(policy) = &self.options.filter_policy {
                event!(Level::DEBUG, ?policy, "filter policy accepted; it has no effect");
            }

            match self.connect().await {
                Ok((connection, generation)) => {
                    if let Some(rejected) = self.adopt(Lifecycle::Opening, connection, generation) {
                        self.release_connection(rejected, "open raced close").await;
                        return Err(self.closed_error());
                    }
                    event!(Level::INFO, generation, "database opened");
                    Ok(())
                }
                Err(err) => {
                    let mut inner = self.lock_inner();
                    if inner.lifecycle == Lifecycle::Opening {
                        self.set_lifecycle(&mut inner, Lifecycle::New);
                    }
                    event!(Level::ERROR, error = %err, "database open failed");
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Open a connection that carries every registered partition, moving the
    /// schema version forward when some are missing.
    pub(super) async fn connect(&self) -> Result<(Arc<dyn SubstrateConnection>, u64)> {
        let (wanted, known_version) = {
            let inner = self.lock_inner();
            let wanted: Vec<String> = inner.partitions.keys().cloned().collect();
            (wanted, inner.schema_version)
        };
        // Upgrades performed by this State move the floor above the configured version.
        let requested = self.options.schema_version.map(|v| v.max(known_version));
        let mut create = |catalog: &mut dyn PartitionCatalog, _previous: u32| -> Result<()> {
            for name in &wanted {
                catalog.create_partition(name)?;
            }
            Ok(())
        };

        let connection = self
            .substrate
            .open_connection(&self.location, requested, &mut create)
            .await
            .map_err(|e| e.during("open"))?;

        let existing = connection.partition_names();
        let missing = wanted.iter().filter(|name| !existing.contains(name)).count();
        let connection = if missing == 0 {
            connection
        } else {
            let next_version = connection.schema_version() + 1;
            event!(
                Level::INFO,
                missing,
                next_version,
                "creating missing partitions through schema upgrade"
            );
            self.release_connection(connection, "schema upgrade").await;
            self.substrate
                .open_connection(&self.location, Some(next_version), &mut create)
                .await
                .map_err(|e| e.during("upgrade"))?
        };

        let generation = self.substrate.generation(&self.location).await;
        Ok((connection, generation))
    }

    pub(super) fn install_connection(
        &self,
        inner: &mut StateInner,
        connection: Arc<dyn SubstrateConnection>,
        generation: u64,
    ) {
        let existing = connection.partition_names();
        for descriptor in inner.partitions.values_mut() {
            descriptor.created = existing.contains(&descriptor.name);
        }
        inner.schema_version = connection.schema_version();
        inner.connection = Some(connection);
        inner.generation = generation;
    }

    /// Close a connection; failures are logged and suppressed.
    pub(super) async fn release_connection(
        &self,
        connection: Arc<dyn SubstrateConnection>,
        reason: &str,
    ) {
        if let Err(err) = connection.close().await {
            event!(Level::WARN, error = %err, reason, "closing substrate connection failed");
        }
    }

    // ------------------------------------------------------------------------
    // Partitions
    // ------------------------------------------------------------------------

    /// Get-or-create a partition by name.
    ///
    /// Unknown names are registered as placeholders. When the database is
    /// open the connection is drained and reopened with a schema upgrade that
    /// creates them; otherwise creation happens at the next open or resume.
    pub(crate) async fn ensure_partition(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(DbError::InvalidArgument("partition name must not be empty".into()));
        }
        if !self.register_partition(name)? {
            return Ok(());
        }

        let _schema = self.schema_lock.lock().await;
        {
            let mut inner = self.lock_inner();
            let created = inner.partitions.get(name).is_some_and(|p| p.created);
            if created || inner.lifecycle != Lifecycle::Open {
                return Ok(());
            }
            self.set_lifecycle(&mut inner, Lifecycle::Upgrading);
        }

        let span = info_span!("state.upgrade", location = %self.location, partition = %name);
        async {
            self.io.idle().await;

            let previous = self.lock_inner().connection.take();
            if let Some(connection) = previous {
                self.release_connection(connection, "schema upgrade").await;
            }

            let err = match self.connect().await {
                Ok(opened) => return self.finish_upgrade(opened).await,
                Err(err) => err,
            };

            event!(Level::ERROR, error = %err, "partition creation failed; reopening");
            self.lock_inner().partitions.remove(name);
            match self.connect().await {
                Ok(opened) => {
                    self.finish_upgrade(opened).await?;
                    Err(err)
                }
                Err(reopen_err) => {
                    let mut inner = self.lock_inner();
                    if inner.lifecycle == Lifecycle::Upgrading {
                        self.set_lifecycle(&mut inner, Lifecycle::New);
                    }
                    Err(reopen_err)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn finish_upgrade(&self, opened: (Arc<dyn SubstrateConnection>, u64)) -> Result<()> {
        let (connection, generation) = opened;
        if let Some(rejected) = self.adopt(Lifecycle::Upgrading, connection, generation) {
            self.release_connection(rejected, "upgrade raced close").await;
            return Err(self.closed_error());
        }
        event!(Level::INFO, generation, "schema upgraded");
        Ok(())
    }

    /// Install `connection` and move to `Open` if the lifecycle is still
    /// `expected`. Otherwise the connection is handed back for release.
    fn adopt(
        &self,
        expected: Lifecycle,
        connection: Arc<dyn SubstrateConnection>,
        generation: u64,
    ) -> Option<Arc<dyn SubstrateConnection>> {
        let mut inner = self.lock_inner();
        if inner.lifecycle != expected {
            return Some(connection);
        }
        self.install_connection(&mut inner, connection, generation);
        self.set_lifecycle(&mut inner, Lifecycle::Open);
        None
    }

    /// Register a placeholder; true when the partition still needs creating.
    fn register_partition(&self, name: &str) -> Result<bool> {
        let mut inner = self.inner.lock()?;
        if inner.lifecycle.is_terminal() {
            return Err(self.closed_error());
        }
        let descriptor = inner
            .partitions
            .entry(name.to_string())
            .or_insert_with(|| PartitionDescriptor {
                name: name.to_string(),
                created: false,
            });
        Ok(!descriptor.created)
    }

    // ------------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------------

    pub(crate) fn attach_session(&self, snapshot: Option<Snapshot>) -> Result<SessionId> {
        let rejected = {
            let mut inner = self.lock_inner();
            if inner.lifecycle.is_terminal() {
                snapshot
            } else {
                let id = self.next_id();
                inner.sessions.push(SessionSlot { id, snapshot });
                return Ok(id);
            }
        };
        // Released outside the lock: dropping a snapshot handle may unregister it.
        drop(rejected);
        Err(self.closed_error())
    }

    /// Remove a session from the arena. Safe to call repeatedly.
    pub(crate) fn detach_session(&self, id: SessionId) {
        let slot = {
            let mut inner = self.lock_inner();
            inner
                .sessions
                .iter()
                .position(|slot| slot.id == id)
                .map(|index| inner.sessions.remove(index))
        };
        // Released outside the lock: dropping the slot may unregister a snapshot.
        drop(slot);
    }

    pub(crate) fn has_session(&self, id: SessionId) -> bool {
        self.lock_inner().sessions.iter().any(|slot| slot.id == id)
    }

    pub(crate) fn session_status(&self, id: SessionId) -> SessionStatus {
        let inner = self.lock_inner();
        if !inner.sessions.iter().any(|slot| slot.id == id) {
            return SessionStatus::Closed;
        }
        match inner.lifecycle {
            Lifecycle::New | Lifecycle::Opening => SessionStatus::Opening,
            Lifecycle::Open | Lifecycle::Upgrading => SessionStatus::Open,
            Lifecycle::Suspending | Lifecycle::Suspended => SessionStatus::Suspended,
            Lifecycle::Closing => SessionStatus::Closing,
            Lifecycle::Closed => SessionStatus::Closed,
        }
    }

    /// Mark the start of a caller operation; the guard ends it.
    pub(crate) fn begin_op(&self) -> Result<HandleGuard> {
        let inner = self.lock_inner();
        if inner.lifecycle.is_terminal() {
            return Err(self.closed_error());
        }
        Ok(self.refs.enter())
    }

    // ------------------------------------------------------------------------
    // Batch pools
    // ------------------------------------------------------------------------

    pub(crate) fn checkout_core(&self, kind: BatchKind) -> Result<BatchCore> {
        let mut inner = self.lock_inner();
        if inner.lifecycle.is_terminal() {
            return Err(self.closed_error());
        }
        let pool = match kind {
            BatchKind::Read => &mut inner.read_pool,
            BatchKind::Write => &mut inner.write_pool,
        };
        Ok(match pool.pop() {
            Some(mut core) => {
                core.mark_recycled();
                core
            }
            None => BatchCore::new(),
        })
    }

    /// Return a batch buffer to its pool, fully reset.
    pub(crate) fn recycle_core(&self, kind: BatchKind, mut core: BatchCore) {
        core.reset();
        let limit = self.options.batch_pool_size;
        let mut inner = self.lock_inner();
        if inner.lifecycle.is_terminal() {
            return;
        }
        let pool = match kind {
            BatchKind::Read => &mut inner.read_pool,
            BatchKind::Write => &mut inner.write_pool,
        };
        if pool.len() < limit {
            pool.push(core);
        }
    }

    // ------------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------------

    pub(crate) async fn create_snapshot(self: &Arc<Self>, partition: &str) -> Result<Snapshot> {
        let _gate = self.commit_gate.read().await;
        let data = {
            let mut inner = self.inner.lock()?;
            match inner.lifecycle {
                Lifecycle::Closing | Lifecycle::Closed => return Err(self.closed_error()),
                Lifecycle::New | Lifecycle::Opening => return Err(self.not_open_error()),
                _ => {}
            }
            if !inner.partitions.contains_key(partition) {
                return Err(DbError::PartitionNotFound(partition.to_string()));
            }
            let data = Arc::new(SnapshotData::new(self.next_id(), partition));
            inner.snapshots.insert(data.id(), Arc::clone(&data));
            data
        };
        data.mark_initialized();
        event!(Level::DEBUG, snapshot = data.id(), partition, "snapshot created");
        Ok(Snapshot::new(data, Arc::downgrade(self)))
    }

    pub(crate) fn unregister_snapshot(&self, id: SnapshotId) {
        self.lock_inner().snapshots.remove(&id);
    }

    fn snapshots_for(&self, partition: &str) -> Vec<Arc<SnapshotData>> {
        self.lock_inner()
            .snapshots
            .values()
            .filter(|data| data.partition() == partition)
            .cloned()
            .collect()
    }

    /// Value of `key` as of the snapshot's creation.
    pub(crate) async fn snapshot_get(&self, data: &SnapshotData, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if !data.is_live() {
            return Err(DbError::Closed(format!("snapshot {}", data.id())));
        }
        // Connection before gate: a suspended database must not pin the gate.
        let (connection, _io) = self.acquire().await?;
        let _gate = self.commit_gate.read().await;
        if let Some(recorded) = data.recorded(key) {
            return Ok(recorded);
        }
        self.read_with(connection, data.partition(), key).await
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    /// Wait for an open connection and count the caller as in-flight I/O.
    pub(crate) async fn acquire(&self) -> Result<(Arc<dyn SubstrateConnection>, HandleGuard)> {
        let mut changes = self.lifecycle_tx.subscribe();
        loop {
            {
                let inner = self.inner.lock()?;
                match inner.lifecycle {
                    Lifecycle::Open => {
                        let connection =
                            inner.connection.clone().ok_or_else(|| self.not_open_error())?;
                        return Ok((connection, self.io.enter()));
                    }
                    Lifecycle::Opening
                    | Lifecycle::Upgrading
                    | Lifecycle::Suspending
                    | Lifecycle::Suspended => {}
                    Lifecycle::New => return Err(self.not_open_error()),
                    Lifecycle::Closing | Lifecycle::Closed => return Err(self.closed_error()),
                }
            }
            changes.changed().await.map_err(|_| self.closed_error())?;
        }
    }

    pub(crate) async fn live_get(&self, partition: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let (connection, _io) = self.acquire().await?;
        self.read_with(connection, partition, key).await
    }

    /// Read up to `max` live entries of `range` in traversal order and, when
    /// a snapshot is given, merge its overlay over the covered span.
    ///
    /// The window's `boundary` is the last live key read when more may
    /// follow; `None` once the range is exhausted.
    pub(crate) async fn read_window(
        &self,
        partition: &str,
        snapshot: Option<&SnapshotData>,
        range: &KeyRange,
        reverse: bool,
        max: usize,
    ) -> Result<Window> {
        if range.is_empty() {
            return Ok(Window::default());
        }
        if snapshot.is_some_and(|data| !data.is_live()) {
            return Err(DbError::Closed("snapshot".into()));
        }
        let (connection, _io) = self.acquire().await?;
        let _gate = match snapshot {
            Some(_) => Some(self.commit_gate.read().await),
            None => None,
        };

        let scope = [partition.to_string()];
        let mut txn = connection
            .transaction(&scope, TransactionMode::ReadOnly)
            .await
            .map_err(|e| e.during("iterator"))?;
        let live = read_cursor(txn.as_mut(), partition, range, reverse, max).await;
        txn.abort().await;
        let live = live.map_err(|e| e.during("iterator"))?;

        let boundary = if live.len() == max {
            live.last().map(|(key, _)| key.clone())
        } else {
            None
        };

        let Some(data) = snapshot else {
            return Ok(Window {
                entries: live,
                boundary,
            });
        };

        let span = match &boundary {
            Some(last) => range.until(last, reverse),
            None => range.clone(),
        };
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = live.into_iter().collect();
        for (key, recorded) in data.overlay_range(&span) {
            match recorded {
                Some(value) => {
                    merged.insert(key, value);
                }
                None => {
                    merged.remove(&key);
                }
            }
        }
        let mut entries: Vec<Entry> = merged.into_iter().collect();
        if reverse {
            entries.reverse();
        }
        Ok(Window { entries, boundary })
    }

    /// Every entry of `range` as the snapshot sees it.
    pub(crate) async fn snapshot_scan(
        &self,
        data: &SnapshotData,
        range: &KeyRange,
    ) -> Result<Vec<Entry>> {
        let window_size = self.options.iterator_high_water;
        let mut entries = Vec::new();
        let mut remaining = range.clone();
        loop {
            let window = self
                .read_window(data.partition(), Some(data), &remaining, false, window_size)
                .await?;
            entries.extend(window.entries);
            match window.boundary {
                Some(last) => remaining = remaining.after(&last, false),
                None => return Ok(entries),
            }
        }
    }

    async fn read_with(
        &self,
        connection: Arc<dyn SubstrateConnection>,
        partition: &str,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        let scope = [partition.to_string()];
        let mut txn = connection
            .transaction(&scope, TransactionMode::ReadOnly)
            .await
            .map_err(|e| e.during("get"))?;
        let value = txn.get(partition, key).await.map_err(|e| e.during("get"));
        txn.abort().await;
        value
    }

    // ------------------------------------------------------------------------
    // Flush
    // ------------------------------------------------------------------------

    /// Apply `ops` to `partition` in one read-write transaction.
    ///
    /// Before each mutation the key's current value is recorded into every
    /// active snapshot of the partition that has not recorded it yet.
    pub(crate) async fn commit(&self, partition: &str, ops: &PendingOps) -> Result<()> {
        let (connection, _io, _settled) = self.flush_turn().await?;
        let _gate = self.commit_gate.write().await;

        let scope = [partition.to_string()];
        let mut txn = connection
            .transaction(&scope, TransactionMode::ReadWrite)
            .await
            .map_err(|e| e.during("flush"))?;

        let staged = self.stage(txn.as_mut(), partition, ops).await;
        match staged {
            Ok(()) => match txn.commit().await {
                Ok(()) => {
                    event!(Level::DEBUG, operations = ops.len(), "batch committed");
                    Ok(())
                }
                Err(err) => {
                    let err = err.during("flush");
                    event!(Level::ERROR, error = %err, "batch commit failed");
                    Err(err)
                }
            },
            Err(err) => {
                txn.abort().await;
                let err = err.during("flush");
                event!(Level::ERROR, error = %err, "batch staging failed; transaction aborted");
                Err(err)
            }
        }
    }

    /// Wait until a flush may run. While suspended, flushes queue in arrival
    /// order and are released one at a time by `resume`.
    async fn flush_turn(
        &self,
    ) -> Result<(Arc<dyn SubstrateConnection>, HandleGuard, Option<oneshot::Sender<()>>)> {
        let mut changes = self.lifecycle_tx.subscribe();
        loop {
            let queued = {
                let mut inner = self.inner.lock()?;
                match inner.lifecycle {
                    Lifecycle::Open => {
                        let connection =
                            inner.connection.clone().ok_or_else(|| self.not_open_error())?;
                        return Ok((connection, self.io.enter(), None));
                    }
                    Lifecycle::Suspending | Lifecycle::Suspended => {
                        let (grant_tx, grant_rx) = oneshot::channel();
                        inner.flush_queue.push_back(grant_tx);
                        event!(
                            Level::DEBUG,
                            queued = inner.flush_queue.len(),
                            "flush queued during suspension"
                        );
                        Some(grant_rx)
                    }
                    Lifecycle::Opening | Lifecycle::Upgrading => None,
                    Lifecycle::New => return Err(self.not_open_error()),
                    Lifecycle::Closing | Lifecycle::Closed => return Err(self.closed_error()),
                }
            };

            if let Some(grant_rx) = queued {
                let settled = grant_rx.await.map_err(|_| self.closed_error())?;
                let inner = self.inner.lock()?;
                if inner.lifecycle.is_terminal() {
                    return Err(self.closed_error());
                }
                let connection = inner.connection.clone().ok_or_else(|| self.closed_error())?;
                return Ok((connection, self.io.enter(), Some(settled)));
            }

            changes.changed().await.map_err(|_| self.closed_error())?;
        }
    }

    async fn stage(
        &self,
        txn: &mut dyn SubstrateTransaction,
        partition: &str,
        ops: &PendingOps,
    ) -> Result<()> {
        let snapshots = self.snapshots_for(partition);

        for range in ops.ranges() {
            if range.is_empty() {
                continue;
            }
            let mut doomed = Vec::new();
            {
                let mut cursor = txn.open_cursor(partition, range, Direction::Forward).await?;
                while let Some((key, _)) = cursor.next().await? {
                    doomed.push(key);
                }
            }
            for key in doomed {
                capture(txn, &snapshots, partition, &key).await?;
                txn.delete(partition, &key).await?;
            }
        }

        for (key, op) in ops.entries() {
            capture(txn, &snapshots, partition, key).await?;
            match op {
                PendingOp::Put(value) => txn.put(partition, key, value).await?,
                PendingOp::Delete => txn.delete(partition, key).await?,
            }
        }
        Ok(())
    }
}

/// One fetch of an iterator or snapshot scan.
#[derive(Debug, Default)]
pub(crate) struct Window {
    pub(crate) entries: Vec<Entry>,
    pub(crate) boundary: Option<Vec<u8>>,
}

async fn read_cursor(
    txn: &mut dyn SubstrateTransaction,
    partition: &str,
    range: &KeyRange,
    reverse: bool,
    max: usize,
) -> Result<Vec<Entry>> {
    let mut cursor = txn
        .open_cursor(partition, range, Direction::from_reverse(reverse))
        .await?;
    let mut entries = Vec::with_capacity(max.min(1024));
    while entries.len() < max {
        match cursor.next().await? {
            Some(entry) => entries.push(entry),
            None => break,
        }
    }
    Ok(entries)
}

/// Record `key`'s pre-mutation value into every snapshot that lacks it.
async fn capture(
    txn: &mut dyn SubstrateTransaction,
    snapshots: &[Arc<SnapshotData>],
    partition: &str,
    key: &[u8],
) -> Result<()> {
    let pending: Vec<&Arc<SnapshotData>> = snapshots
        .iter()
        .filter(|snapshot| !snapshot.has_recorded(key))
        .collect();
    if pending.is_empty() {
        return Ok(());
    }
    let previous = txn.get(partition, key).await?;
    for snapshot in pending {
        snapshot.record(key, previous.clone());
    }
    Ok(())
}

impl std::fmt::Debug for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("State")
            .field("location", &self.location)
            .field("instance", &self.instance)
            .field("lifecycle", &self.lifecycle())
            .finish()
    }
}
