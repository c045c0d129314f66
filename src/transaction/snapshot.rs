// ============================================================================
// Snapshots
// ============================================================================
//
// A snapshot is a point-in-time read view over one partition. Creation is
// O(1): nothing is copied. Instead every flush records a key's current value
// into each active snapshot of the partition right before it first mutates
// that key (copy on first write after snapshot). A recorded entry is never
// replaced, so it always holds the value from the snapshot's creation.
//
// Keys without a recorded entry have not been mutated since creation and are
// read from the live substrate.
//
// ============================================================================

use crate::connection::State;
use crate::core::{DbError, Encoding, Entry, KeyRange, RangeOptions, Result};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{Level, event};

pub type SnapshotId = u64;

/// Recorded pre-mutation value; `None` means the key was absent.
type Recorded = Option<Vec<u8>>;

pub struct SnapshotData {
    id: SnapshotId,
    partition: String,
    created_at: DateTime<Utc>,
    overlay: Mutex<BTreeMap<Vec<u8>, Recorded>>,
    refs: AtomicUsize,
    initialized: AtomicBool,
    retired: AtomicBool,
}

impl SnapshotData {
    pub(crate) fn new(id: SnapshotId, partition: &str) -> Self {
        Self {
            id,
            partition: partition.to_string(),
            created_at: Utc::now(),
            overlay: Mutex::new(BTreeMap::new()),
            refs: AtomicUsize::new(1),
            initialized: AtomicBool::new(false),
            retired: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> SnapshotId {
        self.id
    }

    pub fn partition(&self) -> &str {
        &self.partition
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub(crate) fn mark_initialized(&self) {
        self.initialized.store(true, Ordering::SeqCst);
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Still referenced and not torn down by a close.
    pub fn is_live(&self) -> bool {
        !self.retired.load(Ordering::SeqCst)
    }

    /// Record `key`'s pre-mutation value. The first recording wins.
    pub(crate) fn record(&self, key: &[u8], previous: Recorded) {
        if !self.is_live() {
            return;
        }
        self.lock_overlay().entry(key.to_vec()).or_insert(previous);
    }

    pub(crate) fn has_recorded(&self, key: &[u8]) -> bool {
        self.lock_overlay().contains_key(key)
    }

    /// `Some(value)` when `key` was recorded, `None` when it must be read live.
    pub(crate) fn recorded(&self, key: &[u8]) -> Option<Recorded> {
        self.lock_overlay().get(key).cloned()
    }

    /// Recorded entries inside `range`, in key order.
    pub(crate) fn overlay_range(&self, range: &KeyRange) -> Vec<(Vec<u8>, Recorded)> {
        if range.is_empty() {
            return Vec::new();
        }
        self.lock_overlay()
            .range::<[u8], _>(range.as_slices())
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    pub fn recorded_len(&self) -> usize {
        self.lock_overlay().len()
    }

    /// Release the overlay and refuse further recordings.
    pub(crate) fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
        self.lock_overlay().clear();
    }

    fn retain(&self) -> bool {
        let mut current = self.refs.load(Ordering::SeqCst);
        loop {
            if current == 0 || !self.is_live() {
                return false;
            }
            match self.refs.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Drop one reference; true when it was the last.
    fn release(&self) -> bool {
        self.refs.fetch_sub(1, Ordering::SeqCst) == 1
    }

    fn ref_count(&self) -> usize {
        self.refs.load(Ordering::SeqCst)
    }

    fn lock_overlay(&self) -> MutexGuard<'_, BTreeMap<Vec<u8>, Recorded>> {
        self.overlay.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for SnapshotData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotData")
            .field("id", &self.id)
            .field("partition", &self.partition)
            .field("refs", &self.ref_count())
            .field("recorded", &self.recorded_len())
            .finish()
    }
}

/// A counted reference to a snapshot.
///
/// Each handle owns one reference; [`Snapshot::retain`] adds one and
/// dropping (or [`Snapshot::release`]) gives it back. When the last
/// reference goes the overlay is released and the snapshot stops receiving
/// recordings.
///
/// Reads pass through the key/value encodings of the session that created
/// the snapshot, like every other session read.
pub struct Snapshot {
    data: Arc<SnapshotData>,
    state: Weak<State>,
    key_encoding: Encoding,
    value_encoding: Encoding,
}

impl Snapshot {
    /// A handle reading raw stored bytes until [`Snapshot::with_encodings`].
    pub(crate) fn new(data: Arc<SnapshotData>, state: Weak<State>) -> Self {
        Self {
            data,
            state,
            key_encoding: Encoding::Binary,
            value_encoding: Encoding::Binary,
        }
    }

    pub(crate) fn with_encodings(mut self, key: Encoding, value: Encoding) -> Self {
        self.key_encoding = key;
        self.value_encoding = value;
        self
    }

    pub fn id(&self) -> SnapshotId {
        self.data.id()
    }

    pub fn partition(&self) -> &str {
        self.data.partition()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.data.created_at()
    }

    pub fn ref_count(&self) -> usize {
        self.data.ref_count()
    }

    pub fn is_initialized(&self) -> bool {
        self.data.is_initialized()
    }

    /// Take another counted reference.
    pub fn retain(&self) -> Result<Snapshot> {
        Ok(Self::share(&self.data, self.state.clone())?
            .with_encodings(self.key_encoding, self.value_encoding))
    }

    pub(crate) fn share(data: &Arc<SnapshotData>, state: Weak<State>) -> Result<Snapshot> {
        if !data.retain() {
            return Err(DbError::Closed(format!("snapshot {}", data.id())));
        }
        Ok(Snapshot::new(Arc::clone(data), state))
    }

    pub fn key_encoding(&self) -> Encoding {
        self.key_encoding
    }

    pub fn value_encoding(&self) -> Encoding {
        self.value_encoding
    }

    /// Give this reference back. Same as dropping the handle.
    pub fn release(self) {}

    /// The value `key` held when the snapshot was created.
    pub async fn get_value(&self, key: impl AsRef<[u8]>) -> Result<Option<Vec<u8>>> {
        let encoded = self.key_encoding.encode(key.as_ref())?;
        let state = self.state()?;
        let _op = state.begin_op()?;
        state
            .snapshot_get(&self.data, &encoded)
            .await?
            .map(|value| self.value_encoding.decode(&value))
            .transpose()
    }

    /// Every entry of the snapshot selected by `options`, eagerly collected.
    pub async fn entries(&self, options: RangeOptions) -> Result<Vec<Entry>> {
        let range = options.resolve(self.key_encoding)?;
        let state = self.state()?;
        let _op = state.begin_op()?;
        let mut stored = state.snapshot_scan(&self.data, &range).await?;
        if options.reverse {
            stored.reverse();
        }
        if let Some(limit) = options.limit {
            stored.truncate(limit);
        }
        stored
            .into_iter()
            .map(|(key, value)| {
                Ok((
                    self.key_encoding.decode(&key)?,
                    self.value_encoding.decode(&value)?,
                ))
            })
            .collect()
    }

    pub(crate) fn data(&self) -> &Arc<SnapshotData> {
        &self.data
    }

    fn state(&self) -> Result<Arc<State>> {
        self.state
            .upgrade()
            .ok_or_else(|| DbError::Closed(format!("snapshot {}", self.data.id())))
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        if !self.data.release() {
            return;
        }
        self.data.retire();
        if let Some(state) = self.state.upgrade() {
            state.unregister_snapshot(self.data.id());
        }
        event!(Level::DEBUG, snapshot = self.data.id(), "snapshot released");
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("id", &self.data.id())
            .field("partition", &self.data.partition())
            .field("refs", &self.data.ref_count())
            .finish()
    }
}
