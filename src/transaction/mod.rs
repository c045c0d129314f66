// ============================================================================
// Write Buffering and Snapshot Isolation
// ============================================================================
//
// - change:   the pending-operation buffer behind a batch
// - batch:    read/write batches committed atomically on flush
// - snapshot: point-in-time views kept consistent by pre-mutation capture
//
// ============================================================================

pub mod batch;
pub mod change;
pub mod snapshot;

pub use batch::{Batch, BatchKind, BatchOptions};
pub use change::{BatchCore, Lookup, PendingOp, PendingOps};
pub use snapshot::{Snapshot, SnapshotData, SnapshotId};
