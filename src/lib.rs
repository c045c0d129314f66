// ============================================================================
// kvsession Library
// ============================================================================
//
// Session and transaction buffering over an asynchronous transactional
// key-value substrate:
//
// - connection:  per-location State, lifecycle, registry, configuration
// - transaction: batches, pending-operation buffers, snapshots
// - iterator:    windowed range iteration
// - facade:      the Session handle applications use
// - storage:     the substrate interface and an in-memory substrate
//
// ============================================================================

pub mod connection;
pub mod core;
pub mod facade;
pub mod iterator;
pub mod prelude;
pub mod storage;
pub mod transaction;

// Re-export main types for convenience
pub use crate::core::{DbError, Encoding, Entry, KeyRange, RangeOptions, Result};

pub use crate::connection::{
    CloseOptions, ConnectionRegistry, DbOptions, FilterPolicy, Handles, Lifecycle, SessionStatus,
    State,
};
pub use crate::facade::{HandleCounts, Session, SessionOptions};
pub use crate::iterator::RangeIterator;
pub use crate::storage::{MemorySubstrate, Substrate};
pub use crate::transaction::{Batch, BatchKind, BatchOptions, Snapshot};

// ============================================================================
// Quick start
// ============================================================================

/// Open a root session on `location` backed by a fresh in-memory substrate.
///
/// Convenient for tests and tools; applications normally keep one
/// [`ConnectionRegistry`] for the process.
///
/// # Examples
///
/// ```
/// # #[tokio::main]
/// # async fn main() -> kvsession::Result<()> {
/// let session = kvsession::open_in_memory("scratch").await?;
///
/// session.put("greeting", "hello").await?;
/// assert_eq!(session.get("greeting").await?, Some(b"hello".to_vec()));
///
/// session.close().await;
/// # Ok(())
/// # }
/// ```
pub async fn open_in_memory(location: &str) -> Result<Session> {
    let registry = ConnectionRegistry::new(std::sync::Arc::new(MemorySubstrate::new()));
    let session = registry.session(location, DbOptions::default())?;
    session.open().await?;
    Ok(session)
}
