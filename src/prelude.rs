//! Common imports for application code.
//!
//! `use kvsession::prelude::*;` brings in the session surface and the option
//! builders. Substrate implementors want [`crate::storage`] instead.

pub use crate::connection::{CloseOptions, ConnectionRegistry, DbOptions, SessionStatus};
pub use crate::core::{DbError, Encoding, RangeOptions, Result};
pub use crate::facade::{Session, SessionOptions};
pub use crate::iterator::RangeIterator;
pub use crate::storage::MemorySubstrate;
pub use crate::transaction::{Batch, BatchOptions, Snapshot};
