pub mod encoding;
pub mod error;
pub mod range;

pub use encoding::Encoding;
pub use error::{DbError, Result};
pub use range::{KeyRange, RangeOptions, prefix_upper_bound};

/// Raw key bytes as stored by the substrate.
pub type Key = Vec<u8>;

/// Raw value bytes as stored by the substrate.
pub type Value = Vec<u8>;

/// A key/value pair yielded by cursors and iterators.
pub type Entry = (Key, Value);
