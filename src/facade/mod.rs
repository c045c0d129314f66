pub mod session;

pub use session::{HandleCounts, Session, SessionOptions};
