pub mod config;
pub mod handles;
pub mod lifecycle;
pub mod registry;
pub mod state;

pub use config::{DEFAULT_PARTITION, DbOptions, FilterPolicy};
pub use handles::{HandleGuard, Handles};
pub use lifecycle::CloseOptions;
pub use registry::ConnectionRegistry;
pub use state::{Lifecycle, PartitionDescriptor, SessionId, SessionStatus, State};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemorySubstrate;
    use std::sync::Arc;

    fn registry() -> ConnectionRegistry {
        ConnectionRegistry::new(Arc::new(MemorySubstrate::new()))
    }

    #[tokio::test]
    async fn test_open_is_idempotent_and_shared() {
        let registry = registry();
        let session = registry.session("db", DbOptions::default()).unwrap();
        let state = session.state();

        let (a, b) = tokio::join!(state.open(), state.open());
        assert!(a.is_ok());
        assert!(b.is_ok());
        assert_eq!(state.lifecycle(), Lifecycle::Open);
        assert!(state.open().await.is_ok());
    }

    #[tokio::test]
    async fn test_failed_open_returns_to_new() {
        let substrate = Arc::new(MemorySubstrate::new());
        let registry = ConnectionRegistry::new(substrate.clone());
        let session = registry.session("db", DbOptions::default()).unwrap();

        substrate.fail_next_open();
        assert!(session.open().await.is_err());
        assert_eq!(session.state().lifecycle(), Lifecycle::New);

        session.open().await.unwrap();
        assert_eq!(session.state().lifecycle(), Lifecycle::Open);
    }

    #[tokio::test]
    async fn test_sessions_share_state_per_location() {
        let registry = registry();
        let a = registry.session("db", DbOptions::default()).unwrap();
        let b = registry.session("db", DbOptions::default()).unwrap();
        let c = registry.session("other", DbOptions::default()).unwrap();

        assert!(Arc::ptr_eq(&a.state(), &b.state()));
        assert!(!Arc::ptr_eq(&a.state(), &c.state()));
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_close_removes_location_from_registry() {
        let registry = registry();
        let session = registry.session("db", DbOptions::default()).unwrap();
        session.open().await.unwrap();
        session.close().await;

        assert!(!registry.contains("db"));
        assert_eq!(session.state().lifecycle(), Lifecycle::Closed);

        // A new root session gets a fresh State.
        let again = registry.session("db", DbOptions::default()).unwrap();
        again.open().await.unwrap();
        assert_eq!(again.state().lifecycle(), Lifecycle::Open);
    }

    #[tokio::test]
    async fn test_partition_created_on_demand() {
        let substrate = Arc::new(MemorySubstrate::new());
        let registry = ConnectionRegistry::new(substrate.clone());
        let session = registry.session("db", DbOptions::default()).unwrap();
        session.open().await.unwrap();
        assert_eq!(substrate.schema_version("db").await.unwrap(), 1);

        session.state().ensure_partition("extra").await.unwrap();
        assert_eq!(substrate.schema_version("db").await.unwrap(), 2);
        assert!(
            session
                .state()
                .partitions()
                .iter()
                .any(|p| p.name == "extra" && p.created)
        );
        assert_eq!(session.state().lifecycle(), Lifecycle::Open);
    }
}
