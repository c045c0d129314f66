use crate::core::{Entry, KeyRange, Result};
use async_trait::async_trait;
use std::sync::Arc;

/// Transaction access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
}

/// Cursor traversal direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Reverse,
}

impl Direction {
    pub fn from_reverse(reverse: bool) -> Self {
        if reverse {
            Direction::Reverse
        } else {
            Direction::Forward
        }
    }
}

/// Partition catalog handed to the schema-upgrade callback.
pub trait PartitionCatalog: Send {
    fn partition_names(&self) -> Vec<String>;

    fn create_partition(&mut self, name: &str) -> Result<()>;
}

/// Callback run by the substrate when an open moves the schema version
/// forward. Receives the catalog and the previous version (0 for a new
/// database).
pub type SchemaUpgrade<'a> = &'a mut (dyn FnMut(&mut dyn PartitionCatalog, u32) -> Result<()> + Send);

/// The asynchronous transactional key-value store sessions are layered on.
#[async_trait]
pub trait Substrate: Send + Sync {
    /// Open a connection to database `name`.
    ///
    /// `schema_version = None` opens at the stored version (creating the
    /// database at version 1 when absent). A version greater than the stored
    /// one runs `upgrade` before the connection is handed out.
    async fn open_connection(
        &self,
        name: &str,
        schema_version: Option<u32>,
        upgrade: SchemaUpgrade<'_>,
    ) -> Result<Arc<dyn SubstrateConnection>>;

    /// Counter bumped by every successful open of `name`.
    async fn generation(&self, name: &str) -> u64;
}

#[async_trait]
pub trait SubstrateConnection: Send + Sync {
    fn schema_version(&self) -> u32;

    fn partition_names(&self) -> Vec<String>;

    async fn transaction(
        &self,
        partitions: &[String],
        mode: TransactionMode,
    ) -> Result<Box<dyn SubstrateTransaction>>;

    async fn close(&self) -> Result<()>;
}

/// A unit of work that commits or aborts atomically.
#[async_trait]
pub trait SubstrateTransaction: Send {
    async fn get(&mut self, partition: &str, key: &[u8]) -> Result<Option<Vec<u8>>>;

    async fn put(&mut self, partition: &str, key: &[u8], value: &[u8]) -> Result<()>;

    async fn delete(&mut self, partition: &str, key: &[u8]) -> Result<()>;

    async fn open_cursor(
        &mut self,
        partition: &str,
        range: &KeyRange,
        direction: Direction,
    ) -> Result<Box<dyn SubstrateCursor>>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn abort(self: Box<Self>);
}

#[async_trait]
pub trait SubstrateCursor: Send {
    async fn next(&mut self) -> Result<Option<Entry>>;
}
