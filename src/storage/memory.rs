use super::engine::{
    Direction, PartitionCatalog, SchemaUpgrade, Substrate, SubstrateConnection, SubstrateCursor,
    SubstrateTransaction, TransactionMode,
};
use crate::core::{DbError, Entry, KeyRange, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;

type PartitionData = BTreeMap<Vec<u8>, Vec<u8>>;

/// In-memory substrate.
///
/// Every database is a set of named partitions guarded by one lock.
/// Transactions buffer their writes and apply them in one step at commit, so
/// a failed or aborted transaction leaves nothing behind.
pub struct MemorySubstrate {
    databases: Mutex<HashMap<String, Arc<MemoryDatabase>>>,
    faults: Arc<FaultPlan>,
}

struct MemoryDatabase {
    data: RwLock<DatabaseData>,
    generation: AtomicU64,
}

#[derive(Default, Clone)]
struct DatabaseData {
    version: u32,
    partitions: BTreeMap<String, PartitionData>,
}

/// Failures and delays injected into the substrate by tests.
#[derive(Default)]
struct FaultPlan {
    fail_next_commit: AtomicBool,
    fail_next_open: AtomicBool,
    fail_put_key: Mutex<Option<Vec<u8>>>,
    commit_latency_ms: AtomicU64,
}

impl FaultPlan {
    fn put_fails(&self, key: &[u8]) -> bool {
        match self.fail_put_key.lock() {
            Ok(guard) => guard.as_deref() == Some(key),
            Err(_) => false,
        }
    }
}

impl MemorySubstrate {
    pub fn new() -> Self {
        Self {
            databases: Mutex::new(HashMap::new()),
            faults: Arc::new(FaultPlan::default()),
        }
    }

    /// The next commit on any database fails after its writes were staged.
    pub fn fail_next_commit(&self) {
        self.faults.fail_next_commit.store(true, Ordering::SeqCst);
    }

    /// The next `open_connection` fails.
    pub fn fail_next_open(&self) {
        self.faults.fail_next_open.store(true, Ordering::SeqCst);
    }

    /// Every `put` of `key` fails until faults are cleared.
    pub fn fail_put_on(&self, key: impl AsRef<[u8]>) -> Result<()> {
        *self.faults.fail_put_key.lock()? = Some(key.as_ref().to_vec());
        Ok(())
    }

    /// Delay every commit by `latency`.
    pub fn set_commit_latency(&self, latency: Duration) {
        self.faults
            .commit_latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn clear_faults(&self) -> Result<()> {
        self.faults.fail_next_commit.store(false, Ordering::SeqCst);
        self.faults.fail_next_open.store(false, Ordering::SeqCst);
        self.faults.commit_latency_ms.store(0, Ordering::SeqCst);
        *self.faults.fail_put_key.lock()? = None;
        Ok(())
    }

    /// Committed contents of one partition, in key order.
    pub async fn dump(&self, name: &str, partition: &str) -> Result<Vec<Entry>> {
        let db = self.database(name)?;
        let data = db.data.read().await;
        let entries = data
            .partitions
            .get(partition)
            .ok_or_else(|| DbError::PartitionNotFound(partition.to_string()))?;
        Ok(entries.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    pub async fn schema_version(&self, name: &str) -> Result<u32> {
        let db = self.database(name)?;
        let version = db.data.read().await.version;
        Ok(version)
    }

    fn database(&self, name: &str) -> Result<Arc<MemoryDatabase>> {
        self.databases
            .lock()?
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::substrate("lookup", format!("database '{}' does not exist", name)))
    }

    fn database_or_create(&self, name: &str) -> Result<Arc<MemoryDatabase>> {
        let mut databases = self.databases.lock()?;
        let db = databases.entry(name.to_string()).or_insert_with(|| {
            Arc::new(MemoryDatabase {
                data: RwLock::new(DatabaseData::default()),
                generation: AtomicU64::new(0),
            })
        });
        Ok(Arc::clone(db))
    }
}

impl Default for MemorySubstrate {
    fn default() -> Self {
        Self::new()
    }
}

struct MemoryCatalog<'a> {
    partitions: &'a mut BTreeMap<String, PartitionData>,
}

impl PartitionCatalog for MemoryCatalog<'_> {
    fn partition_names(&self) -> Vec<String> {
        self.partitions.keys().cloned().collect()
    }

    fn create_partition(&mut self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(DbError::InvalidArgument("partition name must not be empty".into()));
        }
        self.partitions.entry(name.to_string()).or_default();
        Ok(())
    }
}

#[async_trait]
impl Substrate for MemorySubstrate {
    async fn open_connection(
        &self,
        name: &str,
        schema_version: Option<u32>,
        upgrade: SchemaUpgrade<'_>,
    ) -> Result<Arc<dyn SubstrateConnection>> {
        if self.faults.fail_next_open.swap(false, Ordering::SeqCst) {
            return Err(DbError::substrate("open", "injected open failure"));
        }

        let db = self.database_or_create(name)?;
        let mut data = db.data.write().await;

        let target = schema_version.unwrap_or_else(|| data.version.max(1));
        if target < data.version {
            return Err(DbError::substrate(
                "open",
                format!(
                    "requested schema version {} is below stored version {}",
                    target, data.version
                ),
            ));
        }

        if target > data.version {
            // Upgrade a copy so that a failing callback leaves the schema untouched.
            let mut partitions = data.partitions.clone();
            let mut catalog = MemoryCatalog {
                partitions: &mut partitions,
            };
            upgrade(&mut catalog, data.version)?;
            data.partitions = partitions;
            data.version = target;
        }

        db.generation.fetch_add(1, Ordering::SeqCst);

        Ok(Arc::new(MemoryConnection {
            db: Arc::clone(&db),
            version: data.version,
            partitions: data.partitions.keys().cloned().collect(),
            closed: AtomicBool::new(false),
            faults: Arc::clone(&self.faults),
        }))
    }

    async fn generation(&self, name: &str) -> u64 {
        match self.database(name) {
            Ok(db) => db.generation.load(Ordering::SeqCst),
            Err(_) => 0,
        }
    }
}

struct MemoryConnection {
    db: Arc<MemoryDatabase>,
    version: u32,
    partitions: Vec<String>,
    closed: AtomicBool,
    faults: Arc<FaultPlan>,
}

#[async_trait]
impl SubstrateConnection for MemoryConnection {
    fn schema_version(&self) -> u32 {
        self.version
    }

    fn partition_names(&self) -> Vec<String> {
        self.partitions.clone()
    }

    async fn transaction(
        &self,
        partitions: &[String],
        mode: TransactionMode,
    ) -> Result<Box<dyn SubstrateTransaction>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DbError::substrate("transaction", "connection is closed"));
        }
        for partition in partitions {
            if !self.partitions.contains(partition) {
                return Err(DbError::PartitionNotFound(partition.clone()));
            }
        }

        Ok(Box::new(MemoryTransaction {
            db: Arc::clone(&self.db),
            mode,
            scope: partitions.to_vec(),
            writes: HashMap::new(),
            faults: Arc::clone(&self.faults),
        }))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct MemoryTransaction {
    db: Arc<MemoryDatabase>,
    mode: TransactionMode,
    scope: Vec<String>,
    /// Staged writes; `None` marks a deletion.
    writes: HashMap<String, BTreeMap<Vec<u8>, Option<Vec<u8>>>>,
    faults: Arc<FaultPlan>,
}

impl MemoryTransaction {
    fn check_scope(&self, partition: &str) -> Result<()> {
        if self.scope.iter().any(|p| p == partition) {
            Ok(())
        } else {
            Err(DbError::substrate(
                "scope",
                format!("partition '{}' is outside the transaction scope", partition),
            ))
        }
    }

    fn check_writable(&self, operation: &str) -> Result<()> {
        match self.mode {
            TransactionMode::ReadWrite => Ok(()),
            TransactionMode::ReadOnly => Err(DbError::substrate(
                operation,
                "transaction is read-only",
            )),
        }
    }
}

#[async_trait]
impl SubstrateTransaction for MemoryTransaction {
    async fn get(&mut self, partition: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_scope(partition)?;
        if let Some(staged) = self.writes.get(partition).and_then(|w| w.get(key)) {
            return Ok(staged.clone());
        }
        let data = self.db.data.read().await;
        Ok(data
            .partitions
            .get(partition)
            .and_then(|entries| entries.get(key))
            .cloned())
    }

    async fn put(&mut self, partition: &str, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_scope(partition)?;
        self.check_writable("put")?;
        if self.faults.put_fails(key) {
            return Err(DbError::substrate("put", "injected put failure"));
        }
        self.writes
            .entry(partition.to_string())
            .or_default()
            .insert(key.to_vec(), Some(value.to_vec()));
        Ok(())
    }

    async fn delete(&mut self, partition: &str, key: &[u8]) -> Result<()> {
        self.check_scope(partition)?;
        self.check_writable("delete")?;
        self.writes
            .entry(partition.to_string())
            .or_default()
            .insert(key.to_vec(), None);
        Ok(())
    }

    async fn open_cursor(
        &mut self,
        partition: &str,
        range: &KeyRange,
        direction: Direction,
    ) -> Result<Box<dyn SubstrateCursor>> {
        self.check_scope(partition)?;
        if range.is_empty() {
            return Ok(Box::new(MemoryCursor {
                entries: Vec::new().into_iter(),
            }));
        }

        let mut view: BTreeMap<Vec<u8>, Vec<u8>> = {
            let data = self.db.data.read().await;
            match data.partitions.get(partition) {
                Some(entries) => entries
                    .range::<[u8], _>(range.as_slices())
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                None => BTreeMap::new(),
            }
        };

        if let Some(staged) = self.writes.get(partition) {
            for (key, value) in staged.range::<[u8], _>(range.as_slices()) {
                match value {
                    Some(v) => {
                        view.insert(key.clone(), v.clone());
                    }
                    None => {
                        view.remove(key);
                    }
                }
            }
        }

        let mut entries: Vec<Entry> = view.into_iter().collect();
        if direction == Direction::Reverse {
            entries.reverse();
        }
        Ok(Box::new(MemoryCursor {
            entries: entries.into_iter(),
        }))
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemoryTransaction {
            db, writes, faults, ..
        } = *self;

        let latency = faults.commit_latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if writes.is_empty() {
            return Ok(());
        }
        if faults.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(DbError::substrate("commit", "injected commit failure"));
        }

        let mut data = db.data.write().await;
        for (partition, staged) in writes {
            let entries = data
                .partitions
                .get_mut(&partition)
                .ok_or_else(|| DbError::PartitionNotFound(partition.clone()))?;
            for (key, value) in staged {
                match value {
                    Some(v) => {
                        entries.insert(key, v);
                    }
                    None => {
                        entries.remove(&key);
                    }
                }
            }
        }
        Ok(())
    }

    async fn abort(self: Box<Self>) {}
}

struct MemoryCursor {
    entries: std::vec::IntoIter<Entry>,
}

#[async_trait]
impl SubstrateCursor for MemoryCursor {
    async fn next(&mut self) -> Result<Option<Entry>> {
        Ok(self.entries.next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open(substrate: &MemorySubstrate, partitions: &[&str]) -> Arc<dyn SubstrateConnection> {
        let names: Vec<String> = partitions.iter().map(|p| p.to_string()).collect();
        let mut upgrade = |catalog: &mut dyn PartitionCatalog, _old: u32| -> Result<()> {
            for name in &names {
                catalog.create_partition(name)?;
            }
            Ok(())
        };
        substrate.open_connection("db", None, &mut upgrade).await.unwrap()
    }

    #[tokio::test]
    async fn test_commit_applies_all_writes() {
        let substrate = MemorySubstrate::new();
        let conn = open(&substrate, &["main"]).await;
        let scope = vec!["main".to_string()];

        let mut txn = conn.transaction(&scope, TransactionMode::ReadWrite).await.unwrap();
        txn.put("main", b"a", b"1").await.unwrap();
        txn.put("main", b"b", b"2").await.unwrap();
        assert_eq!(txn.get("main", b"a").await.unwrap(), Some(b"1".to_vec()));
        txn.commit().await.unwrap();

        let entries = substrate.dump("db", "main").await.unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_commit_applies_nothing() {
        let substrate = MemorySubstrate::new();
        let conn = open(&substrate, &["main"]).await;
        let scope = vec!["main".to_string()];

        substrate.fail_next_commit();
        let mut txn = conn.transaction(&scope, TransactionMode::ReadWrite).await.unwrap();
        txn.put("main", b"a", b"1").await.unwrap();
        assert!(txn.commit().await.is_err());
        assert!(substrate.dump("db", "main").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_read_only_transaction_rejects_writes() {
        let substrate = MemorySubstrate::new();
        let conn = open(&substrate, &["main"]).await;
        let scope = vec!["main".to_string()];

        let mut txn = conn.transaction(&scope, TransactionMode::ReadOnly).await.unwrap();
        assert!(txn.put("main", b"a", b"1").await.is_err());
    }

    #[tokio::test]
    async fn test_cursor_sees_staged_writes_in_order() {
        let substrate = MemorySubstrate::new();
        let conn = open(&substrate, &["main"]).await;
        let scope = vec!["main".to_string()];

        let mut txn = conn.transaction(&scope, TransactionMode::ReadWrite).await.unwrap();
        txn.put("main", b"b", b"2").await.unwrap();
        txn.put("main", b"a", b"1").await.unwrap();
        txn.commit().await.unwrap();

        let mut txn = conn.transaction(&scope, TransactionMode::ReadWrite).await.unwrap();
        txn.put("main", b"c", b"3").await.unwrap();
        txn.delete("main", b"a").await.unwrap();
        let mut cursor = txn
            .open_cursor("main", &KeyRange::full(), Direction::Reverse)
            .await
            .unwrap();
        assert_eq!(cursor.next().await.unwrap().unwrap().0, b"c".to_vec());
        assert_eq!(cursor.next().await.unwrap().unwrap().0, b"b".to_vec());
        assert!(cursor.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_generation_counts_opens() {
        let substrate = MemorySubstrate::new();
        assert_eq!(substrate.generation("db").await, 0);
        open(&substrate, &["main"]).await;
        open(&substrate, &["main"]).await;
        assert_eq!(substrate.generation("db").await, 2);
    }

    #[tokio::test]
    async fn test_unknown_partition_is_rejected() {
        let substrate = MemorySubstrate::new();
        let conn = open(&substrate, &["main"]).await;
        let err = conn
            .transaction(&["other".to_string()], TransactionMode::ReadOnly)
            .await
            .err()
            .unwrap();
        assert_eq!(err, DbError::PartitionNotFound("other".into()));
    }
}
