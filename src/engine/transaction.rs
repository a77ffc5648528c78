// Transaction manager - per-item locks and per-locker staged writes

//! # Transaction Manager
//!
//! The single gateway through which persisted state changes flow. It keeps
//! two tables behind one mutex:
//!
//! - **lock table**: `item -> locker`, at most one locker per item
//! - **pending buffer**: `locker -> [staged write]`, at most one staged write
//!   per `(item, path)`; staging the same key again replaces the earlier
//!   intent and moves it to the end
//!
//! ## Locking discipline
//!
//! A write under locker `L` acquires the item's lock if it is free, joins the
//! buffer if `L` already holds it, and fails immediately with
//! [`LifecycleError::Persistency`] if another locker holds it. Nothing ever
//! waits, so nothing can deadlock; contention surfaces as an error.
//!
//! A write without a locker is applied straight to the backing store under a
//! temporary lock, so it still serializes against transactional writers.
//!
//! Reads never lock. A locker sees its own staged writes (a staged delete
//! reads as "deleted but not committed"); everything else falls through to
//! the backing store. There is no isolation from other lockers' in-flight
//! writes.
//!
//! ## Commit
//!
//! Commit flushes the buffer in staging order with the mutex released, and
//! releases each item's lock once that item's last write succeeded. A flush
//! failure leaves the store in a state with no defined rollback: the manager
//! dumps every lock and staged write at `error` level and then applies the
//! configured [`CommitFailurePolicy`].

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::storage::{child_name, ClusterStorage};
use crate::models::{ItemId, Record};
use crate::{LifecycleError, Result};

/// Identity under which one logical transaction stages its writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Locker(pub Uuid);

impl Locker {
    pub fn new() -> Self {
        Locker(Uuid::new_v4())
    }
}

impl Default for Locker {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Locker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What to do when a commit-time flush fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitFailurePolicy {
    /// Dump state and abort the process
    #[default]
    Abort,
    /// Dump state, return [`LifecycleError::CommitFailed`] and reject every
    /// later write
    Poison,
}

#[derive(Debug, Clone)]
struct StagedWrite {
    item: ItemId,
    path: String,
    /// `None` stages a delete
    payload: Option<Record>,
}

impl StagedWrite {
    fn describe(&self) -> String {
        match &self.payload {
            Some(_) => format!("put {}:{}", self.item, self.path),
            None => format!("delete {}:{}", self.item, self.path),
        }
    }
}

#[derive(Debug, Default)]
struct TransactionTable {
    locks: HashMap<ItemId, Locker>,
    pending: HashMap<Locker, Vec<StagedWrite>>,
}

impl TransactionTable {
    fn acquire(&mut self, item: ItemId, locker: Locker) -> Result<()> {
        match self.locks.get(&item) {
            Some(holder) if *holder != locker => Err(LifecycleError::Persistency(format!(
                "Access denied: object {} has been locked for writing by {}",
                item, holder
            ))),
            Some(_) => Ok(()),
            None => {
                self.locks.insert(item, locker);
                Ok(())
            }
        }
    }

    fn release(&mut self, item: ItemId, locker: Locker) {
        if self.locks.get(&item) == Some(&locker) {
            self.locks.remove(&item);
        }
    }

    fn release_all(&mut self, locker: Locker) {
        self.locks.retain(|_, holder| *holder != locker);
    }

    fn staged(&self, locker: &Locker, item: ItemId, path: &str) -> Option<&StagedWrite> {
        self.pending
            .get(locker)?
            .iter()
            .find(|write| write.item == item && write.path == path)
    }

    fn report(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for (item, locker) in &self.locks {
            lines.push(format!("lock {} held by {}", item, locker));
        }
        for (locker, writes) in &self.pending {
            lines.push(format!("locker {} has {} staged writes", locker, writes.len()));
            lines.extend(writes.iter().map(|write| format!("  {}", write.describe())));
        }
        lines
    }
}

fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent, name)
    }
}

pub struct TransactionManager {
    storage: Arc<dyn ClusterStorage>,
    table: Mutex<TransactionTable>,
    policy: CommitFailurePolicy,
    poisoned: AtomicBool,
}

impl TransactionManager {
    pub fn new(storage: Arc<dyn ClusterStorage>) -> Self {
        Self::with_policy(storage, CommitFailurePolicy::default())
    }

    pub fn with_policy(storage: Arc<dyn ClusterStorage>, policy: CommitFailurePolicy) -> Self {
        TransactionManager {
            storage,
            table: Mutex::new(TransactionTable::default()),
            policy,
            poisoned: AtomicBool::new(false),
        }
    }

    pub fn policy(&self) -> CommitFailurePolicy {
        self.policy
    }

    /// Whether a failed commit has put the manager out of service
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    fn check_poisoned(&self) -> Result<()> {
        if self.is_poisoned() {
            return Err(LifecycleError::CommitFailed(
                "transaction manager refused the write after an earlier commit failure".to_string(),
            ));
        }
        Ok(())
    }

    /// Read a record, seeing the locker's own staged writes first
    pub async fn get(&self, item: ItemId, path: &str, locker: Option<&Locker>) -> Result<Record> {
        if let Some(locker) = locker {
            let staged = self
                .table
                .lock()
                .staged(locker, item, path)
                .map(|write| write.payload.clone());
            match staged {
                Some(Some(record)) => return Ok(record),
                Some(None) => {
                    return Err(LifecycleError::Persistency(format!(
                        "{} has been deleted but not committed",
                        path
                    )))
                }
                None => {}
            }
        }
        self.storage.get(item, path).await
    }

    /// Stage a record under `locker`, or write it through when there is none
    pub async fn put(&self, item: ItemId, record: Record, locker: Option<&Locker>) -> Result<()> {
        self.check_poisoned()?;
        let write = StagedWrite {
            item,
            path: record.cluster_path(),
            payload: Some(record),
        };
        match locker {
            Some(locker) => self.stage(*locker, write),
            None => self.write_through(write).await,
        }
    }

    /// Stage a delete under `locker`, or apply it when there is none
    pub async fn remove(&self, item: ItemId, path: &str, locker: Option<&Locker>) -> Result<()> {
        self.check_poisoned()?;
        let write = StagedWrite {
            item,
            path: path.to_string(),
            payload: None,
        };
        match locker {
            Some(locker) => self.stage(*locker, write),
            None => self.write_through(write).await,
        }
    }

    /// Remove every leaf record below `path`
    pub async fn remove_cluster(&self, item: ItemId, path: &str, locker: Option<&Locker>) -> Result<()> {
        let mut stack = vec![path.to_string()];
        while let Some(current) = stack.pop() {
            let children = self.list_children(item, &current, locker).await?;
            if children.is_empty() {
                if current.contains('/') {
                    self.remove(item, &current, locker).await?;
                }
                continue;
            }
            stack.extend(children.iter().map(|child| join_path(&current, child)));
        }
        Ok(())
    }

    /// Children of `path` as the locker would see them after commit
    pub async fn list_children(&self, item: ItemId, path: &str, locker: Option<&Locker>) -> Result<Vec<String>> {
        let mut names: BTreeSet<String> = self.storage.list_children(item, path).await?.into_iter().collect();

        if let Some(locker) = locker {
            let table = self.table.lock();
            if let Some(writes) = table.pending.get(locker) {
                for write in writes.iter().filter(|write| write.item == item) {
                    let Some(name) = child_name(path, &write.path) else {
                        continue;
                    };
                    match write.payload {
                        Some(_) => {
                            names.insert(name.to_string());
                        }
                        // Only a direct leaf delete hides the child
                        None if write.path == join_path(path, name) => {
                            names.remove(name);
                        }
                        None => {}
                    }
                }
            }
        }

        Ok(names.into_iter().collect())
    }

    fn stage(&self, locker: Locker, write: StagedWrite) -> Result<()> {
        let mut table = self.table.lock();
        table.acquire(write.item, locker)?;
        debug!(locker = %locker, "staging {}", write.describe());
        let writes = table.pending.entry(locker).or_default();
        writes.retain(|staged| !(staged.item == write.item && staged.path == write.path));
        writes.push(write);
        Ok(())
    }

    async fn write_through(&self, write: StagedWrite) -> Result<()> {
        let temporary = Locker::new();
        self.table.lock().acquire(write.item, temporary)?;
        let result = self.apply(&write).await;
        self.table.lock().release(write.item, temporary);
        result
    }

    async fn apply(&self, write: &StagedWrite) -> Result<()> {
        match &write.payload {
            Some(record) => self.storage.put(write.item, record).await,
            // Deleting what is already gone is not a failure
            None => match self.storage.remove(write.item, &write.path).await {
                Err(e) if e.is_not_found() => Ok(()),
                other => other,
            },
        }
    }

    /// Flush the locker's staged writes to the backing store
    ///
    /// Committing a locker with nothing staged is a no-op.
    pub async fn commit(&self, locker: &Locker) -> Result<()> {
        let writes = self.table.lock().pending.remove(locker);
        let Some(writes) = writes else {
            self.table.lock().release_all(*locker);
            return Ok(());
        };

        let mut remaining: HashMap<ItemId, usize> = HashMap::new();
        for write in &writes {
            *remaining.entry(write.item).or_default() += 1;
        }

        for (pos, write) in writes.iter().enumerate() {
            if let Err(cause) = self.apply(write).await {
                return self.commit_failed(locker, &writes[pos..], cause);
            }
            if let Some(count) = remaining.get_mut(&write.item) {
                *count -= 1;
                if *count == 0 {
                    self.table.lock().release(write.item, *locker);
                }
            }
        }

        debug!(locker = %locker, writes = writes.len(), "committed");
        Ok(())
    }

    fn commit_failed(&self, locker: &Locker, unflushed: &[StagedWrite], cause: LifecycleError) -> Result<()> {
        error!(locker = %locker, error = %cause, "commit failed with {} writes not flushed", unflushed.len());
        for write in unflushed {
            error!(locker = %locker, "not flushed: {}", write.describe());
        }
        for line in self.table.lock().report() {
            error!("{}", line);
        }

        match self.policy {
            CommitFailurePolicy::Abort => {
                error!("backing store may be inconsistent, aborting");
                std::process::abort();
            }
            CommitFailurePolicy::Poison => {
                self.poisoned.store(true, Ordering::SeqCst);
                self.table.lock().release_all(*locker);
                Err(LifecycleError::CommitFailed(format!(
                    "locker {}: {} ({} writes not flushed)",
                    locker,
                    cause,
                    unflushed.len()
                )))
            }
        }
    }

    /// Discard the locker's staged writes and release its locks
    ///
    /// No backing-store I/O; aborting twice is harmless.
    pub fn abort(&self, locker: &Locker) {
        let mut table = self.table.lock();
        if let Some(writes) = table.pending.remove(locker) {
            debug!(locker = %locker, writes = writes.len(), "aborted");
        }
        table.release_all(*locker);
    }

    pub fn has_pending_transactions(&self) -> bool {
        let table = self.table.lock();
        !table.pending.is_empty() || !table.locks.is_empty()
    }

    /// Log every held lock and staged write
    pub fn dump_pending_transactions(&self) {
        let lines = self.table.lock().report();
        if lines.is_empty() {
            info!("no pending transactions");
        }
        for line in lines {
            info!("{}", line);
        }
    }

    /// Discard everything still pending, logging what is lost
    pub fn close(&self) {
        if self.has_pending_transactions() {
            warn!("closing with pending transactions, they will be discarded");
            self.dump_pending_transactions();
        }
        let mut table = self.table.lock();
        table.locks.clear();
        table.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::InMemoryClusterStorage;
    use crate::models::Viewpoint;
    use proptest::prelude::*;

    fn view(schema: &str, name: &str, event_id: i32) -> Record {
        Record::Viewpoint(Viewpoint {
            schema_name: schema.into(),
            name: name.into(),
            event_id,
        })
    }

    fn manager() -> (Arc<InMemoryClusterStorage>, TransactionManager) {
        let storage = Arc::new(InMemoryClusterStorage::new());
        let manager = TransactionManager::new(storage.clone());
        (storage, manager)
    }

    /// Backing store that refuses records of the `Broken` schema
    struct FailingStorage {
        inner: InMemoryClusterStorage,
    }

    #[async_trait::async_trait]
    impl ClusterStorage for FailingStorage {
        async fn get(&self, item: ItemId, path: &str) -> Result<Record> {
            self.inner.get(item, path).await
        }

        async fn put(&self, item: ItemId, record: &Record) -> Result<()> {
            if record.cluster_path().starts_with("ViewPoint/Broken") {
                return Err(anyhow::anyhow!("disk full").into());
            }
            self.inner.put(item, record).await
        }

        async fn remove(&self, item: ItemId, path: &str) -> Result<()> {
            self.inner.remove(item, path).await
        }

        async fn list_children(&self, item: ItemId, path: &str) -> Result<Vec<String>> {
            self.inner.list_children(item, path).await
        }
    }

    #[tokio::test]
    async fn test_read_your_own_writes() {
        let (_, manager) = manager();
        let item = ItemId::new();
        let locker = Locker::new();
        let other = Locker::new();
        let rec_a = view("Report", "last", 1);

        manager.put(item, rec_a.clone(), Some(&locker)).await.unwrap();

        assert_eq!(manager.get(item, "ViewPoint/Report/last", Some(&locker)).await.unwrap(), rec_a);
        assert!(manager
            .get(item, "ViewPoint/Report/last", Some(&other))
            .await
            .unwrap_err()
            .is_not_found());
        assert!(manager.get(item, "ViewPoint/Report/last", None).await.unwrap_err().is_not_found());

        manager.commit(&locker).await.unwrap();
        assert_eq!(manager.get(item, "ViewPoint/Report/last", Some(&other)).await.unwrap(), rec_a);
        assert!(!manager.has_pending_transactions());
    }

    #[tokio::test]
    async fn test_deleted_but_not_committed() {
        let (_, manager) = manager();
        let item = ItemId::new();
        manager.put(item, view("Report", "last", 1), None).await.unwrap();

        let locker = Locker::new();
        manager.remove(item, "ViewPoint/Report/last", Some(&locker)).await.unwrap();

        let err = manager.get(item, "ViewPoint/Report/last", Some(&locker)).await.unwrap_err();
        assert!(matches!(err, LifecycleError::Persistency(ref msg) if msg.contains("deleted but not committed")));

        // Other readers still see the committed value
        assert!(manager.get(item, "ViewPoint/Report/last", None).await.is_ok());

        manager.commit(&locker).await.unwrap();
        assert!(manager.get(item, "ViewPoint/Report/last", None).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_lock_exclusivity() {
        let (_, manager) = manager();
        let item = ItemId::new();
        let a = Locker::new();
        let b = Locker::new();

        manager.put(item, view("Report", "last", 1), Some(&a)).await.unwrap();

        let err = manager.put(item, view("Report", "last", 2), Some(&b)).await.unwrap_err();
        assert!(matches!(err, LifecycleError::Persistency(_)));
        assert!(matches!(
            manager.remove(item, "ViewPoint/Report/last", Some(&b)).await,
            Err(LifecycleError::Persistency(_))
        ));
        assert!(matches!(
            manager.put(item, view("Report", "x", 3), None).await,
            Err(LifecycleError::Persistency(_))
        ));

        // A's buffer is untouched
        assert_eq!(manager.get(item, "ViewPoint/Report/last", Some(&a)).await.unwrap(), view("Report", "last", 1));

        // Other items are unaffected
        manager.put(ItemId::new(), view("Report", "last", 4), Some(&b)).await.unwrap();
    }

    #[tokio::test]
    async fn test_abort_is_idempotent() {
        let (storage, manager) = manager();
        let item = ItemId::new();
        let locker = Locker::new();
        manager.put(item, view("Report", "last", 1), Some(&locker)).await.unwrap();

        manager.abort(&locker);
        assert!(!manager.has_pending_transactions());
        manager.abort(&locker);
        assert!(!manager.has_pending_transactions());

        manager.commit(&locker).await.unwrap();
        assert_eq!(storage.record_count(item), 0);

        // Lock released: another locker may write
        manager.put(item, view("Report", "last", 2), Some(&Locker::new())).await.unwrap();
    }

    #[tokio::test]
    async fn test_list_children_reads_through() {
        let (_, manager) = manager();
        let item = ItemId::new();
        manager.put(item, view("Report", "last", 1), None).await.unwrap();
        manager.put(item, view("Report", "Approved", 1), None).await.unwrap();

        let locker = Locker::new();
        manager.put(item, view("Invoice", "last", 2), Some(&locker)).await.unwrap();
        manager.remove(item, "ViewPoint/Report/Approved", Some(&locker)).await.unwrap();

        assert_eq!(
            manager.list_children(item, "ViewPoint", Some(&locker)).await.unwrap(),
            vec!["Invoice".to_string(), "Report".to_string()]
        );
        assert_eq!(
            manager.list_children(item, "ViewPoint/Report", Some(&locker)).await.unwrap(),
            vec!["last".to_string()]
        );
        assert_eq!(
            manager.list_children(item, "ViewPoint/Report", None).await.unwrap(),
            vec!["Approved".to_string(), "last".to_string()]
        );
    }

    #[tokio::test]
    async fn test_remove_cluster() {
        let (storage, manager) = manager();
        let item = ItemId::new();
        manager.put(item, view("Report", "last", 1), None).await.unwrap();
        manager.put(item, view("Report", "Approved", 1), None).await.unwrap();
        manager.put(item, view("Invoice", "last", 2), None).await.unwrap();

        let locker = Locker::new();
        manager.remove_cluster(item, "ViewPoint/Report", Some(&locker)).await.unwrap();
        assert!(manager
            .list_children(item, "ViewPoint/Report", Some(&locker))
            .await
            .unwrap()
            .is_empty());
        manager.commit(&locker).await.unwrap();

        assert_eq!(storage.record_count(item), 1);
    }

    #[tokio::test]
    async fn test_commit_failure_poisons() {
        let storage = Arc::new(FailingStorage {
            inner: InMemoryClusterStorage::new(),
        });
        let manager = TransactionManager::with_policy(storage.clone(), CommitFailurePolicy::Poison);
        let item = ItemId::new();
        let locker = Locker::new();

        manager.put(item, view("Report", "last", 1), Some(&locker)).await.unwrap();
        manager.put(item, view("Broken", "last", 1), Some(&locker)).await.unwrap();

        let err = manager.commit(&locker).await.unwrap_err();
        assert!(matches!(err, LifecycleError::CommitFailed(_)));
        assert!(manager.is_poisoned());

        // The write before the failure reached the store
        assert!(storage.inner.get(item, "ViewPoint/Report/last").await.is_ok());

        assert!(matches!(
            manager.put(item, view("Report", "x", 2), Some(&Locker::new())).await,
            Err(LifecycleError::CommitFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_close_discards_pending() {
        let (storage, manager) = manager();
        let item = ItemId::new();
        let locker = Locker::new();
        manager.put(item, view("Report", "last", 1), Some(&locker)).await.unwrap();
        assert!(manager.has_pending_transactions());

        manager.close();
        assert!(!manager.has_pending_transactions());
        manager.commit(&locker).await.unwrap();
        assert_eq!(storage.record_count(item), 0);
    }

    proptest! {
        #[test]
        fn later_stage_replaces_earlier(ids in proptest::collection::vec(0i32..100, 1..8)) {
            let runtime = tokio::runtime::Runtime::new().unwrap();
            runtime.block_on(async {
                let (storage, manager) = manager();
                let item = ItemId::new();
                let locker = Locker::new();
                for id in &ids {
                    manager.put(item, view("Report", "last", *id), Some(&locker)).await.unwrap();
                }
                manager.commit(&locker).await.unwrap();

                assert_eq!(storage.record_count(item), 1);
                let last = *ids.last().unwrap();
                assert_eq!(storage.get(item, "ViewPoint/Report/last").await.unwrap(), view("Report", "last", last));
            });
        }
    }
}
