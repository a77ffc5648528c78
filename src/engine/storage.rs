// Backing store abstraction for item records
// Path-addressed storage of typed records, scoped per item

//! # Cluster Storage
//!
//! This module defines the contract of the durable backing store that the
//! [`TransactionManager`](super::TransactionManager) flushes into. Records are
//! addressed by `(item, cluster path)` where the path is a slash-delimited
//! hierarchical key such as `AuditTrail/12` or `Outcome/Report/1/12`.
//!
//! ## Storage Architecture
//!
//! The storage layer follows the **Repository Pattern**:
//! - **ClusterStorage trait**: the four operations the engine needs
//! - **InMemoryClusterStorage**: default implementation for development/testing
//!
//! The engine never talks to a `ClusterStorage` directly. All writes go
//! through the transaction manager so they are staged under a locker and
//! flushed at commit.
//!
//! ## Rust Learning Notes:
//!
//! ### Async Traits
//! Rust trait objects cannot hold `async fn` directly; the `async-trait` crate
//! boxes the returned futures so `Arc<dyn ClusterStorage>` works.
//!
//! ### Sharded Maps
//! `DashMap` shards its entries across several locks, so concurrent callers
//! working on different items rarely contend.

use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet};

use crate::models::{ItemId, Record};
use crate::{LifecycleError, Result};

/// Durable path-addressed record storage
#[async_trait::async_trait]
pub trait ClusterStorage: Send + Sync {
    /// Fetch the record at `path`, [`LifecycleError::ObjectNotFound`] if absent
    async fn get(&self, item: ItemId, path: &str) -> Result<Record>;

    /// Store a record at its own cluster path, replacing any previous one
    async fn put(&self, item: ItemId, record: &Record) -> Result<()>;

    /// Delete the record at `path`
    async fn remove(&self, item: ItemId, path: &str) -> Result<()>;

    /// Names of the direct children of `path`
    ///
    /// An unknown path has no children; that is not an error.
    async fn list_children(&self, item: ItemId, path: &str) -> Result<Vec<String>>;
}

/// In-memory storage for development and testing
///
/// Each item owns an ordered map from full cluster path to record; children
/// are derived from the path keys.
#[derive(Default)]
pub struct InMemoryClusterStorage {
    items: DashMap<ItemId, BTreeMap<String, Record>>,
}

impl InMemoryClusterStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records stored for an item
    pub fn record_count(&self, item: ItemId) -> usize {
        self.items.get(&item).map_or(0, |records| records.len())
    }
}

#[async_trait::async_trait]
impl ClusterStorage for InMemoryClusterStorage {
    async fn get(&self, item: ItemId, path: &str) -> Result<Record> {
        self.items
            .get(&item)
            .and_then(|records| records.get(path).cloned())
            .ok_or_else(|| LifecycleError::ObjectNotFound(format!("{} not found in {}", path, item)))
    }

    async fn put(&self, item: ItemId, record: &Record) -> Result<()> {
        self.items
            .entry(item)
            .or_default()
            .insert(record.cluster_path(), record.clone());
        Ok(())
    }

    async fn remove(&self, item: ItemId, path: &str) -> Result<()> {
        let removed = self.items.get_mut(&item).and_then(|mut records| records.remove(path));
        match removed {
            Some(_) => Ok(()),
            None => Err(LifecycleError::ObjectNotFound(format!("{} not found in {}", path, item))),
        }
    }

    async fn list_children(&self, item: ItemId, path: &str) -> Result<Vec<String>> {
        let Some(records) = self.items.get(&item) else {
            return Ok(Vec::new());
        };
        let children: BTreeSet<String> = records
            .keys()
            .filter_map(|key| child_name(path, key))
            .map(str::to_string)
            .collect();
        Ok(children.into_iter().collect())
    }
}

/// First path segment of `key` below `parent`, if `key` lies under it
pub(crate) fn child_name<'a>(parent: &str, key: &'a str) -> Option<&'a str> {
    let rest = if parent.is_empty() {
        key
    } else {
        key.strip_prefix(parent)?.strip_prefix('/')?
    };
    rest.split('/').next().filter(|name| !name.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Viewpoint;

    fn view(schema: &str, name: &str) -> Record {
        Record::Viewpoint(Viewpoint {
            schema_name: schema.into(),
            name: name.into(),
            event_id: 0,
        })
    }

    #[test]
    fn test_child_name() {
        assert_eq!(child_name("AuditTrail", "AuditTrail/3"), Some("3"));
        assert_eq!(child_name("ViewPoint", "ViewPoint/Report/last"), Some("Report"));
        assert_eq!(child_name("", "ViewPoint/Report/last"), Some("ViewPoint"));
        assert_eq!(child_name("Audit", "AuditTrail/3"), None);
    }

    #[tokio::test]
    async fn test_put_get_remove() {
        let storage = InMemoryClusterStorage::new();
        let item = ItemId::new();

        assert!(storage.get(item, "ViewPoint/Report/last").await.unwrap_err().is_not_found());

        storage.put(item, &view("Report", "last")).await.unwrap();
        storage.put(item, &view("Report", "Approved")).await.unwrap();
        storage.put(item, &view("Invoice", "last")).await.unwrap();

        assert_eq!(storage.get(item, "ViewPoint/Report/last").await.unwrap(), view("Report", "last"));
        assert_eq!(
            storage.list_children(item, "ViewPoint").await.unwrap(),
            vec!["Invoice".to_string(), "Report".to_string()]
        );
        assert_eq!(
            storage.list_children(item, "ViewPoint/Report").await.unwrap(),
            vec!["Approved".to_string(), "last".to_string()]
        );

        storage.remove(item, "ViewPoint/Report/last").await.unwrap();
        assert_eq!(storage.record_count(item), 2);
        assert!(storage.remove(item, "ViewPoint/Report/last").await.unwrap_err().is_not_found());
        assert!(storage.list_children(ItemId::new(), "ViewPoint").await.unwrap().is_empty());
    }

    #[test]
    fn test_items_are_isolated() {
        let storage = InMemoryClusterStorage::new();
        let (first, second) = (ItemId::new(), ItemId::new());

        tokio_test::block_on(async {
            storage.put(first, &view("Report", "last")).await.unwrap();
            assert!(storage.get(second, "ViewPoint/Report/last").await.unwrap_err().is_not_found());
            assert!(storage.remove(second, "ViewPoint/Report/last").await.unwrap_err().is_not_found());
        });
        assert_eq!(storage.record_count(first), 1);
        assert_eq!(storage.record_count(second), 0);
    }
}
