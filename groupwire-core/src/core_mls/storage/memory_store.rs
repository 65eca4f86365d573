//! In-Memory Snapshot Store
//!
//! Backs tests and the CLI demo. Cloning shares the underlying map, which is
//! how tests model "the same disk after a restart".

use crate::core_mls::traits::storage::{SnapshotKey, StateSnapshotStore, StoreError, StoreResult};
use crate::core_mls::types::GroupId;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Clone, Default)]
pub struct MemorySnapshotStore {
    records: Arc<RwLock<HashMap<SnapshotKey, Vec<u8>>>>,
    fail_writes: Arc<AtomicBool>,
    fail_journal_writes: Arc<AtomicBool>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `save` and `delete` fail (simulated disk fault)
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make writes of the session journal fail while group and service
    /// records still succeed
    pub fn set_fail_journal_writes(&self, fail: bool) {
        self.fail_journal_writes.store(fail, Ordering::SeqCst);
    }

    /// Overwrite a record with raw bytes, bypassing the write fault switch
    pub async fn put_raw(&self, key: SnapshotKey, bytes: Vec<u8>) {
        self.records.write().await.insert(key, bytes);
    }

    pub async fn contains(&self, key: &SnapshotKey) -> bool {
        self.records.read().await.contains_key(key)
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    fn check_writable(&self, key: &SnapshotKey) -> StoreResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("writes disabled".to_string()));
        }
        if *key == SnapshotKey::Journal && self.fail_journal_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("journal writes disabled".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl StateSnapshotStore for MemorySnapshotStore {
    async fn save(&self, key: &SnapshotKey, bytes: &[u8]) -> StoreResult<()> {
        self.check_writable(key)?;
        self.records.write().await.insert(key.clone(), bytes.to_vec());
        Ok(())
    }

    async fn load(&self, key: &SnapshotKey) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn delete(&self, key: &SnapshotKey) -> StoreResult<()> {
        self.check_writable(key)?;
        self.records.write().await.remove(key);
        Ok(())
    }

    async fn list_groups(&self) -> StoreResult<Vec<GroupId>> {
        let records = self.records.read().await;
        let mut groups: Vec<GroupId> = records
            .keys()
            .filter_map(|key| match key {
                SnapshotKey::Group(id) => Some(id.clone()),
                _ => None,
            })
            .collect();
        groups.sort();
        Ok(groups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_load_delete() {
        let store = MemorySnapshotStore::new();
        let key = SnapshotKey::Group(GroupId::new(vec![1, 2, 3]));

        assert!(store.load(&key).await.unwrap().is_none());

        store.save(&key, b"state").await.unwrap();
        assert_eq!(store.load(&key).await.unwrap().as_deref(), Some(&b"state"[..]));

        store.delete(&key).await.unwrap();
        assert!(store.load(&key).await.unwrap().is_none());

        // Deleting twice is fine
        store.delete(&key).await.unwrap();
    }

    #[tokio::test]
    async fn test_list_groups_ignores_reserved_keys() {
        let store = MemorySnapshotStore::new();
        store.save(&SnapshotKey::Service, b"svc").await.unwrap();
        store.save(&SnapshotKey::Journal, b"{}").await.unwrap();
        store
            .save(&SnapshotKey::Group(GroupId::new(vec![2])), b"b")
            .await
            .unwrap();
        store
            .save(&SnapshotKey::Group(GroupId::new(vec![1])), b"a")
            .await
            .unwrap();

        let groups = store.list_groups().await.unwrap();
        assert_eq!(groups, vec![GroupId::new(vec![1]), GroupId::new(vec![2])]);
    }

    #[tokio::test]
    async fn test_clones_share_records() {
        let store = MemorySnapshotStore::new();
        let restarted = store.clone();

        store.save(&SnapshotKey::Service, b"svc").await.unwrap();
        assert!(restarted.contains(&SnapshotKey::Service).await);
    }

    #[tokio::test]
    async fn test_write_fault() {
        let store = MemorySnapshotStore::new();
        store.set_fail_writes(true);

        let err = store.save(&SnapshotKey::Service, b"svc").await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert!(store.is_empty().await);

        store.set_fail_writes(false);
        store.save(&SnapshotKey::Service, b"svc").await.unwrap();
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_journal_write_fault() {
        let store = MemorySnapshotStore::new();
        store.set_fail_journal_writes(true);

        assert!(store.save(&SnapshotKey::Journal, b"{}").await.is_err());
        assert!(store.delete(&SnapshotKey::Journal).await.is_err());
        store.save(&SnapshotKey::Service, b"svc").await.unwrap();
        assert!(!store.contains(&SnapshotKey::Journal).await);
    }
}
