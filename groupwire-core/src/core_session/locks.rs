//! Per-group write locks
//!
//! One mutex per group id. Mutations of the same group queue up; different
//! groups never wait on each other.

use crate::core_mls::types::GroupId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Default)]
pub struct GroupLocks {
    locks: Mutex<HashMap<GroupId, Arc<Mutex<()>>>>,
}

impl GroupLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `group_id`
    pub async fn lock(&self, group_id: &GroupId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(group_id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Drop the lock entry of a group that no longer exists. Holders of a
    /// guard keep it until they release it.
    pub async fn remove(&self, group_id: &GroupId) {
        self.locks.lock().await.remove(group_id);
    }

    pub async fn clear(&self) {
        self.locks.lock().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.locks.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_group_is_serialized() {
        let locks = Arc::new(GroupLocks::new());
        let group_id = GroupId::new(vec![1]);
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let group_id = group_id.clone();
            let active = active.clone();
            let max_active = max_active.clone();
            tasks.push(tokio::spawn(async move {
                let _guard = locks.lock(&group_id).await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_active.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_different_groups_do_not_block() {
        let locks = GroupLocks::new();
        let _a = locks.lock(&GroupId::new(vec![1])).await;
        let b = tokio::time::timeout(Duration::from_secs(1), locks.lock(&GroupId::new(vec![2]))).await;
        assert!(b.is_ok());
        assert_eq!(locks.len().await, 2);

        locks.remove(&GroupId::new(vec![2])).await;
        assert_eq!(locks.len().await, 1);
        locks.clear().await;
        assert_eq!(locks.len().await, 0);
    }
}
