use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

/// Per-project turn serialization. Turns for one project run one at a time;
/// different projects never contend.
#[derive(Clone, Default)]
pub struct TurnLocks {
    locks: Arc<RwLock<HashMap<String, Arc<Mutex<()>>>>>,
}

impl TurnLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until no other turn holds `id`. The lock is released when the
    /// returned guard drops.
    pub async fn acquire(&self, id: &str) -> OwnedMutexGuard<()> {
        self.lock_for(id).await.lock_owned().await
    }

    /// Drops the entry for `id` when nobody holds or waits on it.
    pub async fn forget(&self, id: &str) {
        let mut locks = self.locks.write().await;
        if locks
            .get(id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(id);
        }
    }

    async fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        if let Some(lock) = self.locks.read().await.get(id) {
            return lock.clone();
        }
        self.locks
            .write()
            .await
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn is_free(locks: &TurnLocks, id: &str) -> bool {
        locks.lock_for(id).await.try_lock().is_ok()
    }

    #[tokio::test]
    async fn same_id_is_exclusive() {
        let locks = TurnLocks::new();
        let guard = locks.acquire("p1").await;
        assert!(!is_free(&locks, "p1").await);
        drop(guard);
        assert!(is_free(&locks, "p1").await);
    }

    #[tokio::test]
    async fn different_ids_do_not_contend() {
        let locks = TurnLocks::new();
        let _first = locks.acquire("p1").await;
        assert!(is_free(&locks, "p2").await);
    }

    #[tokio::test]
    async fn forget_keeps_held_locks() {
        let locks = TurnLocks::new();
        let guard = locks.acquire("p1").await;
        locks.forget("p1").await;
        assert!(!is_free(&locks, "p1").await);
        drop(guard);
        locks.forget("p1").await;
        assert!(locks.locks.read().await.is_empty());
    }
}
