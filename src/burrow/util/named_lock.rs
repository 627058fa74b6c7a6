use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Registry of async mutexes keyed by name. Used to serialize session
/// recovery so at most one access-manager call runs per session id across
/// concurrent requests.
#[derive(Default)]
pub struct NamedLockRegistry {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl NamedLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, name: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Drops idle locks so the registry does not grow without bound.
    pub fn purge(&self) {
        self.locks
            .retain(|_, lock| Arc::strong_count(lock) > 1 || lock.try_lock().is_err());
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn serializes_same_name() {
        let reg = Arc::new(NamedLockRegistry::new());
        let running = Arc::new(AtomicU32::new(0));
        let max_seen = Arc::new(AtomicU32::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let reg = reg.clone();
            let running = running.clone();
            let max_seen = max_seen.clone();
            tasks.push(tokio::spawn(async move {
                let _guard = reg.lock("session-1").await;
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_names_do_not_block() {
        let reg = NamedLockRegistry::new();
        let _a = reg.lock("a").await;
        // Must not deadlock.
        let _b = reg.lock("b").await;
        assert_eq!(reg.len(), 2);
    }

    #[tokio::test]
    async fn purge_drops_idle_locks() {
        let reg = NamedLockRegistry::new();
        {
            let _g = reg.lock("gone").await;
        }
        reg.purge();
        assert!(reg.is_empty());
    }
}
