use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

struct Entry<V> {
    value: V,
    last_used: Instant,
}

/// Map whose entries expire after an idle interval. Lookups refresh the
/// entry's timestamp; a background sweeper purges expired entries.
///
/// Shared by the NAT table and both proxy pools.
pub struct TimeoutDictionary<K, V> {
    entries: Mutex<HashMap<K, Entry<V>>>,
    timeout: Duration,
}

impl<K, V> TimeoutDictionary<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Returns the live value for `key`, refreshing its timestamp.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock().unwrap();
        let e = entries.get_mut(key)?;
        if e.last_used.elapsed() >= self.timeout {
            entries.remove(key);
            return None;
        }
        e.last_used = Instant::now();
        Some(e.value.clone())
    }

    pub fn insert(&self, key: K, value: V) {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            key,
            Entry {
                value,
                last_used: Instant::now(),
            },
        );
    }

    /// Returns the existing live value or inserts the one produced by `make`.
    /// The boolean is true when a new entry was created.
    pub fn get_or_insert_with<F: FnOnce() -> V>(&self, key: K, make: F) -> (V, bool) {
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(&key) {
            Some(e) if e.last_used.elapsed() < self.timeout => {
                e.last_used = Instant::now();
                (e.value.clone(), false)
            }
            _ => {
                let value = make();
                entries.insert(
                    key,
                    Entry {
                        value: value.clone(),
                        last_used: Instant::now(),
                    },
                );
                (value, true)
            }
        }
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.entries.lock().unwrap().remove(key).map(|e| e.value)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    /// Drops every expired entry, returning the removed values.
    pub fn cleanup(&self) -> Vec<V> {
        let mut entries = self.entries.lock().unwrap();
        let expired: Vec<K> = entries
            .iter()
            .filter(|(_, e)| e.last_used.elapsed() >= self.timeout)
            .map(|(k, _)| k.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|k| entries.remove(&k).map(|e| e.value))
            .collect()
    }

    pub fn values(&self) -> Vec<V> {
        self.entries
            .lock()
            .unwrap()
            .values()
            .map(|e| e.value.clone())
            .collect()
    }

    /// Periodic sweeper; one task per map, stopped by the owner's token.
    pub fn spawn_sweeper(
        self: &std::sync::Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let map = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let removed = map.cleanup().len();
                        if removed > 0 {
                            tracing::debug!(removed, remaining = map.len(), "timeout map: swept");
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        })
    }
}
