use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub type ExpireCallback<V> = Box<dyn FnOnce(V) + Send>;

struct Entry<V> {
    value: V,
    expires_at: Instant,
    on_expire: ExpireCallback<V>,
}

impl<V> Entry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }

    fn resolve(self) {
        (self.on_expire)(self.value);
    }
}

/// TTL-keyed table of pending explorations.
///
/// `set`, `get`, `pop` and the sweep share one lock. Whoever first observes an
/// expired entry removes it and runs its expiry callback while still holding
/// the lock, so an entry is either popped or expired, never both. Callbacks
/// must not call back into the same store.
pub struct PendingExplorationStore<K, V> {
    entries: Mutex<HashMap<K, Entry<V>>>,
}

impl<K, V> Default for PendingExplorationStore<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> PendingExplorationStore<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn set<F>(&self, key: K, value: V, ttl: Duration, on_expire: F)
    where
        F: FnOnce(V) + Send + 'static,
    {
        self.set_at(key, value, ttl, on_expire, Instant::now());
    }

    /// Replacing a live entry settles the old one through its own callback.
    pub fn set_at<F>(&self, key: K, value: V, ttl: Duration, on_expire: F, now: Instant)
    where
        F: FnOnce(V) + Send + 'static,
    {
        let entry = Entry {
            value,
            expires_at: now + ttl,
            on_expire: Box::new(on_expire),
        };
        let mut entries = self.entries.lock();
        if let Some(replaced) = entries.insert(key, entry) {
            replaced.resolve();
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.get_at(key, Instant::now())
    }

    pub fn get_at(&self, key: &K, now: Instant) -> Option<V> {
        let mut entries = self.entries.lock();
        let expired = entries.get(key)?.is_expired(now);
        if expired {
            if let Some(entry) = entries.remove(key) {
                entry.resolve();
            }
            return None;
        }
        entries.get(key).map(|e| e.value.clone())
    }

    pub fn pop(&self, key: &K) -> Option<V> {
        self.pop_at(key, Instant::now())
    }

    pub fn pop_at(&self, key: &K, now: Instant) -> Option<V> {
        let mut entries = self.entries.lock();
        let entry = entries.remove(key)?;
        if entry.is_expired(now) {
            entry.resolve();
            return None;
        }
        Some(entry.value)
    }

    /// Settles every expired entry; returns how many were resolved.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut entries = self.entries.lock();
        let expired: Vec<K> = entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            if let Some(entry) = entries.remove(key) {
                entry.resolve();
            }
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl<K, V> PendingExplorationStore<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + 'static,
{
    /// Runs the expiry sweep every `every` until the store is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let store = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    tracing::debug!("pending store dropped; sweeper exiting");
                    break;
                };
                let expired = store.sweep();
                if expired > 0 {
                    tracing::trace!(expired, "pending explorations expired");
                }
            }
        })
    }
}
