//! Time-bounded eviction cache.
//!
//! Every `get`/`set` is O(1): the access is appended to a FIFO of visit
//! timestamps and to the bucket of keys touched at that instant. `sweep` only
//! walks buckets that have gone stale since the previous sweep and rechecks
//! each key's latest access before evicting it, since a key lands in a new
//! bucket on every access and only the newest one is authoritative.

use std::collections::VecDeque;
use std::hash::Hash;
use std::time::{Duration, Instant};

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

/// Source of monotonic time for the cache.
pub trait Clock {
    fn now(&self) -> Instant;
}

/// The process monotonic clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

struct CacheEntry<V> {
    value: V,
    last_access: Instant,
}

/// Key/value store whose entries expire after `timeout` without access.
///
/// Not thread safe; owned by the event loop thread.
pub struct EvictingCache<K, V, C = SystemClock> {
    timeout: Duration,
    clock: C,
    entries: FxHashMap<K, CacheEntry<V>>,
    buckets: FxHashMap<Instant, Vec<K>>,
    visits: VecDeque<Instant>,
}

impl<K, V> EvictingCache<K, V>
where
    K: Hash + Eq + Clone,
{
    pub fn new(timeout: Duration) -> Self {
        Self::with_clock(timeout, SystemClock)
    }
}

impl<K, V, C> EvictingCache<K, V, C>
where
    K: Hash + Eq + Clone,
    C: Clock,
{
    pub fn with_clock(timeout: Duration, clock: C) -> Self {
        Self {
            timeout,
            clock,
            entries: FxHashMap::default(),
            buckets: FxHashMap::default(),
            visits: VecDeque::new(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Look up a value, refreshing its last access time.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let now = self.clock.now();
        let entry = self.entries.get_mut(key)?;
        entry.last_access = now;
        self.buckets.entry(now).or_default().push(key.clone());
        self.visits.push_back(now);
        Some(&entry.value)
    }

    /// Refresh a key's last access time. Returns false when it is absent.
    pub fn touch(&mut self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Insert or replace a value, refreshing its last access time.
    pub fn set(&mut self, key: K, value: V) {
        let now = self.clock.now();
        self.buckets.entry(now).or_default().push(key.clone());
        self.visits.push_back(now);
        self.entries.insert(
            key,
            CacheEntry {
                value,
                last_access: now,
            },
        );
    }

    /// Remove a key. Its stale bucket references are skipped by later sweeps.
    pub fn delete(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|entry| entry.value)
    }

    /// Membership test that does not count as an access.
    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Evict every entry idle for longer than the timeout.
    ///
    /// `on_evict` runs at most once per distinct value per sweep, even when
    /// several evicted keys share it. Returns the number of evicted keys.
    pub fn sweep<F>(&mut self, mut on_evict: F) -> usize
    where
        V: Hash + Eq,
        F: FnMut(&K, &V),
    {
        let now = self.clock.now();
        let mut notified: FxHashSet<V> = FxHashSet::default();
        let mut swept = 0;

        while let Some(&oldest) = self.visits.front() {
            if now.saturating_duration_since(oldest) <= self.timeout {
                break;
            }
            self.visits.pop_front();

            // Duplicate visit timestamps share one bucket; the first pop takes it.
            let Some(keys) = self.buckets.remove(&oldest) else {
                continue;
            };

            for key in keys {
                let stale = match self.entries.get(&key) {
                    Some(entry) => now.saturating_duration_since(entry.last_access) > self.timeout,
                    None => false,
                };
                if !stale {
                    continue;
                }
                if let Some(entry) = self.entries.remove(&key) {
                    if !notified.contains(&entry.value) {
                        on_evict(&key, &entry.value);
                        notified.insert(entry.value);
                    }
                    swept += 1;
                }
            }
        }

        if swept > 0 {
            debug!(swept, remaining = self.entries.len(), "cache sweep");
        }
        swept
    }
}
