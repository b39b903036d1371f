//! Fingerprint-keyed result cache with a fixed TTL.
//!
//! Expiry is lazy: an entry older than the TTL is dropped by the lookup that
//! finds it. `purge_expired` sweeps the rest.

use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::core::fingerprint::Fingerprint;

pub const DEFAULT_TTL: Duration = Duration::from_secs(10 * 60);

struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
}

pub struct ResultCache<V> {
    entries: DashMap<Fingerprint, CacheEntry<V>>,
    ttl: Duration,
}

impl<V: Clone> ResultCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get(&self, key: &Fingerprint) -> Option<V> {
        self.get_at(key, Instant::now())
    }

    pub fn set(&self, key: Fingerprint, value: V) {
        self.set_at(key, value, Instant::now());
    }

    pub fn remove(&self, key: &Fingerprint) -> Option<V> {
        self.entries.remove(key).map(|(_, entry)| entry.value)
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.entries
            .retain(|_, entry| !is_expired(entry.inserted_at, now, self.ttl));
    }

    fn get_at(&self, key: &Fingerprint, now: Instant) -> Option<V> {
        let inserted_at = {
            let entry = self.entries.get(key)?;
            if !is_expired(entry.inserted_at, now, self.ttl) {
                return Some(entry.value.clone());
            }
            entry.inserted_at
        };

        // Another writer may have refreshed the slot since the read above.
        self.entries
            .remove_if(key, |_, entry| entry.inserted_at == inserted_at);
        None
    }

    fn set_at(&self, key: Fingerprint, value: V, now: Instant) {
        self.entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: now,
            },
        );
    }
}

// Strictly older than the TTL; an entry exactly `ttl` old is still served.
fn is_expired(inserted_at: Instant, now: Instant, ttl: Duration) -> bool {
    now.saturating_duration_since(inserted_at) > ttl
}
