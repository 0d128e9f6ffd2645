//! # Bounded Content Cache
//!
//! Size- and age-bounded payload store consulted before a transfer is
//! scheduled.
//!
//! - Size pressure evicts the entry with the lowest `(priority,
//!   last_accessed_at)` first, repeating until the new entry fits.
//! - Entries older than `max_age` (by creation time) are removed on access
//!   and by [`ContentCache::sweep_expired`].
//! - Keys pinned by in-flight transfers are never evicted. If the pinned
//!   set alone prevents a new entry from fitting, the insert is refused and
//!   the cache is left untouched.

use std::collections::HashMap;

use bytes::Bytes;
use quanta::{Clock, Instant};
use tracing::debug;

use super::Priority;
use crate::config::CacheConfig;
use crate::error::CacheError;

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: String,
    pub size_bytes: u64,
    pub priority: Priority,
    pub created_at: Instant,
    pub last_accessed_at: Instant,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub insertions: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub entries: usize,
    pub total_bytes: u64,
    pub max_size_bytes: u64,
}

pub struct ContentCache {
    config: CacheConfig,
    clock: Clock,
    entries: HashMap<String, CacheEntry>,
    total_bytes: u64,
    pins: HashMap<String, u32>,
    stats: CacheStats,
}

impl ContentCache {
    pub fn new(config: CacheConfig, clock: Clock) -> Self {
        ContentCache {
            config,
            clock,
            entries: HashMap::new(),
            total_bytes: 0,
            pins: HashMap::new(),
            stats: CacheStats::default(),
        }
    }

    /// Payload for `key`, refreshing its access time. Expired entries are
    /// dropped and reported as a miss.
    pub fn get(&mut self, key: &str) -> Option<Bytes> {
        let now = self.clock.now();
        if self.is_expired_at(key, now) {
            self.remove_entry(key);
            self.stats.expirations += 1;
        }
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.last_accessed_at = now;
                self.stats.hits += 1;
                Some(entry.payload.clone())
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Whether a fresh entry exists, without touching access time or stats.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key) && !self.is_expired_at(key, self.clock.now())
    }

    pub fn entry(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Insert or overwrite. Returns the keys evicted to make room.
    pub fn put(
        &mut self,
        key: impl Into<String>,
        payload: Bytes,
        priority: Priority,
    ) -> Result<Vec<String>, CacheError> {
        let key = key.into();
        let size = payload.len() as u64;
        let ceiling = self.config.max_size_bytes;
        if size > ceiling {
            return Err(CacheError::TooLarge { size, ceiling });
        }

        let existing = self.entries.get(&key).map(|e| e.size_bytes).unwrap_or(0);
        let projected = self.total_bytes.saturating_sub(existing) + size;
        let needed = projected.saturating_sub(ceiling);

        let mut victims: Vec<&CacheEntry> = self
            .entries
            .values()
            .filter(|e| e.key != key && !self.is_pinned(&e.key))
            .collect();
        let evictable: u64 = victims.iter().map(|e| e.size_bytes).sum();
        if needed > evictable {
            return Err(CacheError::Pinned { needed });
        }
        victims.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.last_accessed_at.cmp(&b.last_accessed_at))
                .then(a.key.cmp(&b.key))
        });

        let mut freed = 0u64;
        let mut evicted = Vec::new();
        for victim in victims {
            if freed >= needed {
                break;
            }
            freed += victim.size_bytes;
            evicted.push(victim.key.clone());
        }
        for k in &evicted {
            self.remove_entry(k);
            self.stats.evictions += 1;
            debug!(key = %k, "cache eviction");
        }

        let now = self.clock.now();
        self.remove_entry(&key);
        self.total_bytes += size;
        self.entries.insert(
            key.clone(),
            CacheEntry {
                key,
                size_bytes: size,
                priority,
                created_at: now,
                last_accessed_at: now,
                payload,
            },
        );
        self.stats.insertions += 1;

        debug_assert!(
            self.total_bytes <= ceiling,
            "cache over ceiling: {} > {}",
            self.total_bytes,
            ceiling
        );
        Ok(evicted)
    }

    /// Remove an entry regardless of pins.
    pub fn invalidate(&mut self, key: &str) -> bool {
        self.remove_entry(key).is_some()
    }

    /// Remove every unpinned entry older than `max_age`.
    pub fn sweep_expired(&mut self) -> Vec<String> {
        let now = self.clock.now();
        let expired: Vec<String> = self
            .entries
            .keys()
            .filter(|k| self.is_expired_at(k, now))
            .cloned()
            .collect();
        for k in &expired {
            self.remove_entry(k);
            self.stats.expirations += 1;
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "expired cache entries swept");
        }
        expired
    }

    /// Protect `key` from eviction while a transfer references it.
    pub fn pin(&mut self, key: &str) {
        *self.pins.entry(key.to_string()).or_insert(0) += 1;
    }

    pub fn unpin(&mut self, key: &str) {
        if let Some(count) = self.pins.get_mut(key) {
            *count -= 1;
            if *count == 0 {
                self.pins.remove(key);
            }
        }
    }

    pub fn is_pinned(&self, key: &str) -> bool {
        self.pins.contains_key(key)
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            total_bytes: self.total_bytes,
            max_size_bytes: self.config.max_size_bytes,
            ..self.stats
        }
    }

    fn is_expired_at(&self, key: &str, now: Instant) -> bool {
        !self.is_pinned(key)
            && self
                .entries
                .get(key)
                .is_some_and(|e| now.saturating_duration_since(e.created_at) > self.config.max_age)
    }

    fn remove_entry(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        debug_assert!(self.total_bytes >= entry.size_bytes);
        self.total_bytes = self.total_bytes.saturating_sub(entry.size_bytes);
        Some(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn cache(max: u64) -> (ContentCache, Arc<quanta::Mock>) {
        let (clock, mock) = Clock::mock();
        mock.increment(Duration::from_secs(1));
        let cache = ContentCache::new(
            CacheConfig {
                max_size_bytes: max,
                max_age: Duration::from_secs(60),
            },
            clock,
        );
        (cache, mock)
    }

    fn payload(n: usize) -> Bytes {
        Bytes::from(vec![7u8; n])
    }

    #[test]
    fn get_hits_and_misses() {
        let (mut c, _mock) = cache(100);
        c.put("a", payload(10), Priority::Normal).unwrap();
        assert_eq!(c.get("a").unwrap().len(), 10);
        assert!(c.get("b").is_none());
        let s = c.stats();
        assert_eq!((s.hits, s.misses, s.entries, s.total_bytes), (1, 1, 1, 10));
    }

    #[test]
    fn low_priority_recent_entry_goes_before_high_priority_old_one() {
        let (mut c, mock) = cache(100);
        c.put("B", payload(50), Priority::Essential).unwrap(); // t0
        mock.increment(Duration::from_secs(1));
        c.put("A", payload(50), Priority::Low).unwrap(); // t1
        mock.increment(Duration::from_secs(1));
        let evicted = c.put("C", payload(10), Priority::Normal).unwrap();
        assert_eq!(evicted, vec!["A".to_string()]);
        assert!(c.contains("B"));
        assert!(c.contains("C"));
    }

    #[test]
    fn equal_priority_evicts_least_recently_used() {
        let (mut c, mock) = cache(30);
        c.put("x", payload(10), Priority::Normal).unwrap();
        mock.increment(Duration::from_secs(1));
        c.put("y", payload(10), Priority::Normal).unwrap();
        mock.increment(Duration::from_secs(1));
        c.put("z", payload(10), Priority::Normal).unwrap();
        mock.increment(Duration::from_secs(1));
        c.get("x");
        let evicted = c.put("w", payload(10), Priority::Normal).unwrap();
        assert_eq!(evicted, vec!["y".to_string()]);
    }

    #[test]
    fn overwrite_replaces_size() {
        let (mut c, _mock) = cache(100);
        c.put("a", payload(60), Priority::Normal).unwrap();
        let evicted = c.put("a", payload(90), Priority::Normal).unwrap();
        assert!(evicted.is_empty());
        assert_eq!(c.total_bytes(), 90);
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn oversized_entry_rejected() {
        let (mut c, _mock) = cache(10);
        assert_eq!(
            c.put("big", payload(11), Priority::Essential),
            Err(CacheError::TooLarge {
                size: 11,
                ceiling: 10
            })
        );
        assert!(c.is_empty());
    }

    #[test]
    fn pinned_entries_survive_pressure() {
        let (mut c, _mock) = cache(100);
        c.put("pinned", payload(60), Priority::Low).unwrap();
        c.put("other", payload(30), Priority::Essential).unwrap();
        c.pin("pinned");
        let evicted = c.put("new", payload(30), Priority::Normal).unwrap();
        assert_eq!(evicted, vec!["other".to_string()]);
        assert!(c.contains("pinned"));

        // only the pinned entry is left to evict
        assert_eq!(
            c.put("huge", payload(80), Priority::Normal),
            Err(CacheError::Pinned { needed: 70 })
        );
        assert_eq!(c.total_bytes(), 90);

        c.unpin("pinned");
        assert!(c.put("huge", payload(80), Priority::Normal).is_ok());
        assert!(!c.contains("pinned"));
    }

    #[test]
    fn expired_entries_are_swept() {
        let (mut c, mock) = cache(100);
        c.put("old", payload(10), Priority::Essential).unwrap();
        c.put("held", payload(10), Priority::Essential).unwrap();
        c.pin("held");
        mock.increment(Duration::from_secs(30));
        c.put("young", payload(10), Priority::Low).unwrap();
        mock.increment(Duration::from_secs(31));

        let mut swept = c.sweep_expired();
        swept.sort();
        assert_eq!(swept, vec!["old".to_string()]);
        assert!(c.contains("young"));
        assert!(c.contains("held"));
    }

    #[test]
    fn expired_entry_is_a_miss_on_access() {
        let (mut c, mock) = cache(100);
        c.put("a", payload(10), Priority::Normal).unwrap();
        mock.increment(Duration::from_secs(61));
        assert!(c.get("a").is_none());
        assert_eq!(c.total_bytes(), 0);
        assert_eq!(c.stats().expirations, 1);
    }
}
