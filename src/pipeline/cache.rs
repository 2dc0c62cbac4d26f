// src/pipeline/cache.rs

//! In-memory result cache keyed by request fingerprint.
//!
//! Entries expire after a per-entry TTL and are evicted least-recently-used
//! first once the stored payload size exceeds the configured capacity. The
//! two policies are independent.
//!
//! Expiry is checked lazily on [`CacheStore::get`] and eagerly by
//! [`CacheStore::sweep_expired`], which [`CacheStore::spawn_sweeper`] runs on
//! an interval.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{AppError, Result};
use crate::models::{FetchResult, Fingerprint};

/// Snapshot of a cached result.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub payload: Arc<FetchResult>,
    pub created_at: Instant,
    pub expires_at: Instant,
    pub size_bytes: usize,
    pub hits: u64,
}

impl CacheEntry {
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Counters exposed for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: usize,
    pub capacity_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

struct Slot {
    entry: CacheEntry,
    /// Position in the recency index
    last_access: u64,
}

#[derive(Default)]
struct Inner {
    slots: HashMap<Fingerprint, Slot>,
    /// Access tick → fingerprint; the first key is the least recently used.
    recency: BTreeMap<u64, Fingerprint>,
    tick: u64,
    total_bytes: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

impl Inner {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn remove(&mut self, fingerprint: &Fingerprint) -> Option<Slot> {
        let slot = self.slots.remove(fingerprint)?;
        self.recency.remove(&slot.last_access);
        self.total_bytes -= slot.entry.size_bytes;
        Some(slot)
    }

    fn evict_lru(&mut self) -> Option<Fingerprint> {
        let (_, fingerprint) = self.recency.pop_first()?;
        if let Some(slot) = self.slots.remove(&fingerprint) {
            self.total_bytes -= slot.entry.size_bytes;
        }
        Some(fingerprint)
    }
}

/// Size-bounded TTL cache of fetch results.
pub struct CacheStore {
    capacity_bytes: usize,
    inner: Mutex<Inner>,
}

impl CacheStore {
    /// Create an empty cache holding at most `capacity_bytes` of payload.
    pub fn new(capacity_bytes: usize) -> Result<Self> {
        if capacity_bytes == 0 {
            return Err(AppError::config("cache capacity must be > 0 bytes"));
        }
        Ok(Self {
            capacity_bytes,
            inner: Mutex::new(Inner::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up a live entry and mark it as recently used.
    ///
    /// An expired entry is dropped and reported as a miss.
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        let now = Instant::now();
        let mut inner = self.lock();

        let expired = match inner.slots.get(fingerprint) {
            None => {
                inner.misses += 1;
                return None;
            }
            Some(slot) => slot.entry.is_expired_at(now),
        };

        if expired {
            inner.remove(fingerprint);
            inner.expirations += 1;
            inner.misses += 1;
            log::debug!("Cache entry {} expired on read", fingerprint.short());
            return None;
        }

        let tick = inner.next_tick();
        inner.hits += 1;
        let Inner {
            slots, recency, ..
        } = &mut *inner;
        let slot = slots.get_mut(fingerprint)?;
        recency.remove(&slot.last_access);
        recency.insert(tick, fingerprint.clone());
        slot.last_access = tick;
        slot.entry.hits += 1;
        Some(slot.entry.clone())
    }

    /// Look up a live entry without touching recency or the hit/miss counters.
    pub fn peek(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        let now = Instant::now();
        self.lock()
            .slots
            .get(fingerprint)
            .filter(|slot| !slot.entry.is_expired_at(now))
            .map(|slot| slot.entry.clone())
    }

    /// Insert or replace an entry, then evict least-recently-used entries
    /// until the cache fits its capacity again.
    ///
    /// Returns `false` when the payload alone is larger than the capacity;
    /// such a payload is not stored.
    pub fn put(&self, fingerprint: Fingerprint, payload: Arc<FetchResult>, ttl: Duration) -> bool {
        let size_bytes = payload.size_bytes();
        let now = Instant::now();
        let mut inner = self.lock();

        inner.remove(&fingerprint);

        if size_bytes > self.capacity_bytes {
            log::warn!(
                "Not caching {}: {} bytes exceeds capacity of {} bytes",
                fingerprint.short(),
                size_bytes,
                self.capacity_bytes
            );
            return false;
        }

        let tick = inner.next_tick();
        inner.recency.insert(tick, fingerprint.clone());
        inner.total_bytes += size_bytes;
        inner.slots.insert(
            fingerprint.clone(),
            Slot {
                entry: CacheEntry {
                    fingerprint,
                    payload,
                    created_at: now,
                    expires_at: now + ttl,
                    size_bytes,
                    hits: 0,
                },
                last_access: tick,
            },
        );

        while inner.total_bytes > self.capacity_bytes {
            match inner.evict_lru() {
                Some(evicted) => {
                    inner.evictions += 1;
                    log::debug!("Evicted {} to stay under capacity", evicted.short());
                }
                None => break,
            }
        }
        true
    }

    /// Remove an entry immediately. Returns whether one was present.
    pub fn invalidate(&self, fingerprint: &Fingerprint) -> bool {
        self.lock().remove(fingerprint).is_some()
    }

    /// Extend a live entry for another `ttl`. Expired entries are not revived.
    pub fn revalidate(&self, fingerprint: &Fingerprint, ttl: Duration) -> bool {
        let now = Instant::now();
        let mut inner = self.lock();
        match inner.slots.get_mut(fingerprint) {
            Some(slot) if !slot.entry.is_expired_at(now) => {
                slot.entry.expires_at = now + ttl;
                true
            }
            _ => false,
        }
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.lock();

        let expired: Vec<Fingerprint> = inner
            .slots
            .iter()
            .filter(|(_, slot)| slot.entry.is_expired_at(now))
            .map(|(fingerprint, _)| fingerprint.clone())
            .collect();

        for fingerprint in &expired {
            inner.remove(fingerprint);
        }
        inner.expirations += expired.len() as u64;
        expired.len()
    }

    /// Run [`sweep_expired`](Self::sweep_expired) every `interval` until the
    /// cache is dropped or the handle is aborted.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let cache = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                let removed = cache.sweep_expired();
                if removed > 0 {
                    log::debug!("Cache sweep removed {removed} expired entries");
                }
            }
        })
    }

    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_bytes(&self) -> usize {
        self.lock().total_bytes
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        CacheStats {
            entries: inner.slots.len(),
            total_bytes: inner.total_bytes,
            capacity_bytes: self.capacity_bytes,
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            expirations: inner.expirations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Tweet;
    use chrono::Utc;

    fn payload(content: &str) -> Arc<FetchResult> {
        Arc::new(FetchResult {
            records: vec![Tweet {
                username: "@user".into(),
                content: content.into(),
                ..Tweet::default()
            }],
            profile: None,
            media: vec![],
            fetched_at: Utc::now(),
            source_fresh: true,
        })
    }

    fn fp(name: &str) -> Fingerprint {
        Fingerprint::from(name)
    }

    /// Cache that fits exactly `n` payloads of the `payload("....")` shape.
    fn cache_for(n: usize) -> CacheStore {
        CacheStore::new(payload("....").size_bytes() * n).unwrap()
    }

    const MINUTE: Duration = Duration::from_secs(60);

    #[test]
    fn test_zero_capacity_is_rejected() {
        assert!(matches!(CacheStore::new(0), Err(AppError::Config(_))));
    }

    #[test]
    fn test_put_then_get() {
        let cache = cache_for(2);
        assert!(cache.put(fp("a"), payload("aaaa"), MINUTE));

        let entry = cache.get(&fp("a")).unwrap();
        assert_eq!(entry.payload.records[0].content, "aaaa");
        assert_eq!(entry.hits, 1);
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn test_miss_is_counted() {
        let cache = cache_for(1);
        assert!(cache.get(&fp("nope")).is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_peek_leaves_counters_and_recency_alone() {
        let cache = cache_for(2);
        assert!(cache.peek(&fp("a")).is_none());
        cache.put(fp("a"), payload("aaaa"), MINUTE);
        cache.put(fp("b"), payload("bbbb"), MINUTE);

        assert_eq!(cache.peek(&fp("a")).unwrap().hits, 0);
        assert_eq!(cache.stats().hits, 0);
        assert_eq!(cache.stats().misses, 0);

        // Peeking did not refresh "a", so it is still evicted first.
        cache.put(fp("c"), payload("cccc"), MINUTE);
        assert!(cache.peek(&fp("a")).is_none());
        assert!(cache.peek(&fp("b")).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_a_miss() {
        let cache = cache_for(2);
        cache.put(fp("a"), payload("aaaa"), MINUTE);

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(cache.get(&fp("a")).is_some());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cache.get(&fp("a")).is_none());
        assert!(cache.is_empty());
        assert_eq!(cache.stats().expirations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_revalidate_extends_live_entry_only() {
        let cache = cache_for(2);
        cache.put(fp("a"), payload("aaaa"), MINUTE);

        tokio::time::advance(Duration::from_secs(50)).await;
        assert!(cache.revalidate(&fp("a"), MINUTE));

        tokio::time::advance(Duration::from_secs(50)).await;
        assert!(cache.get(&fp("a")).is_some());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!cache.revalidate(&fp("a"), MINUTE));
        assert!(cache.get(&fp("a")).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_only_expired() {
        let cache = cache_for(3);
        cache.put(fp("short"), payload("aaaa"), Duration::from_secs(10));
        cache.put(fp("long"), payload("bbbb"), MINUTE);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cache.sweep_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&fp("long")).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweeper_runs() {
        let cache = Arc::new(cache_for(2));
        cache.put(fp("a"), payload("aaaa"), Duration::from_secs(5));
        let handle = cache.spawn_sweeper(Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(cache.is_empty());
        handle.abort();
    }

    #[test]
    fn test_lru_evicts_least_recently_accessed() {
        let cache = cache_for(3);
        cache.put(fp("a"), payload("aaaa"), MINUTE);
        cache.put(fp("b"), payload("bbbb"), MINUTE);
        cache.put(fp("c"), payload("cccc"), MINUTE);

        // "a" is the oldest insert but the most recently read.
        assert!(cache.get(&fp("a")).is_some());
        cache.put(fp("d"), payload("dddd"), MINUTE);

        assert!(cache.get(&fp("b")).is_none());
        assert!(cache.get(&fp("a")).is_some());
        assert!(cache.get(&fp("c")).is_some());
        assert!(cache.get(&fp("d")).is_some());
        assert_eq!(cache.stats().evictions, 1);
        assert!(cache.total_bytes() <= cache.stats().capacity_bytes);
    }

    #[test]
    fn test_large_insert_evicts_several() {
        let cache = cache_for(3);
        cache.put(fp("a"), payload("aaaa"), MINUTE);
        cache.put(fp("b"), payload("bbbb"), MINUTE);
        cache.put(fp("c"), payload("cccc"), MINUTE);

        let big = payload(&"x".repeat(payload("....").size_bytes() + 4));
        assert!(big.size_bytes() <= cache.stats().capacity_bytes);
        assert!(cache.put(fp("big"), big, MINUTE));

        assert!(cache.get(&fp("big")).is_some());
        assert!(cache.get(&fp("a")).is_none());
        assert!(cache.get(&fp("b")).is_none());
    }

    #[test]
    fn test_oversized_payload_is_not_stored() {
        let cache = cache_for(1);
        cache.put(fp("a"), payload("aaaa"), MINUTE);
        assert!(!cache.put(fp("a"), payload(&"x".repeat(10_000)), MINUTE));
        assert!(cache.get(&fp("a")).is_none());
        assert_eq!(cache.total_bytes(), 0);
    }

    #[test]
    fn test_replace_keeps_byte_accounting() {
        let cache = cache_for(2);
        cache.put(fp("a"), payload("aaaa"), MINUTE);
        cache.put(fp("a"), payload("bbbb"), MINUTE);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.total_bytes(), payload("....").size_bytes());
        assert_eq!(cache.get(&fp("a")).unwrap().payload.records[0].content, "bbbb");
    }

    #[test]
    fn test_invalidate() {
        let cache = cache_for(2);
        cache.put(fp("a"), payload("aaaa"), MINUTE);
        assert!(cache.invalidate(&fp("a")));
        assert!(!cache.invalidate(&fp("a")));
        assert!(cache.get(&fp("a")).is_none());
    }
}
