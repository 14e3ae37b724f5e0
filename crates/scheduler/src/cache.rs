use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lru::LruCache;
use promptbench_core::{TestCase, TestCaseId};
use tracing::debug;

struct CachedCases {
    cases: Arc<Vec<TestCase>>,
    stored_at: Instant,
}

/// LRU cache of loaded test-case sets with a time-to-live.
///
/// Keys are the requested ids, sorted, so the same set requested in any
/// order shares one entry.
pub struct TestCaseCache {
    cache: Mutex<LruCache<String, CachedCases>>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl TestCaseCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn key(ids: &[TestCaseId]) -> String {
        let mut sorted: Vec<&str> = ids.iter().map(String::as_str).collect();
        sorted.sort_unstable();
        sorted.join(",")
    }

    pub fn get(&self, ids: &[TestCaseId]) -> Option<Arc<Vec<TestCase>>> {
        let key = Self::key(ids);
        let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());

        let lookup = cache
            .get(&key)
            .map(|entry| (Arc::clone(&entry.cases), entry.stored_at.elapsed() <= self.ttl));
        let fresh = match lookup {
            Some((cases, true)) => Some(cases),
            Some((_, false)) => {
                cache.pop(&key);
                debug!(key = %key, "Test case cache entry expired");
                None
            }
            None => None,
        };

        match fresh {
            Some(cases) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(cases)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn put(&self, ids: &[TestCaseId], cases: Arc<Vec<TestCase>>) {
        let key = Self::key(ids);
        self.cache
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .put(
                key,
                CachedCases {
                    cases,
                    stored_at: Instant::now(),
                },
            );
    }

    pub fn clear(&self) {
        self.cache.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }

    pub fn len(&self) -> usize {
        self.cache.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}
