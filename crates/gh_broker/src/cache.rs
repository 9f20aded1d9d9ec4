use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use tokio::sync::Mutex;

/// A successful GET response kept for conditional revalidation. GitHub does
/// not charge `304 Not Modified` answers against the rate limit.
#[derive(Clone, Debug)]
pub struct CachedResponse {
    pub etag: String,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub stored_at: Instant,
}

impl CachedResponse {
    pub fn is_fresh(&self, ttl: Duration) -> bool {
        self.stored_at.elapsed() < ttl
    }
}

#[derive(Clone)]
pub struct ResponseCache {
    inner: Arc<Mutex<LruCache<String, CachedResponse>>>,
    ttl: Duration,
}

impl ResponseCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(Mutex::new(LruCache::new(capacity))),
            ttl,
        }
    }

    /// Returns the entry for `key` if it is still within the TTL; stale
    /// entries are evicted on the way.
    pub async fn get(&self, key: &str) -> Option<CachedResponse> {
        let mut guard = self.inner.lock().await;
        let fresh = guard.get(key).map(|entry| entry.is_fresh(self.ttl))?;
        if fresh {
            guard.get(key).cloned()
        } else {
            guard.pop(key);
            None
        }
    }

    pub async fn put(&self, key: String, value: CachedResponse) {
        self.inner.lock().await.put(key, value);
    }
}
