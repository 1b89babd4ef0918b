/// In-memory DID document cache
///
/// Bounded LRU with a fixed time-to-live per entry. Lookups and fills take
/// the lock separately, so a slow registry fetch never blocks other lookups.
/// Failed resolutions are not cached.
use crate::{
    identity::{DidDocument, DidResolver, IdentityError},
    metrics,
};
use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Identity cache configuration
#[derive(Debug, Clone)]
pub struct IdentityCacheConfig {
    pub ttl: Duration,
    pub capacity: usize,
}

impl Default for IdentityCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(24 * 60 * 60), // 24 hours
            capacity: 5_000_000,
        }
    }
}

struct CacheEntry {
    doc: Arc<DidDocument>,
    expires_at: Instant,
}

/// Caching wrapper around any DID resolver
pub struct CachingDidResolver {
    inner: Arc<dyn DidResolver>,
    ttl: Duration,
    entries: Mutex<LruCache<String, CacheEntry>>,
}

impl CachingDidResolver {
    pub fn new(inner: Arc<dyn DidResolver>, config: IdentityCacheConfig) -> Self {
        Self {
            inner,
            ttl: config.ttl,
            entries: Mutex::new(bounded_lru(config.capacity)),
        }
    }

    /// Resolve a DID, serving from cache while the entry is fresh
    pub async fn resolve(&self, did: &str) -> Result<Arc<DidDocument>, IdentityError> {
        if let Some(doc) = self.lookup(did) {
            metrics::record_cache_access("did", true);
            return Ok(doc);
        }
        metrics::record_cache_access("did", false);

        let doc = Arc::new(self.inner.resolve_did(did).await?);
        self.entries.lock().put(
            did.to_string(),
            CacheEntry {
                doc: Arc::clone(&doc),
                expires_at: Instant::now() + self.ttl,
            },
        );
        Ok(doc)
    }

    fn lookup(&self, did: &str) -> Option<Arc<DidDocument>> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let found = entries
            .get(did)
            .map(|entry| (entry.expires_at > now, Arc::clone(&entry.doc)));
        match found {
            Some((true, doc)) => Some(doc),
            Some((false, _)) => {
                entries.pop(did);
                None
            }
            None => None,
        }
    }

    /// Drop a cached document so the next lookup refetches it
    pub fn invalidate(&self, did: &str) {
        if self.entries.lock().pop(did).is_some() {
            debug!("Invalidated cached identity for {}", did);
        }
    }

    /// Remove every expired entry, returning how many were dropped
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for did in &expired {
            entries.pop(did);
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DidResolver for CachingDidResolver {
    async fn resolve_did(&self, did: &str) -> Result<DidDocument, IdentityError> {
        self.resolve(did).await.map(|doc| (*doc).clone())
    }
}

/// LRU bounded to `capacity` without preallocating the full capacity
pub(crate) fn bounded_lru<K: std::hash::Hash + Eq, V>(capacity: usize) -> LruCache<K, V> {
    let mut cache = LruCache::unbounded();
    cache.resize(NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN));
    cache
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingResolver {
        calls: AtomicUsize,
        fail_temporarily: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl DidResolver for CountingResolver {
        async fn resolve_did(&self, did: &str) -> Result<DidDocument, IdentityError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_temporarily.load(Ordering::SeqCst) {
                return Err(IdentityError::Temporary("registry down".to_string()));
            }
            Ok(DidDocument {
                id: did.to_string(),
                also_known_as: vec![],
                verification_method: vec![],
                service: vec![],
            })
        }
    }

    fn cache_with(
        inner: Arc<CountingResolver>,
        ttl: Duration,
        capacity: usize,
    ) -> CachingDidResolver {
        CachingDidResolver::new(inner, IdentityCacheConfig { ttl, capacity })
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_after_ttl() {
        let inner = Arc::new(CountingResolver::default());
        let cache = cache_with(Arc::clone(&inner), Duration::from_secs(60), 10);

        cache.resolve("did:plc:alice").await.unwrap();
        cache.resolve("did:plc:alice").await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(59)).await;
        cache.resolve("did:plc:alice").await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        cache.resolve("did:plc:alice").await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let inner = Arc::new(CountingResolver::default());
        inner.fail_temporarily.store(true, Ordering::SeqCst);
        let cache = cache_with(Arc::clone(&inner), Duration::from_secs(60), 10);

        let err = cache.resolve("did:plc:bob").await.unwrap_err();
        assert!(err.is_temporary());
        assert!(cache.is_empty());

        inner.fail_temporarily.store(false, Ordering::SeqCst);
        cache.resolve("did:plc:bob").await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_capacity_evicts_least_recent() {
        let inner = Arc::new(CountingResolver::default());
        let cache = cache_with(Arc::clone(&inner), Duration::from_secs(60), 2);

        cache.resolve("did:plc:a").await.unwrap();
        cache.resolve("did:plc:b").await.unwrap();
        cache.resolve("did:plc:a").await.unwrap();
        cache.resolve("did:plc:c").await.unwrap();
        assert_eq!(cache.len(), 2);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);

        // b was least recently used
        cache.resolve("did:plc:b").await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_and_purge() {
        let inner = Arc::new(CountingResolver::default());
        let cache = cache_with(Arc::clone(&inner), Duration::from_secs(10), 10);

        cache.resolve("did:plc:a").await.unwrap();
        cache.resolve("did:plc:b").await.unwrap();
        cache.invalidate("did:plc:a");
        assert_eq!(cache.len(), 1);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.is_empty());
    }
}
