use crate::{Cache, CoreError};
use async_trait::async_trait;
use moka::Expiry;
use moka::future::Cache as MokaCache;
use std::time::{Duration, Instant};

#[derive(Clone, Debug)]
struct Entry {
    bytes: Vec<u8>,
    ttl: Duration,
}

/// Expires each entry after the TTL it was stored with.
struct PerEntryTtl;

impl Expiry<String, Entry> for PerEntryTtl {
    fn expire_after_create(&self, _key: &String, value: &Entry, _created_at: Instant) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Entry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Moka-backed Cache port. Holds sessions in single-process mode and in tests.
#[derive(Clone)]
pub struct InMemoryCache {
    cache: MokaCache<String, Entry>,
    default_ttl: Duration,
}

impl InMemoryCache {
    pub fn new(max_capacity: u64, default_ttl_seconds: u64) -> Self {
        let cache = MokaCache::builder()
            .max_capacity(max_capacity)
            .expire_after(PerEntryTtl)
            .build();
        Self {
            cache,
            default_ttl: Duration::from_secs(default_ttl_seconds),
        }
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new(10_000, 3600)
    }
}

#[async_trait]
impl Cache for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CoreError> {
        Ok(self.cache.get(key).await.map(|entry| entry.bytes))
    }

    async fn set(
        &self,
        key: &str,
        value: &[u8],
        ttl_seconds: Option<u64>,
    ) -> Result<(), CoreError> {
        let ttl = ttl_seconds.map_or(self.default_ttl, Duration::from_secs);
        let entry = Entry {
            bytes: value.to_vec(),
            ttl,
        };
        self.cache.insert(key.to_string(), entry).await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CoreError> {
        self.cache.invalidate(key).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[tokio::test]
    async fn test_session_round_trip_and_logout() {
        let cache = InMemoryCache::default();
        cache.set("session:abc", b"{\"id\":\"u1\"}", None).await.unwrap();
        assert_eq!(
            cache.get("session:abc").await.unwrap(),
            Some(b"{\"id\":\"u1\"}".to_vec())
        );

        cache.delete("session:abc").await.unwrap();
        assert_eq!(cache.get("session:abc").await.unwrap(), None);
        assert_eq!(cache.get("session:never").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_explicit_ttl_overrides_default() {
        let cache = InMemoryCache::new(100, 3600);
        cache.set("short", b"1", Some(1)).await.unwrap();
        cache.set("long", b"2", None).await.unwrap();

        sleep(Duration::from_millis(1100)).await;

        assert_eq!(cache.get("short").await.unwrap(), None);
        assert_eq!(cache.get("long").await.unwrap(), Some(b"2".to_vec()));
    }

    #[tokio::test]
    async fn test_default_ttl_applies() {
        let cache = InMemoryCache::new(100, 1);
        cache.set("k", b"v", None).await.unwrap();
        sleep(Duration::from_millis(1100)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
    }
}
