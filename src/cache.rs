//! Namespaced, TTL-bound key/value cache shared by the session and throttling stores.
//!
//! Backends implement [`CacheStore`] over raw JSON strings; [`Cache`] adds the
//! application namespace, typed (de)serialization through sonic-rs and
//! cancellation. No backend offers cross-key atomicity. Single-key
//! optimistic updates are available through `compare_and_swap`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::error::{AppError, Result};

/// Sets `KEYS[1]` to `ARGV[3]` with a `ARGV[4]` millisecond TTL only when the
/// current value matches the caller's snapshot. `ARGV[1]` is `"1"` when a
/// value was expected at all, `ARGV[2]` the expected value.
const COMPARE_AND_SWAP_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '0' then
    if current then return 0 end
elseif current ~= ARGV[2] then
    return 0
end
redis.call('SET', KEYS[1], ARGV[3], 'PX', ARGV[4])
return 1
"#;

/// A raw cache backend.
#[async_trait]
pub trait CacheStore: Send + Sync + 'static {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<String>>;

    async fn set(&self, namespace: &str, key: &str, value: &str, ttl: Duration) -> Result<()>;

    async fn remove(&self, namespace: &str, key: &str) -> Result<()>;

    /// Writes `value` only if the stored value still equals `expected`
    /// (`None` meaning "no entry"). Returns whether the write happened.
    async fn compare_and_swap(
        &self,
        namespace: &str,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Duration,
    ) -> Result<bool>;
}

fn full_key(namespace: &str, key: &str) -> String {
    format!("{}:{}", namespace, key)
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

/// Redis-backed cache shared by every service instance.
#[derive(Clone)]
pub struct RedisCache {
    redis: ConnectionManager,
    cas: redis::Script,
}

impl RedisCache {
    pub fn new(redis: ConnectionManager) -> Self {
        Self {
            redis,
            cas: redis::Script::new(COMPARE_AND_SWAP_SCRIPT),
        }
    }

    /// Opens a pooled connection manager for `redis_url`.
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;
        tracing::info!("✅ Redis Connection Manager initialized (pooled)");
        Ok(Self::new(redis))
    }
}

#[async_trait]
impl CacheStore for RedisCache {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<String>> {
        let value: Option<String> = self.redis.clone().get(full_key(namespace, key)).await?;
        Ok(value)
    }

    async fn set(&self, namespace: &str, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let _: () = self
            .redis
            .clone()
            .pset_ex(full_key(namespace, key), value, ttl_millis(ttl))
            .await?;
        Ok(())
    }

    async fn remove(&self, namespace: &str, key: &str) -> Result<()> {
        let _: () = self.redis.clone().del(full_key(namespace, key)).await?;
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        namespace: &str,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let swapped: i32 = self
            .cas
            .key(full_key(namespace, key))
            .arg(if expected.is_some() { "1" } else { "0" })
            .arg(expected.unwrap_or(""))
            .arg(value)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut self.redis.clone())
            .await?;
        Ok(swapped == 1)
    }
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: String,
    expires_at: DateTime<Utc>,
}

/// In-process cache with clock-driven expiry. Used by tests and single-node tooling.
#[derive(Clone)]
pub struct MemoryCache {
    entries: Arc<RwLock<HashMap<String, MemoryEntry>>>,
    clock: Arc<dyn Clock>,
}

impl MemoryCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            clock,
        }
    }

    fn expiry(&self, ttl: Duration) -> DateTime<Utc> {
        let ttl = chrono::Duration::milliseconds(ttl_millis(ttl) as i64);
        self.clock.now() + ttl
    }

    /// Number of live entries.
    pub async fn len(&self) -> usize {
        let now = self.clock.now();
        let entries = self.entries.read().await;
        entries.values().filter(|e| e.expires_at > now).count()
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<String>> {
        let now = self.clock.now();
        let entries = self.entries.read().await;
        Ok(entries
            .get(&full_key(namespace, key))
            .filter(|e| e.expires_at > now)
            .map(|e| e.value.clone()))
    }

    async fn set(&self, namespace: &str, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let entry = MemoryEntry {
            value: value.to_string(),
            expires_at: self.expiry(ttl),
        };
        let mut entries = self.entries.write().await;
        let now = self.clock.now();
        entries.retain(|_, e| e.expires_at > now);
        entries.insert(full_key(namespace, key), entry);
        Ok(())
    }

    async fn remove(&self, namespace: &str, key: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.remove(&full_key(namespace, key));
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        namespace: &str,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let key = full_key(namespace, key);
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        let current = entries
            .get(&key)
            .filter(|e| e.expires_at > now)
            .map(|e| e.value.as_str());
        if current != expected {
            return Ok(false);
        }
        entries.insert(
            key,
            MemoryEntry {
                value: value.to_string(),
                expires_at: self.expiry(ttl),
            },
        );
        Ok(true)
    }
}

/// Runs `fut` unless `cancel` fires first.
pub(crate) async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(AppError::Cancelled),
        result = fut => result,
    }
}

/// Typed, namespaced view over a [`CacheStore`].
#[derive(Clone)]
pub struct Cache {
    store: Arc<dyn CacheStore>,
    namespace: Arc<str>,
}

impl Cache {
    pub fn new(store: Arc<dyn CacheStore>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: Arc::from(namespace.into()),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Loads the raw JSON stored under `key`.
    pub async fn get_raw(&self, key: &str, cancel: &CancellationToken) -> Result<Option<String>> {
        cancellable(cancel, self.store.get(&self.namespace, key)).await
    }

    /// Loads and decodes the value under `key`. Entries that no longer decode
    /// are reported as misses.
    pub async fn get<T: DeserializeOwned>(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<T>> {
        Ok(self
            .get_raw(key, cancel)
            .await?
            .and_then(|raw| decode(key, &raw)))
    }

    pub async fn set<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let raw = sonic_rs::to_string(value)?;
        cancellable(cancel, self.store.set(&self.namespace, key, &raw, ttl)).await
    }

    pub async fn remove(&self, key: &str, cancel: &CancellationToken) -> Result<()> {
        cancellable(cancel, self.store.remove(&self.namespace, key)).await
    }

    /// Stores `value` only if the entry still holds `expected` raw JSON.
    pub async fn compare_and_swap<T: Serialize>(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &T,
        ttl: Duration,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let raw = sonic_rs::to_string(value)?;
        cancellable(
            cancel,
            self.store
                .compare_and_swap(&self.namespace, key, expected, &raw, ttl),
        )
        .await
    }
}

/// Decodes a cached record, logging and discarding corrupt entries.
pub(crate) fn decode<T: DeserializeOwned>(key: &str, raw: &str) -> Option<T> {
    match sonic_rs::from_str(raw) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(key, error = %e, "❌ Discarding undecodable cache entry");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn memory_cache() -> (Arc<ManualClock>, Cache) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(MemoryCache::new(clock.clone()));
        (clock, Cache::new(store, "test"))
    }

    #[tokio::test]
    async fn entries_expire_with_the_clock() {
        let (clock, cache) = memory_cache();
        let cancel = CancellationToken::new();

        cache
            .set("k", &42u32, Duration::from_secs(10), &cancel)
            .await
            .unwrap();
        assert_eq!(cache.get::<u32>("k", &cancel).await.unwrap(), Some(42));

        clock.advance(chrono::Duration::seconds(11));
        assert_eq!(cache.get::<u32>("k", &cancel).await.unwrap(), None);
    }

    #[tokio::test]
    async fn namespaces_do_not_collide() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store: Arc<dyn CacheStore> = Arc::new(MemoryCache::new(clock));
        let first = Cache::new(store.clone(), "app-one");
        let second = Cache::new(store, "app-two");
        let cancel = CancellationToken::new();

        first
            .set("shared", &"one", Duration::from_secs(60), &cancel)
            .await
            .unwrap();
        assert_eq!(second.get::<String>("shared", &cancel).await.unwrap(), None);
    }

    #[tokio::test]
    async fn compare_and_swap_rejects_stale_snapshot() {
        let (_clock, cache) = memory_cache();
        let cancel = CancellationToken::new();
        let ttl = Duration::from_secs(60);

        assert!(cache.compare_and_swap("k", None, &1u32, ttl, &cancel).await.unwrap());
        assert!(!cache.compare_and_swap("k", None, &2u32, ttl, &cancel).await.unwrap());

        let current = cache.get_raw("k", &cancel).await.unwrap();
        assert_eq!(current.as_deref(), Some("1"));
        assert!(cache
            .compare_and_swap("k", current.as_deref(), &3u32, ttl, &cancel)
            .await
            .unwrap());
        assert_eq!(cache.get::<u32>("k", &cancel).await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn corrupt_entries_read_as_misses() {
        let (_clock, cache) = memory_cache();
        let cancel = CancellationToken::new();

        cache
            .set("k", &"not a number", Duration::from_secs(60), &cancel)
            .await
            .unwrap();
        assert_eq!(cache.get::<u64>("k", &cancel).await.unwrap(), None);
    }

    #[tokio::test]
    async fn cancelled_token_aborts_without_writing() {
        let (_clock, cache) = memory_cache();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = cache.set("k", &1u32, Duration::from_secs(60), &cancel).await;
        assert!(matches!(result, Err(AppError::Cancelled)));

        let fresh = CancellationToken::new();
        assert_eq!(cache.get::<u32>("k", &fresh).await.unwrap(), None);
    }
}
