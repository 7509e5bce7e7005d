//! Adaptive, partitioned lockout for authentication endpoints.
//!
//! Failures are counted independently per user, per device fingerprint and per
//! (user, fingerprint) pair. Each partition keeps a fixed window; once the
//! count reaches the partition's threshold a lock is applied whose length
//! doubles with every further failure up to the configured maximum. State
//! expires from the cache on its own, so no sweeper is required.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::cache::{self, Cache};
use crate::clock::Clock;
use crate::config::ThrottleConfig;
use crate::error::{AppError, Result};
use crate::models::throttle::{FailureState, Partition, ThrottlingContext};

/// Optimistic update attempts before falling back to a plain write.
const MAX_SWAP_ATTEMPTS: usize = 5;

#[derive(Clone)]
pub struct ThrottlingStore {
    cache: Cache,
    clock: Arc<dyn Clock>,
    config: ThrottleConfig,
}

impl ThrottlingStore {
    pub fn new(cache: Cache, clock: Arc<dyn Clock>, config: ThrottleConfig) -> Self {
        Self { cache, clock, config }
    }

    async fn load(
        &self,
        partition: Partition,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<FailureState>> {
        self.cache.get(&partition.cache_key(key), cancel).await
    }

    /// True if any applicable partition is currently locked.
    ///
    /// Partitions are checked user, fingerprint, composite and the first lock wins.
    pub async fn is_locked(
        &self,
        context: &ThrottlingContext,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let now = self.clock.now();
        for (partition, key) in context.partitions() {
            if let Some(state) = self.load(partition, key, cancel).await? {
                if state.is_locked(now) {
                    tracing::debug!(?partition, "🔒 Partition locked");
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// The latest active lock deadline across all partitions.
    pub async fn locked_until(
        &self,
        context: &ThrottlingContext,
        cancel: &CancellationToken,
    ) -> Result<Option<DateTime<Utc>>> {
        let now = self.clock.now();
        let mut latest: Option<DateTime<Utc>> = None;
        for (partition, key) in context.partitions() {
            if let Some(until) = self
                .load(partition, key, cancel)
                .await?
                .and_then(|s| s.lock_until)
                .filter(|until| *until > now)
            {
                latest = Some(latest.map_or(until, |l| l.max(until)));
            }
        }
        Ok(latest)
    }

    /// Counts one authentication failure against every applicable partition.
    ///
    /// Cancellation is honoured while the partitions are read. Once the first
    /// write is issued all partitions are written, so they never disagree about
    /// whether the failure happened.
    pub async fn register_failure(
        &self,
        context: &ThrottlingContext,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut pending = Vec::with_capacity(3);
        for (partition, key) in context.partitions() {
            let cache_key = partition.cache_key(key);
            let raw = self.cache.get_raw(&cache_key, cancel).await?;
            pending.push((partition, cache_key, raw));
        }
        if cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }

        let commit = CancellationToken::new();
        for (partition, cache_key, raw) in pending {
            let state = self.commit_failure(partition, &cache_key, raw, &commit).await?;
            if let Some(until) = state.lock_until.filter(|until| *until > self.clock.now()) {
                tracing::warn!(
                    ?partition,
                    count = state.count,
                    locked_until = %until,
                    "🔒 Authentication lockout applied"
                );
            }
        }
        Ok(())
    }

    /// Applies one failure on top of `raw`, re-reading after a lost swap.
    async fn commit_failure(
        &self,
        partition: Partition,
        cache_key: &str,
        mut raw: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<FailureState> {
        let policy = partition.policy(&self.config);

        for attempt in 0..MAX_SWAP_ATTEMPTS {
            if attempt > 0 {
                raw = self.cache.get_raw(cache_key, cancel).await?;
            }
            let now = self.clock.now();
            let mut state = raw
                .as_deref()
                .and_then(|raw| cache::decode::<FailureState>(cache_key, raw))
                .unwrap_or_else(|| FailureState::new(now));

            state.record_failure(now, &policy);
            let ttl = state.time_to_live(now, &policy);

            if self
                .cache
                .compare_and_swap(cache_key, raw.as_deref(), &state, ttl, cancel)
                .await?
            {
                return Ok(state);
            }
            tracing::debug!(?partition, "Concurrent failure update, retrying");
        }

        // Heavy contention on one key: record the failure on top of whatever is there now.
        tracing::warn!(?partition, "⚠️  Failure counter contended, writing without swap");
        let now = self.clock.now();
        let mut state = self
            .cache
            .get::<FailureState>(cache_key, cancel)
            .await?
            .unwrap_or_else(|| FailureState::new(now));
        state.record_failure(now, &policy);
        self.cache
            .set(cache_key, &state, state.time_to_live(now, &policy), cancel)
            .await?;
        Ok(state)
    }

    /// Forgets all failure history for the context. Called after a successful sign-in.
    pub async fn clear(&self, context: &ThrottlingContext, cancel: &CancellationToken) -> Result<()> {
        for (partition, key) in context.partitions() {
            self.cache.remove(&partition.cache_key(key), cancel).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::clock::ManualClock;
    use crate::cache::CacheStore;
    use crate::config::ThrottlePolicy;
    use async_trait::async_trait;
    use chrono::Duration;

    const POLICY: ThrottlePolicy = ThrottlePolicy {
        threshold: 5,
        window_minutes: 15,
        base_lock_seconds: 10,
        max_lock_seconds: 300,
    };

    fn throttling(config: ThrottleConfig) -> (Arc<ManualClock>, ThrottlingStore) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cache = Cache::new(Arc::new(MemoryCache::new(clock.clone())), "test");
        (clock.clone(), ThrottlingStore::new(cache, clock, config))
    }

    fn uniform() -> ThrottleConfig {
        ThrottleConfig {
            user: POLICY,
            fingerprint: POLICY,
            composite: POLICY,
        }
    }

    #[tokio::test]
    async fn lock_grows_exponentially_and_caps() {
        let (clock, store) = throttling(uniform());
        let cancel = CancellationToken::new();
        let ctx = ThrottlingContext::new(Some("alice"), "fp");

        for _ in 0..4 {
            store.register_failure(&ctx, &cancel).await.unwrap();
            assert!(!store.is_locked(&ctx, &cancel).await.unwrap());
        }

        let expected = [10, 20, 40, 80, 160, 300, 300];
        for seconds in expected {
            let now = clock.now();
            store.register_failure(&ctx, &cancel).await.unwrap();
            let until = store.locked_until(&ctx, &cancel).await.unwrap().unwrap();
            assert_eq!(until, now + Duration::seconds(seconds));
        }
    }

    #[tokio::test]
    async fn lock_expires_on_its_own() {
        let (clock, store) = throttling(uniform());
        let cancel = CancellationToken::new();
        let ctx = ThrottlingContext::new(Some("alice"), "fp");

        for _ in 0..5 {
            store.register_failure(&ctx, &cancel).await.unwrap();
        }
        assert!(store.is_locked(&ctx, &cancel).await.unwrap());

        clock.advance(Duration::seconds(11));
        assert!(!store.is_locked(&ctx, &cancel).await.unwrap());
    }

    #[tokio::test]
    async fn stale_window_restarts_the_count() {
        let (clock, store) = throttling(uniform());
        let cancel = CancellationToken::new();
        let ctx = ThrottlingContext::new(Some("alice"), "fp");

        for _ in 0..4 {
            store.register_failure(&ctx, &cancel).await.unwrap();
        }
        clock.advance(Duration::minutes(16));
        store.register_failure(&ctx, &cancel).await.unwrap();

        assert!(!store.is_locked(&ctx, &cancel).await.unwrap());
        let state = store.load(Partition::User, "alice", &cancel).await.unwrap().unwrap();
        assert_eq!(state.count, 1);
        assert!(state.lock_until.is_none());
    }

    #[tokio::test]
    async fn clear_unlocks_immediately() {
        let (_clock, store) = throttling(uniform());
        let cancel = CancellationToken::new();
        let ctx = ThrottlingContext::new(Some("alice"), "fp");

        for _ in 0..8 {
            store.register_failure(&ctx, &cancel).await.unwrap();
        }
        assert!(store.is_locked(&ctx, &cancel).await.unwrap());

        store.clear(&ctx, &cancel).await.unwrap();
        assert!(!store.is_locked(&ctx, &cancel).await.unwrap());
    }

    #[tokio::test]
    async fn any_locked_partition_locks_the_context() {
        let config = ThrottleConfig {
            user: ThrottlePolicy { threshold: 100, ..POLICY },
            fingerprint: ThrottlePolicy { threshold: 3, ..POLICY },
            composite: ThrottlePolicy { threshold: 100, ..POLICY },
        };
        let (_clock, store) = throttling(config);
        let cancel = CancellationToken::new();

        // Attacker rotates through users from one device.
        for user in ["a", "b", "c"] {
            let ctx = ThrottlingContext::new(Some(user), "shared-device");
            store.register_failure(&ctx, &cancel).await.unwrap();
        }

        let fresh_user = ThrottlingContext::new(Some("d"), "shared-device");
        assert!(store.is_locked(&fresh_user, &cancel).await.unwrap());

        let other_device = ThrottlingContext::new(Some("a"), "another-device");
        assert!(!store.is_locked(&other_device, &cancel).await.unwrap());
    }

    #[tokio::test]
    async fn user_partition_follows_identity_across_devices() {
        let config = ThrottleConfig {
            user: ThrottlePolicy { threshold: 3, ..POLICY },
            fingerprint: ThrottlePolicy { threshold: 100, ..POLICY },
            composite: ThrottlePolicy { threshold: 100, ..POLICY },
        };
        let (_clock, store) = throttling(config);
        let cancel = CancellationToken::new();

        for device in ["d1", "d2", "d3"] {
            let ctx = ThrottlingContext::new(Some("victim"), device);
            store.register_failure(&ctx, &cancel).await.unwrap();
        }

        let ctx = ThrottlingContext::new(Some("victim"), "d4");
        assert!(store.is_locked(&ctx, &cancel).await.unwrap());
    }

    #[tokio::test]
    async fn unknown_user_only_touches_device_partitions() {
        let (_clock, store) = throttling(uniform());
        let cancel = CancellationToken::new();
        let ctx = ThrottlingContext::new(None, "fp");

        store.register_failure(&ctx, &cancel).await.unwrap();
        assert!(store.load(Partition::Fingerprint, "fp", &cancel).await.unwrap().is_some());
        assert!(store
            .load(Partition::Composite, &ctx.composite_key, &cancel)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn concurrent_failures_are_all_counted() {
        let (_clock, store) = throttling(uniform());
        let ctx = ThrottlingContext::new(Some("alice"), "fp");

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let store = store.clone();
            let ctx = ctx.clone();
            tasks.push(tokio::spawn(async move {
                store.register_failure(&ctx, &CancellationToken::new()).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let cancel = CancellationToken::new();
        let state = store.load(Partition::User, "alice", &cancel).await.unwrap().unwrap();
        assert_eq!(state.count, 4);
    }

    #[tokio::test]
    async fn cancelled_registration_writes_nothing() {
        let (_clock, store) = throttling(uniform());
        let ctx = ThrottlingContext::new(Some("alice"), "fp");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = store.register_failure(&ctx, &cancel).await;
        assert!(matches!(result, Err(AppError::Cancelled)));

        let fresh = CancellationToken::new();
        assert!(store.load(Partition::User, "alice", &fresh).await.unwrap().is_none());
    }

    /// Cancels the caller's token as soon as the first write lands.
    struct CancelOnFirstWrite {
        inner: MemoryCache,
        cancel: CancellationToken,
    }

    #[async_trait]
    impl CacheStore for CancelOnFirstWrite {
        async fn get(&self, namespace: &str, key: &str) -> Result<Option<String>> {
            self.inner.get(namespace, key).await
        }

        async fn set(
            &self,
            namespace: &str,
            key: &str,
            value: &str,
            ttl: std::time::Duration,
        ) -> Result<()> {
            self.inner.set(namespace, key, value, ttl).await
        }

        async fn remove(&self, namespace: &str, key: &str) -> Result<()> {
            self.inner.remove(namespace, key).await
        }

        async fn compare_and_swap(
            &self,
            namespace: &str,
            key: &str,
            expected: Option<&str>,
            value: &str,
            ttl: std::time::Duration,
        ) -> Result<bool> {
            let swapped = self
                .inner
                .compare_and_swap(namespace, key, expected, value, ttl)
                .await;
            self.cancel.cancel();
            swapped
        }
    }

    #[tokio::test]
    async fn cancellation_during_writes_still_counts_every_partition() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cancel = CancellationToken::new();
        let backend = CancelOnFirstWrite {
            inner: MemoryCache::new(clock.clone()),
            cancel: cancel.clone(),
        };
        let store = ThrottlingStore::new(Cache::new(Arc::new(backend), "test"), clock, uniform());
        let ctx = ThrottlingContext::new(Some("alice"), "fp");

        store.register_failure(&ctx, &cancel).await.unwrap();
        assert!(cancel.is_cancelled());

        let fresh = CancellationToken::new();
        for (partition, key) in ctx.partitions() {
            let state = store.load(partition, key, &fresh).await.unwrap().unwrap();
            assert_eq!(state.count, 1, "{partition:?} missed the failure");
        }
    }
}
