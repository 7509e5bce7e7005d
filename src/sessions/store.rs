//! Session Store: owns `Session` records in the shared cache.
//!
//! Records live under `session:{id}` with a TTL equal to their remaining
//! lifetime. A per-identity index (`session-index:{subject}`) lists the
//! session ids issued to one subject so every device can be enumerated or
//! logged out. The index is best-effort and pruned lazily; the session record
//! is always authoritative.
//!
//! A small in-process snapshot of recently seen sessions backs the
//! synchronous [`SessionStore::get`] fast path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::cache::{self, Cache};
use crate::clock::Clock;
use crate::crypto::compare::secrets_match;
use crate::error::{AppError, Result};
use crate::models::session::Session;

const SESSION_PREFIX: &str = "session";
const INDEX_PREFIX: &str = "session-index";

/// Every failed swap means another writer got through, so this is also the
/// number of concurrent writers one index update tolerates.
const INDEX_SWAP_ATTEMPTS: usize = 32;

fn session_key(session_id: &str) -> String {
    format!("{}:{}", SESSION_PREFIX, session_id)
}

fn index_key(subject_id: &str) -> String {
    format!("{}:{}", INDEX_PREFIX, subject_id)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct IndexEntry {
    session_id: String,
    expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct SessionStore {
    cache: Cache,
    clock: Arc<dyn Clock>,
    snapshot: Arc<RwLock<HashMap<String, Session>>>,
}

impl SessionStore {
    pub fn new(cache: Cache, clock: Arc<dyn Clock>) -> Self {
        Self {
            cache,
            clock,
            snapshot: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn remember(&self, session: &Session) {
        let now = self.clock.now();
        if let Ok(mut snapshot) = self.snapshot.write() {
            snapshot.retain(|_, s| !s.is_expired(now));
            snapshot.insert(session.session_id.clone(), session.clone());
        }
    }

    fn forget(&self, session_id: &str) {
        if let Ok(mut snapshot) = self.snapshot.write() {
            snapshot.remove(session_id);
        }
    }

    /// Fast-path lookup against sessions this instance has already seen.
    ///
    /// Returns `None` on a local miss or for expired records. The snapshot
    /// does not see revocations made by other instances, so anything that
    /// grants access or touches keys must use [`SessionStore::get_async`].
    pub fn get(&self, session_id: &str) -> Option<Session> {
        let now = self.clock.now();
        let snapshot = self.snapshot.read().ok()?;
        snapshot
            .get(session_id)
            .filter(|s| !s.is_expired(now))
            .cloned()
    }

    /// Loads a session from the shared cache.
    pub async fn get_async(
        &self,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<Session>> {
        if session_id.is_empty() {
            return Ok(None);
        }

        let session: Option<Session> = self.cache.get(&session_key(session_id), cancel).await?;
        match session {
            Some(session) if !session.is_expired(self.clock.now()) => {
                self.remember(&session);
                Ok(Some(session))
            }
            _ => {
                self.forget(session_id);
                Ok(None)
            }
        }
    }

    /// All live sessions issued to `subject_id`.
    pub async fn get_by_identity_async(
        &self,
        subject_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Session>> {
        let index = self.load_index(subject_id, cancel).await?;

        let mut sessions = Vec::with_capacity(index.len());
        for entry in &index {
            if let Some(session) = self.get_async(&entry.session_id, cancel).await? {
                if session.is_owned_by(subject_id) {
                    sessions.push(session);
                }
            }
        }

        if sessions.len() != index.len() {
            let dead: Vec<String> = index
                .into_iter()
                .filter(|e| !sessions.iter().any(|s| s.session_id == e.session_id))
                .map(|e| e.session_id)
                .collect();
            self.update_index(subject_id, cancel, |index| {
                index.retain(|e| !dead.contains(&e.session_id))
            })
            .await?;
        }

        Ok(sessions)
    }

    /// A single session, only if it belongs to `subject_id`.
    pub async fn get_by_identity_session_async(
        &self,
        subject_id: &str,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<Session>> {
        Ok(self
            .get_async(session_id, cancel)
            .await?
            .filter(|s| s.is_owned_by(subject_id)))
    }

    /// Upserts `session` and records it in its owner's index.
    ///
    /// A session that is already due to expire is removed instead of stored.
    pub async fn set_async(&self, session: &Session, cancel: &CancellationToken) -> Result<()> {
        let now = self.clock.now();
        let Some(ttl) = session.time_to_live(now) else {
            tracing::debug!(session_id = %session.session_id, "Session already expired, not storing");
            return self.remove_async(&session.session_id, cancel).await.map(|_| ());
        };

        self.cache
            .set(&session_key(&session.session_id), session, ttl, cancel)
            .await?;
        self.remember(session);

        if let Some(subject_id) = session.subject_id.as_deref() {
            let entry = IndexEntry {
                session_id: session.session_id.clone(),
                expires_at: session.expires_at,
            };
            let indexed = self
                .update_index(subject_id, cancel, |index| {
                    index.retain(|e| e.session_id != entry.session_id);
                    index.push(entry.clone());
                })
                .await;

            // An unindexed session would survive logout-all.
            if let Err(e) = indexed {
                self.forget(&session.session_id);
                let cleanup = CancellationToken::new();
                if let Err(cleanup_error) = self.cache.remove(&session_key(&session.session_id), &cleanup).await {
                    tracing::error!(
                        session_id = %session.session_id,
                        error = %cleanup_error,
                        "❌ Failed to remove unindexed session"
                    );
                }
                return Err(e);
            }
        }

        tracing::debug!(session_id = %session.session_id, ttl_secs = ttl.as_secs(), "✅ Session stored");
        Ok(())
    }

    /// Removes a session and prunes it from its owner's index.
    ///
    /// Returns whether a record existed.
    pub async fn remove_async(&self, session_id: &str, cancel: &CancellationToken) -> Result<bool> {
        let existing: Option<Session> = self.cache.get(&session_key(session_id), cancel).await?;
        self.cache.remove(&session_key(session_id), cancel).await?;
        self.forget(session_id);

        if let Some(subject_id) = existing.as_ref().and_then(|s| s.subject_id.as_deref()) {
            self.prune_index(subject_id, session_id, cancel).await?;
        }

        Ok(existing.is_some())
    }

    /// Removes a session only if it belongs to `subject_id`.
    pub async fn remove_by_identity_async(
        &self,
        subject_id: &str,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let existing: Option<Session> = self.cache.get(&session_key(session_id), cancel).await?;
        match existing {
            Some(session) if !session.is_owned_by(subject_id) => {
                tracing::warn!(session_id, "❌ Refusing to remove session owned by another identity");
                Ok(false)
            }
            Some(_) => {
                self.cache.remove(&session_key(session_id), cancel).await?;
                self.forget(session_id);
                self.prune_index(subject_id, session_id, cancel).await?;
                Ok(true)
            }
            None => {
                self.forget(session_id);
                self.prune_index(subject_id, session_id, cancel).await?;
                Ok(false)
            }
        }
    }

    /// Removes every session issued to `subject_id`. Returns how many records were removed.
    pub async fn remove_all_by_identity_async(
        &self,
        subject_id: &str,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        // Detach the whole index in one swap; sessions indexed after this
        // point belong to a later logout.
        let mut detached = Vec::new();
        self.update_index(subject_id, cancel, |index| {
            detached = std::mem::take(index);
        })
        .await?;

        let mut removed = 0;
        for entry in &detached {
            let existing: Option<Session> =
                self.cache.get(&session_key(&entry.session_id), cancel).await?;
            if existing.as_ref().is_some_and(|s| s.is_owned_by(subject_id)) {
                self.cache.remove(&session_key(&entry.session_id), cancel).await?;
                removed += 1;
            }
            self.forget(&entry.session_id);
        }

        tracing::info!(removed, "✅ Removed all sessions for identity");
        Ok(removed)
    }

    /// Session exists, is live and was issued to this fingerprint.
    pub async fn is_valid_async(
        &self,
        session_id: &str,
        fingerprint: &str,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        Ok(self.find_valid(session_id, None, fingerprint, cancel).await?.is_some())
    }

    /// As [`SessionStore::is_valid_async`], additionally scoped to `subject_id`.
    pub async fn is_user_valid_async(
        &self,
        session_id: &str,
        subject_id: &str,
        fingerprint: &str,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        Ok(self
            .find_valid(session_id, Some(subject_id), fingerprint, cancel)
            .await?
            .is_some())
    }

    /// Liveness only: exists and not expired.
    pub async fn is_valid_session_id_async(
        &self,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        Ok(self.get_async(session_id, cancel).await?.is_some())
    }

    /// Returns the session when it is live, bound to `fingerprint` and, if
    /// given, owned by `subject_id`.
    pub async fn find_valid(
        &self,
        session_id: &str,
        subject_id: Option<&str>,
        fingerprint: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<Session>> {
        if fingerprint.is_empty() {
            return Ok(None);
        }

        let Some(session) = self.get_async(session_id, cancel).await? else {
            return Ok(None);
        };

        if !secrets_match(&session.fingerprint, fingerprint) {
            tracing::warn!(session_id, "❌ Fingerprint mismatch");
            return Ok(None);
        }

        if let Some(subject_id) = subject_id {
            if !session.is_owned_by(subject_id) {
                tracing::warn!(session_id, "❌ Session presented for a different identity");
                return Ok(None);
            }
        }

        Ok(Some(session))
    }

    async fn load_index(
        &self,
        subject_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<IndexEntry>> {
        let now = self.clock.now();
        let index: Option<Vec<IndexEntry>> = self.cache.get(&index_key(subject_id), cancel).await?;
        Ok(index
            .unwrap_or_default()
            .into_iter()
            .filter(|e| e.expires_at >= now)
            .collect())
    }

    /// Applies `edit` to the live entries of `subject_id`'s index and swaps
    /// the result in, retrying when another writer got there first.
    async fn update_index<F>(
        &self,
        subject_id: &str,
        cancel: &CancellationToken,
        mut edit: F,
    ) -> Result<()>
    where
        F: FnMut(&mut Vec<IndexEntry>),
    {
        let key = index_key(subject_id);

        for _ in 0..INDEX_SWAP_ATTEMPTS {
            let now = self.clock.now();
            let raw = self.cache.get_raw(&key, cancel).await?;
            let mut index: Vec<IndexEntry> = raw
                .as_deref()
                .and_then(|raw| cache::decode(&key, raw))
                .unwrap_or_default();
            index.retain(|e| e.expires_at >= now);
            edit(&mut index);

            if self
                .cache
                .compare_and_swap(&key, raw.as_deref(), &index, index_ttl(&index, now), cancel)
                .await?
            {
                return Ok(());
            }
            tracing::debug!("Concurrent session index update, retrying");
        }

        tracing::error!(attempts = INDEX_SWAP_ATTEMPTS, "❌ Session index update kept conflicting");
        Err(AppError::Cache("Session index is contended".to_string()))
    }

    async fn prune_index(
        &self,
        subject_id: &str,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.update_index(subject_id, cancel, |index| {
            index.retain(|e| e.session_id != session_id)
        })
        .await
    }
}

/// The index lives as long as its longest-lived entry. An empty index is
/// kept briefly so the swap has something to compare against.
fn index_ttl(index: &[IndexEntry], now: DateTime<Utc>) -> Duration {
    index
        .iter()
        .map(|e| e.expires_at)
        .max()
        .and_then(|latest| (latest - now).to_std().ok())
        .unwrap_or_default()
        .max(Duration::from_secs(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::clock::ManualClock;
    use chrono::Duration as ChronoDuration;

    struct Fixture {
        clock: Arc<ManualClock>,
        store: SessionStore,
        cancel: CancellationToken,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cache = Cache::new(Arc::new(MemoryCache::new(clock.clone())), "test");
        Fixture {
            store: SessionStore::new(cache, clock.clone()),
            clock,
            cancel: CancellationToken::new(),
        }
    }

    fn session(id: &str, subject: Option<&str>, now: DateTime<Utc>) -> Session {
        Session {
            session_id: id.to_string(),
            subject_id: subject.map(str::to_string),
            fingerprint: "ZnAtMQ==".to_string(),
            issued_at: now,
            expires_at: now + ChronoDuration::minutes(60),
            client_encryption_key: None,
            server_encryption_key: None,
            server_decryption_key: None,
        }
    }

    #[tokio::test]
    async fn stored_session_is_valid_for_its_fingerprint_only() {
        let f = fixture();
        let s = session("S1", Some("alice"), f.clock.now());
        f.store.set_async(&s, &f.cancel).await.unwrap();

        assert!(f.store.is_valid_async("S1", "ZnAtMQ==", &f.cancel).await.unwrap());
        assert!(!f.store.is_valid_async("S1", "ZnAtMg==", &f.cancel).await.unwrap());
        assert!(!f.store.is_valid_async("S1", "", &f.cancel).await.unwrap());
        assert!(!f.store.is_valid_async("missing", "ZnAtMQ==", &f.cancel).await.unwrap());
    }

    #[tokio::test]
    async fn user_validation_rejects_other_identities() {
        let f = fixture();
        f.store
            .set_async(&session("S1", Some("alice"), f.clock.now()), &f.cancel)
            .await
            .unwrap();

        assert!(f.store.is_user_valid_async("S1", "alice", "ZnAtMQ==", &f.cancel).await.unwrap());
        assert!(!f.store.is_user_valid_async("S1", "mallory", "ZnAtMQ==", &f.cancel).await.unwrap());
    }

    #[tokio::test]
    async fn expired_session_is_invalid_everywhere() {
        let f = fixture();
        f.store
            .set_async(&session("S1", Some("alice"), f.clock.now()), &f.cancel)
            .await
            .unwrap();
        assert!(f.store.get("S1").is_some());

        f.clock.advance(ChronoDuration::minutes(61));

        assert!(f.store.get("S1").is_none());
        assert!(f.store.get_async("S1", &f.cancel).await.unwrap().is_none());
        assert!(!f.store.is_valid_session_id_async("S1", &f.cancel).await.unwrap());
        assert!(!f.store.is_valid_async("S1", "ZnAtMQ==", &f.cancel).await.unwrap());
    }

    #[tokio::test]
    async fn identity_index_enumerates_devices() {
        let f = fixture();
        let now = f.clock.now();
        f.store.set_async(&session("S1", Some("alice"), now), &f.cancel).await.unwrap();
        f.store.set_async(&session("S2", Some("alice"), now), &f.cancel).await.unwrap();
        f.store.set_async(&session("S3", Some("bob"), now), &f.cancel).await.unwrap();

        let mut ids: Vec<String> = f
            .store
            .get_by_identity_async("alice", &f.cancel)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.session_id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["S1".to_string(), "S2".to_string()]);

        assert!(f
            .store
            .get_by_identity_session_async("bob", "S1", &f.cancel)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn re_setting_a_session_does_not_duplicate_index_entries() {
        let f = fixture();
        let s = session("S1", Some("alice"), f.clock.now());
        f.store.set_async(&s, &f.cancel).await.unwrap();
        f.store.set_async(&s, &f.cancel).await.unwrap();

        let sessions = f.store.get_by_identity_async("alice", &f.cancel).await.unwrap();
        assert_eq!(sessions.len(), 1);
    }

    #[tokio::test]
    async fn single_device_logout_prunes_index() {
        let f = fixture();
        let now = f.clock.now();
        f.store.set_async(&session("S1", Some("alice"), now), &f.cancel).await.unwrap();
        f.store.set_async(&session("S2", Some("alice"), now), &f.cancel).await.unwrap();

        assert!(f.store.remove_async("S1", &f.cancel).await.unwrap());
        assert!(f.store.get("S1").is_none());

        let remaining = f.store.get_by_identity_async("alice", &f.cancel).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].session_id, "S2");
        assert!(!f.store.remove_async("S1", &f.cancel).await.unwrap());
    }

    #[tokio::test]
    async fn identity_scoped_removal_ignores_foreign_sessions() {
        let f = fixture();
        f.store
            .set_async(&session("S1", Some("alice"), f.clock.now()), &f.cancel)
            .await
            .unwrap();

        assert!(!f.store.remove_by_identity_async("bob", "S1", &f.cancel).await.unwrap());
        assert!(f.store.is_valid_session_id_async("S1", &f.cancel).await.unwrap());

        assert!(f.store.remove_by_identity_async("alice", "S1", &f.cancel).await.unwrap());
        assert!(!f.store.is_valid_session_id_async("S1", &f.cancel).await.unwrap());
    }

    #[tokio::test]
    async fn all_device_logout_leaves_other_identities() {
        let f = fixture();
        let now = f.clock.now();
        f.store.set_async(&session("S1", Some("alice"), now), &f.cancel).await.unwrap();
        f.store.set_async(&session("S2", Some("alice"), now), &f.cancel).await.unwrap();
        f.store.set_async(&session("S3", Some("bob"), now), &f.cancel).await.unwrap();

        let removed = f.store.remove_all_by_identity_async("alice", &f.cancel).await.unwrap();
        assert_eq!(removed, 2);
        assert!(f.store.get_by_identity_async("alice", &f.cancel).await.unwrap().is_empty());
        assert!(f.store.is_valid_session_id_async("S3", &f.cancel).await.unwrap());
    }

    #[tokio::test]
    async fn anonymous_sessions_skip_the_index() {
        let f = fixture();
        f.store
            .set_async(&session("A1", None, f.clock.now()), &f.cancel)
            .await
            .unwrap();
        assert!(f.store.is_valid_session_id_async("A1", &f.cancel).await.unwrap());
        assert!(!f.store.is_user_valid_async("A1", "alice", "ZnAtMQ==", &f.cancel).await.unwrap());
    }

    #[tokio::test]
    async fn already_expired_session_is_not_stored() {
        let f = fixture();
        let mut s = session("S1", Some("alice"), f.clock.now());
        s.expires_at = f.clock.now() - ChronoDuration::seconds(1);

        f.store.set_async(&s, &f.cancel).await.unwrap();
        assert!(f.store.get_async("S1", &f.cancel).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_sign_ins_are_all_logged_out() {
        let f = fixture();
        let devices = 24;

        let mut tasks = Vec::new();
        for i in 0..devices {
            let store = f.store.clone();
            let s = session(&format!("S{i}"), Some("alice"), f.clock.now());
            tasks.push(tokio::spawn(async move {
                store.set_async(&s, &CancellationToken::new()).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let indexed = f.store.get_by_identity_async("alice", &f.cancel).await.unwrap();
        assert_eq!(indexed.len(), devices);

        let removed = f.store.remove_all_by_identity_async("alice", &f.cancel).await.unwrap();
        assert_eq!(removed, devices);
        for i in 0..devices {
            let id = format!("S{i}");
            assert!(!f.store.is_valid_session_id_async(&id, &f.cancel).await.unwrap(), "{id} survived");
        }
    }

    /// A backend on which every swap loses to some other writer.
    struct AlwaysContended(MemoryCache);

    #[async_trait::async_trait]
    impl crate::cache::CacheStore for AlwaysContended {
        async fn get(&self, namespace: &str, key: &str) -> Result<Option<String>> {
            self.0.get(namespace, key).await
        }

        async fn set(&self, namespace: &str, key: &str, value: &str, ttl: Duration) -> Result<()> {
            self.0.set(namespace, key, value, ttl).await
        }

        async fn remove(&self, namespace: &str, key: &str) -> Result<()> {
            self.0.remove(namespace, key).await
        }

        async fn compare_and_swap(
            &self,
            _namespace: &str,
            _key: &str,
            _expected: Option<&str>,
            _value: &str,
            _ttl: Duration,
        ) -> Result<bool> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn unindexable_session_is_not_kept() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let backend = AlwaysContended(MemoryCache::new(clock.clone()));
        let store = SessionStore::new(Cache::new(Arc::new(backend), "test"), clock.clone());
        let cancel = CancellationToken::new();

        let s = session("S1", Some("alice"), clock.now());
        let err = store.set_async(&s, &cancel).await.unwrap_err();
        assert!(matches!(err, AppError::Cache(_)));

        assert!(store.get("S1").is_none());
        assert!(store.get_async("S1", &cancel).await.unwrap().is_none());
    }
}
