use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::crypto::keys;
use crate::error::{AppError, Result};
use crate::models::session::Session;
use crate::sessions::store::SessionStore;

/// Lifetime summary returned to clients.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub expires_at: DateTime<Utc>,
    pub remaining_minutes: f64,
    pub needs_refresh: bool,
}

/// Issues, rotates and revokes sessions on top of the [`SessionStore`].
#[derive(Clone)]
pub struct SessionService {
    store: SessionStore,
    config: SessionConfig,
}

impl SessionService {
    pub fn new(store: SessionStore, config: SessionConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    fn build(
        &self,
        subject_id: Option<String>,
        fingerprint: &str,
        client_public_key: Option<String>,
    ) -> Result<Session> {
        if fingerprint.trim().is_empty() {
            return Err(AppError::Validation("Device fingerprint is required".to_string()));
        }
        if let Some(key) = client_public_key.as_deref() {
            keys::decode_public_key(key)
                .map_err(|_| AppError::Validation("Invalid client public key".to_string()))?;
        }

        let server_keys = keys::generate_key_pair();
        let now = self.store.now();

        Ok(Session {
            session_id: Uuid::new_v4().to_string(),
            subject_id,
            fingerprint: fingerprint.to_string(),
            issued_at: now,
            expires_at: now + Duration::minutes(self.config.duration_minutes),
            client_encryption_key: client_public_key,
            server_encryption_key: Some(server_keys.public_key.clone()),
            server_decryption_key: Some(server_keys.secret_key.to_string()),
        })
    }

    /// Creates and stores a new session bound to `fingerprint`.
    pub async fn issue(
        &self,
        subject_id: Option<String>,
        fingerprint: &str,
        client_public_key: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<Session> {
        let session = self.build(subject_id, fingerprint, client_public_key)?;
        self.store.set_async(&session, cancel).await?;

        tracing::info!(
            session_id = %session.session_id,
            anonymous = session.subject_id.is_none(),
            "✅ Session issued"
        );
        Ok(session)
    }

    /// Replaces a valid session with a new id, expiry and key set.
    ///
    /// `client_public_key` rotates the client key; `None` keeps the current one.
    pub async fn refresh(
        &self,
        session_id: &str,
        fingerprint: &str,
        client_public_key: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<Session> {
        let current = self
            .store
            .find_valid(session_id, None, fingerprint, cancel)
            .await?
            .ok_or(AppError::Unauthorized)?;

        let client_key = client_public_key.or(current.client_encryption_key.clone());
        let replacement = self.build(current.subject_id.clone(), fingerprint, client_key)?;

        self.store.set_async(&replacement, cancel).await?;
        self.store.remove_async(&current.session_id, cancel).await?;

        tracing::info!(
            old_session_id = %current.session_id,
            session_id = %replacement.session_id,
            "🔄 Session refreshed"
        );
        Ok(replacement)
    }

    /// Single-device logout.
    pub async fn logout(&self, session_id: &str, cancel: &CancellationToken) -> Result<bool> {
        let removed = self.store.remove_async(session_id, cancel).await?;
        tracing::info!(session_id, removed, "👋 Session logged out");
        Ok(removed)
    }

    /// Logs `subject_id` out of every device.
    pub async fn logout_all(&self, subject_id: &str, cancel: &CancellationToken) -> Result<usize> {
        self.store.remove_all_by_identity_async(subject_id, cancel).await
    }

    pub fn status(&self, session: &Session) -> SessionStatus {
        let now = self.store.now();
        SessionStatus {
            expires_at: session.expires_at,
            remaining_minutes: session.remaining_minutes(now).max(0.0),
            needs_refresh: session.needs_refresh(now, self.config.refresh_threshold_minutes),
        }
    }
}
