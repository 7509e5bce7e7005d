//! Field Encryption Gateway.
//!
//! Protects individual string fields of request and response payloads with
//! envelope encryption keyed by the caller's session. Outbound values are
//! sealed toward the session's client key; inbound values are opened with the
//! session's server decryption key.
//!
//! | enforcement | caller   | session                           | result        |
//! |-------------|----------|-----------------------------------|---------------|
//! | off         | any      | any                               | pass-through  |
//! | on          | internal | any                               | pass-through  |
//! | on          | external | live, required key present        | seal / open   |
//! | on          | external | missing, expired, key absent, bad | `None`        |
//!
//! Every failure on the external path collapses to `None`; the reason is only
//! logged.

use axum::extract::FromRequestParts;
use base64::{Engine as _, engine::general_purpose};
use http::{HeaderMap, request::Parts};
use tokio_util::sync::CancellationToken;

use crate::config::EncryptionConfig;
use crate::crypto::{compare::secrets_match, envelope};
use crate::error::{AppError, Result};
use crate::models::session::Session;
use crate::sessions::store::SessionStore;
use crate::state::AppState;

/// Header carrying the session id.
pub const SESSION_ID_HEADER: &str = "x-session-id";
/// Header carrying the base64 device fingerprint.
pub const FINGERPRINT_HEADER: &str = "x-device-fingerprint";
/// Header carrying the internal-service pre-shared key.
pub const INTERNAL_SERVICE_HEADER: &str = "x-internal-service-key";

/// Security-relevant request headers.
#[derive(Clone, Default)]
pub struct RequestMetadata {
    pub session_id: Option<String>,
    pub fingerprint: Option<String>,
    pub internal_service_key: Option<String>,
}

impl RequestMetadata {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let read = |name: &str| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        Self {
            session_id: read(SESSION_ID_HEADER),
            fingerprint: read(FINGERPRINT_HEADER),
            internal_service_key: read(INTERNAL_SERVICE_HEADER),
        }
    }
}

impl std::fmt::Debug for RequestMetadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestMetadata")
            .field("session_id", &self.session_id)
            .field("fingerprint", &self.fingerprint)
            .field("internal_service_key", &self.internal_service_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Why a field operation failed closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Refusal {
    NoSession,
    KeyAbsent,
    Crypto,
}

/// Per-request field encryption provider.
#[derive(Clone)]
pub struct ClientCryptoProvider {
    sessions: SessionStore,
    config: EncryptionConfig,
    metadata: RequestMetadata,
}

impl ClientCryptoProvider {
    pub fn new(sessions: SessionStore, config: EncryptionConfig, metadata: RequestMetadata) -> Self {
        Self {
            sessions,
            config,
            metadata,
        }
    }

    pub fn metadata(&self) -> &RequestMetadata {
        &self.metadata
    }

    /// Whether the request presented the internal-service pre-shared key.
    pub fn is_internal(&self) -> bool {
        match (
            self.config.internal_service_key.as_deref(),
            self.metadata.internal_service_key.as_deref(),
        ) {
            (Some(expected), Some(presented)) => secrets_match(expected, presented),
            _ => false,
        }
    }

    fn bypass(&self) -> bool {
        !self.config.enforce || self.is_internal()
    }

    /// Always reads the shared cache; a session revoked on another instance
    /// must stop sealing and opening immediately.
    async fn resolve_session(&self, cancel: &CancellationToken) -> Option<Session> {
        let session_id = self.metadata.session_id.as_deref()?;

        match self.sessions.get_async(session_id, cancel).await {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!(session_id, error = %e, "❌ Session lookup failed during field encryption");
                None
            }
        }
    }

    fn refuse(&self, operation: &'static str, refusal: Refusal) -> Option<String> {
        tracing::warn!(
            operation,
            reason = ?refusal,
            session_id = self.metadata.session_id.as_deref().unwrap_or("-"),
            "🔐 Field operation failed closed"
        );
        None
    }

    /// Seals `plaintext` for the client. See the module table for outcomes.
    pub async fn encrypt_field(&self, plaintext: &str, cancel: &CancellationToken) -> Option<String> {
        if self.bypass() || plaintext.is_empty() {
            return Some(plaintext.to_string());
        }

        let Some(session) = self.resolve_session(cancel).await else {
            return self.refuse("encrypt", Refusal::NoSession);
        };
        let Some(client_key) = session.client_encryption_key.as_deref() else {
            return self.refuse("encrypt", Refusal::KeyAbsent);
        };

        match envelope::seal(client_key, plaintext.as_bytes()) {
            Ok(sealed) => Some(general_purpose::STANDARD.encode(sealed)),
            Err(e) => {
                tracing::debug!(error = %e, "Field seal failed");
                self.refuse("encrypt", Refusal::Crypto)
            }
        }
    }

    /// Opens a value sealed toward the session's server key.
    ///
    /// Values that do not look like an envelope are returned unchanged.
    pub async fn decrypt_field(&self, ciphertext: &str, cancel: &CancellationToken) -> Option<String> {
        if self.bypass() {
            return Some(ciphertext.to_string());
        }

        let Some(sealed) = decode_envelope(ciphertext) else {
            return Some(ciphertext.to_string());
        };

        let Some(session) = self.resolve_session(cancel).await else {
            return self.refuse("decrypt", Refusal::NoSession);
        };
        let Some(secret_key) = session.server_decryption_key.as_deref() else {
            return self.refuse("decrypt", Refusal::KeyAbsent);
        };

        match envelope::open(secret_key, &sealed).map(String::from_utf8) {
            Ok(Ok(plaintext)) => Some(plaintext),
            Ok(Err(_)) => self.refuse("decrypt", Refusal::Crypto),
            Err(e) => {
                tracing::debug!(error = %e, "Field open failed");
                self.refuse("decrypt", Refusal::Crypto)
            }
        }
    }
}

/// Decodes `value` if it is canonical padded base64 long enough to be an envelope.
fn decode_envelope(value: &str) -> Option<Vec<u8>> {
    if value.is_empty() || value.len() % 4 != 0 {
        return None;
    }
    general_purpose::STANDARD
        .decode(value)
        .ok()
        .filter(|bytes| bytes.len() >= envelope::MIN_ENVELOPE_LEN)
}

impl FromRequestParts<AppState> for ClientCryptoProvider {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self> {
        let metadata = parts
            .extensions
            .get::<RequestMetadata>()
            .cloned()
            .unwrap_or_else(|| RequestMetadata::from_headers(&parts.headers));

        Ok(ClientCryptoProvider::new(
            state.sessions.clone(),
            state.config.encryption.clone(),
            metadata,
        ))
    }
}
