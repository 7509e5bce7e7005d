use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Represents one authenticated (or anonymous pre-auth) client session.
///
/// Sessions are replaced wholesale on refresh; fields are never mutated in place.
/// Key material is opaque base64 owned by the crypto layer:
///
/// * `client_encryption_key` - the client's public key; fields sent to the
///   client are sealed toward it.
/// * `server_encryption_key` - the server's public key, handed to the client
///   so it can seal fields toward the server.
/// * `server_decryption_key` - the secret half of `server_encryption_key`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    /// Identity provider user id. `None` for anonymous sessions.
    pub subject_id: Option<String>,
    /// Base64 device fingerprint bound at issuance.
    pub fingerprint: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub client_encryption_key: Option<String>,
    pub server_encryption_key: Option<String>,
    pub server_decryption_key: Option<String>,
}

impl Session {
    /// True once `now` is past the expiry instant.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Minutes left before expiry, negative once expired.
    pub fn remaining_minutes(&self, now: DateTime<Utc>) -> f64 {
        (self.expires_at - now).num_milliseconds() as f64 / 60_000.0
    }

    /// True while the session is live but within `threshold_minutes` of expiry.
    pub fn needs_refresh(&self, now: DateTime<Utc>, threshold_minutes: i64) -> bool {
        !self.is_expired(now) && self.remaining_minutes(now) <= threshold_minutes as f64
    }

    /// Cache lifetime for the record, `None` when it is already due to expire.
    pub fn time_to_live(&self, now: DateTime<Utc>) -> Option<std::time::Duration> {
        (self.expires_at - now).to_std().ok().filter(|ttl| !ttl.is_zero())
    }

    /// Whether the session belongs to `subject_id`.
    pub fn is_owned_by(&self, subject_id: &str) -> bool {
        self.subject_id.as_deref() == Some(subject_id)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .field("subject_id", &self.subject_id)
            .field("fingerprint", &self.fingerprint)
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .field("client_encryption_key", &self.client_encryption_key.is_some())
            .field("server_encryption_key", &self.server_encryption_key.is_some())
            .field("server_decryption_key", &self.server_decryption_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}
