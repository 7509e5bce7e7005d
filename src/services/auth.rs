use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, Result};
use crate::models::session::Session;
use crate::models::throttle::ThrottlingContext;
use crate::sessions::service::SessionService;
use crate::throttling::ThrottlingStore;

/// Credential checks live outside this crate; sign-in only needs these two answers.
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    /// Maps a login (email, username) to the identity provider's subject id.
    async fn resolve_subject(&self, login: &str) -> Result<Option<String>>;

    /// Checks the presented secret for a resolved subject.
    async fn verify(&self, subject_id: &str, secret: &str) -> Result<bool>;
}

/// The inputs of one sign-in attempt.
pub struct SignInRequest<'a> {
    pub login: &'a str,
    pub secret: &'a str,
    pub fingerprint: &'a str,
    pub client_public_key: Option<String>,
}

/// Throttled sign-in: lockout check, credential check, then session issuance.
#[derive(Clone)]
pub struct Authenticator {
    verifier: Arc<dyn CredentialVerifier>,
    throttling: ThrottlingStore,
    sessions: SessionService,
}

impl Authenticator {
    pub fn new(
        verifier: Arc<dyn CredentialVerifier>,
        throttling: ThrottlingStore,
        sessions: SessionService,
    ) -> Self {
        Self {
            verifier,
            throttling,
            sessions,
        }
    }

    /// Authenticates and issues a session.
    ///
    /// A locked context is rejected before the credentials are looked at.
    /// Unknown logins and bad secrets return the same error.
    pub async fn sign_in(
        &self,
        request: SignInRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<Session> {
        if request.fingerprint.trim().is_empty() {
            return Err(AppError::Validation("Device fingerprint is required".to_string()));
        }

        let subject_id = self.verifier.resolve_subject(request.login).await?;
        let context = ThrottlingContext::new(subject_id.as_deref(), request.fingerprint);

        if let Some(until) = self.throttling.locked_until(&context, cancel).await? {
            let wait = (until - self.sessions.store().now()).num_seconds().max(1);
            return Err(AppError::RateLimitExceeded(format!(
                "Too many failed sign-in attempts. Try again in {} seconds",
                wait
            )));
        }

        let accepted = match subject_id.as_deref() {
            Some(subject_id) => self.verifier.verify(subject_id, request.secret).await?,
            None => false,
        };

        let Some(subject_id) = subject_id.filter(|_| accepted) else {
            self.throttling.register_failure(&context, cancel).await?;
            tracing::warn!(known_user = context.user_key.is_some(), "❌ Sign-in rejected");
            return Err(AppError::Authentication("Invalid credentials".to_string()));
        };

        self.throttling.clear(&context, cancel).await?;

        let session = self
            .sessions
            .issue(Some(subject_id), request.fingerprint, request.client_public_key, cancel)
            .await?;

        tracing::info!(session_id = %session.session_id, "✅ User signed in");
        Ok(session)
    }
}
