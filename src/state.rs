use std::sync::Arc;

use crate::cache::{Cache, CacheStore, RedisCache};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::{AppError, Result};
use crate::services::auth::{Authenticator, CredentialVerifier};
use crate::services::credentials::FileCredentials;
use crate::sessions::service::SessionService;
use crate::sessions::store::SessionStore;
use crate::throttling::ThrottlingStore;

/// The application's state.
#[derive(Clone)]
pub struct AppState {
    /// The application's configuration.
    pub config: Arc<Config>,
    pub sessions: SessionStore,
    pub session_service: SessionService,
    pub throttling: ThrottlingStore,
    pub authenticator: Authenticator,
}

impl AppState {
    /// Creates a new `AppState` backed by Redis.
    ///
    /// Credentials come from `CREDENTIALS_FILE`; without one every sign-in
    /// is rejected.
    ///
    /// # Arguments
    ///
    /// * `config` - The application's configuration.
    pub async fn new(config: &Config) -> Result<Self> {
        let credentials = match config.credentials_file.as_deref() {
            Some(path) => FileCredentials::load(path)
                .await
                .map_err(|e| AppError::Internal(format!("{e:#}")))?,
            None => {
                tracing::warn!("⚠️  CREDENTIALS_FILE not set, sign-in is disabled");
                FileCredentials::empty()
            }
        };
        tracing::info!(logins = credentials.len(), "✅ Credentials loaded");

        let redis = RedisCache::connect(&config.redis_url).await?;
        Ok(Self::with_store(
            config.clone(),
            Arc::new(redis),
            Arc::new(SystemClock),
            Arc::new(credentials),
        ))
    }

    /// Wires the stores over an arbitrary cache backend, clock and credential source.
    pub fn with_store(
        config: Config,
        store: Arc<dyn CacheStore>,
        clock: Arc<dyn Clock>,
        verifier: Arc<dyn CredentialVerifier>,
    ) -> Self {
        let cache = Cache::new(store, config.cache_namespace.clone());
        tracing::info!(namespace = cache.namespace(), "✅ Cache initialized");

        let sessions = SessionStore::new(cache.clone(), clock.clone());
        let session_service = SessionService::new(sessions.clone(), config.session);
        let throttling = ThrottlingStore::new(cache, clock, config.throttle);
        let authenticator = Authenticator::new(verifier, throttling.clone(), session_service.clone());

        AppState {
            config: Arc::new(config),
            sessions,
            session_service,
            throttling,
            authenticator,
        }
    }
}
