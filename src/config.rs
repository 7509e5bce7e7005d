use std::env;
use std::str::FromStr;
use anyhow::{Context, Result};
use zeroize::Zeroizing;

/// Lockout policy for one throttling partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottlePolicy {
    /// Failures within the window before the partition locks.
    pub threshold: u32,
    /// Length of the fixed failure window in minutes.
    pub window_minutes: i64,
    /// Lock duration applied when the threshold is first reached.
    pub base_lock_seconds: u64,
    /// Upper bound for the doubling lock duration.
    pub max_lock_seconds: u64,
}

impl ThrottlePolicy {
    /// Returns the window as a `chrono::Duration`.
    pub fn window(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.window_minutes)
    }

    fn validate(&self, name: &str) -> Result<()> {
        if self.threshold == 0 {
            anyhow::bail!("{name} threshold must be at least 1");
        }
        if self.window_minutes < 1 {
            anyhow::bail!("{name} window must be at least 1 minute");
        }
        if self.base_lock_seconds == 0 {
            anyhow::bail!("{name} base lock must be at least 1 second");
        }
        if self.base_lock_seconds > self.max_lock_seconds {
            anyhow::bail!("{name} base lock must not exceed its max lock");
        }
        Ok(())
    }

    fn from_env(prefix: &str, default: ThrottlePolicy) -> Result<Self> {
        let policy = Self {
            threshold: parse_var(&format!("{prefix}_THRESHOLD"), default.threshold)?,
            window_minutes: parse_var(&format!("{prefix}_WINDOW_MINUTES"), default.window_minutes)?,
            base_lock_seconds: parse_var(
                &format!("{prefix}_BASE_LOCK_SECONDS"),
                default.base_lock_seconds,
            )?,
            max_lock_seconds: parse_var(
                &format!("{prefix}_MAX_LOCK_SECONDS"),
                default.max_lock_seconds,
            )?,
        };
        policy.validate(prefix)?;
        Ok(policy)
    }
}

/// Per-partition throttling policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleConfig {
    pub user: ThrottlePolicy,
    pub fingerprint: ThrottlePolicy,
    pub composite: ThrottlePolicy,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        let standard = ThrottlePolicy {
            threshold: 5,
            window_minutes: 15,
            base_lock_seconds: 10,
            max_lock_seconds: 300,
        };
        Self {
            user: standard,
            // A shared device legitimately sees failures from several people.
            fingerprint: ThrottlePolicy {
                threshold: 20,
                ..standard
            },
            composite: standard,
        }
    }
}

/// Settings consumed by the field encryption gateway.
#[derive(Clone)]
pub struct EncryptionConfig {
    /// When false, fields pass through untouched.
    pub enforce: bool,
    /// Pre-shared key that marks service-to-service traffic.
    pub internal_service_key: Option<Zeroizing<String>>,
}

impl std::fmt::Debug for EncryptionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionConfig")
            .field("enforce", &self.enforce)
            .field("internal_service_key", &self.internal_service_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Session lifetime settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// The duration of a session in minutes.
    pub duration_minutes: i64,
    /// Remaining lifetime at or below which a session should be refreshed.
    pub refresh_threshold_minutes: i64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            duration_minutes: 60,
            refresh_threshold_minutes: 15,
        }
    }
}

/// The application's configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// The URL of the Redis server.
    pub redis_url: String,
    /// Application name that prefixes every cache key.
    pub cache_namespace: String,
    /// Address the HTTP server binds to.
    pub bind_addr: String,
    /// Origins allowed by the CORS layer.
    pub cors_origins: Vec<String>,
    /// `login:argon2-hash` lines for the built-in credential verifier.
    pub credentials_file: Option<String>,
    pub session: SessionConfig,
    pub encryption: EncryptionConfig,
    pub throttle: ThrottleConfig,
}

impl Config {
    /// Creates a new `Config` from environment variables.
    ///
    /// # Returns
    ///
    /// A `Result` containing the `Config`.
    pub fn from_env() -> Result<Self> {
        let internal_service_key = env::var("INTERNAL_SERVICE_KEY")
            .ok()
            .filter(|key| !key.is_empty())
            .map(Zeroizing::new);

        let session = SessionConfig {
            duration_minutes: parse_var("SESSION_DURATION_MINUTES", 60)?,
            refresh_threshold_minutes: parse_var("SESSION_REFRESH_THRESHOLD_MINUTES", 15)?,
        };
        if session.duration_minutes < 1 {
            anyhow::bail!("SESSION_DURATION_MINUTES must be at least 1");
        }

        let defaults = ThrottleConfig::default();

        Ok(Self {
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            cache_namespace: env::var("CACHE_NAMESPACE")
                .unwrap_or_else(|_| "sentinel".to_string()),
            bind_addr: env::var("BIND_ADDR")
                .unwrap_or_else(|_| "127.0.0.1:3000".to_string()),
            cors_origins: env::var("CORS_ORIGINS")
                .unwrap_or_else(|_| "http://localhost:3000".to_string())
                .split(',')
                .map(|origin| origin.trim().to_string())
                .filter(|origin| !origin.is_empty())
                .collect(),
            credentials_file: env::var("CREDENTIALS_FILE")
                .ok()
                .filter(|path| !path.trim().is_empty()),
            session,
            encryption: EncryptionConfig {
                enforce: parse_var("ENFORCE_ENCRYPTION", true)?,
                internal_service_key,
            },
            throttle: ThrottleConfig {
                user: ThrottlePolicy::from_env("THROTTLE_USER", defaults.user)?,
                fingerprint: ThrottlePolicy::from_env("THROTTLE_FINGERPRINT", defaults.fingerprint)?,
                composite: ThrottlePolicy::from_env("THROTTLE_COMPOSITE", defaults.composite)?,
            },
        })
    }

    /// A configuration suitable for tests and local tooling.
    pub fn for_namespace(namespace: impl Into<String>) -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            cache_namespace: namespace.into(),
            bind_addr: "127.0.0.1:3000".to_string(),
            cors_origins: vec!["http://localhost:3000".to_string()],
            credentials_file: None,
            session: SessionConfig::default(),
            encryption: EncryptionConfig {
                enforce: true,
                internal_service_key: None,
            },
            throttle: ThrottleConfig::default(),
        }
    }
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid {name}")),
        Err(_) => Ok(default),
    }
}
