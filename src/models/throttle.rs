use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::{ThrottleConfig, ThrottlePolicy};

/// An independent failure-counting bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Partition {
    User,
    Fingerprint,
    Composite,
}

impl Partition {
    /// Cache key prefix for the partition.
    pub fn prefix(&self) -> &'static str {
        match self {
            Partition::User => "throttle:user",
            Partition::Fingerprint => "throttle:fingerprint",
            Partition::Composite => "throttle:composite",
        }
    }

    pub fn policy(&self, config: &ThrottleConfig) -> ThrottlePolicy {
        match self {
            Partition::User => config.user,
            Partition::Fingerprint => config.fingerprint,
            Partition::Composite => config.composite,
        }
    }

    pub fn cache_key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix(), key)
    }
}

/// Per-attempt partition keys computed by the authentication endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThrottlingContext {
    /// Normalized identity, `None` when the login did not resolve to a user.
    pub user_key: Option<String>,
    pub fingerprint_key: String,
    /// Hex SHA-256 of identity and fingerprint.
    pub composite_key: String,
}

impl ThrottlingContext {
    pub fn new(user: Option<&str>, fingerprint: &str) -> Self {
        let user_key = user
            .map(|u| u.trim().to_lowercase())
            .filter(|u| !u.is_empty());

        let mut hasher = Sha256::new();
        hasher.update(user_key.as_deref().unwrap_or("").as_bytes());
        hasher.update(b"|");
        hasher.update(fingerprint.as_bytes());
        let composite_key = hex::encode(hasher.finalize());

        Self {
            user_key,
            fingerprint_key: fingerprint.to_string(),
            composite_key,
        }
    }

    /// Applicable partitions in check order: user, fingerprint, composite.
    pub fn partitions(&self) -> Vec<(Partition, &str)> {
        let mut partitions = Vec::with_capacity(3);
        if let Some(user) = self.user_key.as_deref() {
            partitions.push((Partition::User, user));
        }
        partitions.push((Partition::Fingerprint, self.fingerprint_key.as_str()));
        partitions.push((Partition::Composite, self.composite_key.as_str()));
        partitions
    }
}

/// Fixed-window failure counter for one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureState {
    pub count: u32,
    pub first_failure_at: DateTime<Utc>,
    pub lock_until: Option<DateTime<Utc>>,
    /// Bumped on every write.
    #[serde(default)]
    pub version: u64,
}

impl FailureState {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            count: 0,
            first_failure_at: now,
            lock_until: None,
            version: 0,
        }
    }

    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.lock_until.is_some_and(|until| until > now)
    }

    /// Lock duration in seconds for a given failure count.
    pub fn lock_seconds(count: u32, policy: &ThrottlePolicy) -> Option<u64> {
        if count < policy.threshold {
            return None;
        }
        let doublings = (count - policy.threshold).min(63);
        let seconds = policy
            .base_lock_seconds
            .saturating_mul(1u64 << doublings)
            .min(policy.max_lock_seconds);
        Some(seconds)
    }

    /// Applies one failure at `now`.
    pub fn record_failure(&mut self, now: DateTime<Utc>, policy: &ThrottlePolicy) {
        if now - self.first_failure_at > policy.window() {
            self.count = 0;
            self.first_failure_at = now;
            self.lock_until = None;
        }

        self.count = self.count.saturating_add(1);
        self.version = self.version.wrapping_add(1);

        if let Some(seconds) = Self::lock_seconds(self.count, policy) {
            let candidate = now + Duration::seconds(seconds as i64);
            // Never shorten a lock that is already in force.
            if self.lock_until.is_none_or(|existing| candidate > existing) {
                self.lock_until = Some(candidate);
            }
        }
    }

    /// Cache lifetime: long enough to outlive both the window and any lock, at least one second.
    pub fn time_to_live(&self, now: DateTime<Utc>, policy: &ThrottlePolicy) -> std::time::Duration {
        let window_end = self.first_failure_at + policy.window();
        let deadline = self.lock_until.map_or(window_end, |until| until.max(window_end));
        (deadline - now)
            .to_std()
            .unwrap_or_default()
            .max(std::time::Duration::from_secs(1))
    }
}
