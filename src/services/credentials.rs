//! File-backed credential verifier for the standalone server.
//!
//! Each non-empty line is `login:argon2-phc-hash`; lines starting with `#`
//! are ignored. Logins are matched trimmed and lowercased, and the
//! normalized login doubles as the subject id.

use anyhow::Context;
use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordVerifier},
};
use async_trait::async_trait;
use std::collections::HashMap;

use crate::error::{AppError, Result};
use crate::services::auth::CredentialVerifier;

#[derive(Debug, Default, Clone)]
pub struct FileCredentials {
    hashes: HashMap<String, String>,
}

fn normalize(login: &str) -> String {
    login.trim().to_lowercase()
}

impl FileCredentials {
    /// A verifier that knows no one. Every sign-in is rejected and throttled.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn parse(contents: &str) -> anyhow::Result<Self> {
        let mut hashes = HashMap::new();

        for (number, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (login, hash) = line
                .split_once(':')
                .with_context(|| format!("Credentials line {} is not login:hash", number + 1))?;
            let login = normalize(login);
            if login.is_empty() {
                anyhow::bail!("Credentials line {} has an empty login", number + 1);
            }
            PasswordHash::new(hash.trim())
                .map_err(|e| anyhow::anyhow!("Credentials line {}: {}", number + 1, e))?;

            hashes.insert(login, hash.trim().to_string());
        }

        Ok(Self { hashes })
    }

    pub async fn load(path: &str) -> anyhow::Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read credentials file {path}"))?;
        Self::parse(&contents)
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }
}

#[async_trait]
impl CredentialVerifier for FileCredentials {
    async fn resolve_subject(&self, login: &str) -> Result<Option<String>> {
        let login = normalize(login);
        Ok(self.hashes.contains_key(&login).then_some(login))
    }

    async fn verify(&self, subject_id: &str, secret: &str) -> Result<bool> {
        let Some(hash) = self.hashes.get(subject_id).cloned() else {
            return Ok(false);
        };
        let secret = zeroize::Zeroizing::new(secret.as_bytes().to_vec());

        // Argon2 blocks; run it off the async workers.
        tokio::task::spawn_blocking(move || -> Result<bool> {
            let parsed = PasswordHash::new(&hash)
                .map_err(|e| AppError::Encryption(format!("Hash parse error: {}", e)))?;
            let accepted = Argon2::default().verify_password(&secret, &parsed).is_ok();
            tracing::debug!("Password verification completed");
            Ok(accepted)
        })
        .await
        .map_err(|e| AppError::Internal(format!("Password verification task failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use argon2::{Algorithm, Params, Version, password_hash::{PasswordHasher, SaltString}};

    fn hash(secret: &str) -> String {
        let salt = SaltString::generate(&mut rand::rngs::OsRng);
        let params = Params::new(1024, 1, 1, None).unwrap();
        Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
            .hash_password(secret.as_bytes(), &salt)
            .unwrap()
            .to_string()
    }

    #[tokio::test]
    async fn verifies_known_logins() {
        let contents = format!("# operators\n\nAlice@Example.com:{}\n", hash("correct horse"));
        let credentials = FileCredentials::parse(&contents).unwrap();
        assert_eq!(credentials.len(), 1);

        let subject = credentials
            .resolve_subject("  alice@example.com ")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(subject, "alice@example.com");
        assert!(credentials.verify(&subject, "correct horse").await.unwrap());
        assert!(!credentials.verify(&subject, "battery staple").await.unwrap());
    }

    #[tokio::test]
    async fn unknown_logins_resolve_to_nothing() {
        let credentials = FileCredentials::empty();
        assert!(credentials.is_empty());
        assert_eq!(credentials.resolve_subject("bob").await.unwrap(), None);
        assert!(!credentials.verify("bob", "anything").await.unwrap());
    }

    #[test]
    fn malformed_lines_are_rejected() {
        assert!(FileCredentials::parse("alice").is_err());
        assert!(FileCredentials::parse(":$argon2id$v=19$m=1024,t=1,p=1$c2FsdA$aGFzaA").is_err());
        assert!(FileCredentials::parse("alice:not-a-hash").is_err());
    }
}
