use base64::{Engine as _, engine::general_purpose};
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::error::{AppError, Result};

/// The size of an X25519 key in bytes.
pub const KEY_LEN: usize = 32;

/// A base64-encoded X25519 key pair.
pub struct KeyPair {
    /// Public half, safe to hand to the other party.
    pub public_key: String,
    /// Secret half. Never leaves the session record.
    pub secret_key: Zeroizing<String>,
}

/// Generates a fresh X25519 key pair.
pub fn generate_key_pair() -> KeyPair {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    let secret_bytes = Zeroizing::new(secret.to_bytes());

    KeyPair {
        public_key: general_purpose::STANDARD.encode(public.as_bytes()),
        secret_key: Zeroizing::new(general_purpose::STANDARD.encode(&secret_bytes[..])),
    }
}

fn decode_key_bytes(encoded: &str, what: &str) -> Result<Zeroizing<[u8; KEY_LEN]>> {
    let raw = Zeroizing::new(
        general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|_| AppError::Encryption(format!("{what} is not valid base64")))?,
    );
    let bytes: [u8; KEY_LEN] = raw
        .as_slice()
        .try_into()
        .map_err(|_| AppError::Encryption(format!("{what} must be {KEY_LEN} bytes")))?;
    Ok(Zeroizing::new(bytes))
}

/// Decodes a base64 X25519 public key.
pub fn decode_public_key(encoded: &str) -> Result<PublicKey> {
    let bytes = decode_key_bytes(encoded, "public key")?;
    Ok(PublicKey::from(*bytes))
}

/// Decodes a base64 X25519 secret key.
pub fn decode_secret_key(encoded: &str) -> Result<StaticSecret> {
    let bytes = decode_key_bytes(encoded, "secret key")?;
    Ok(StaticSecret::from(*bytes))
}

/// Derives the base64 public key matching a base64 secret key.
pub fn public_key_for(secret_key: &str) -> Result<String> {
    let secret = decode_secret_key(secret_key)?;
    Ok(general_purpose::STANDARD.encode(PublicKey::from(&secret).as_bytes()))
}
