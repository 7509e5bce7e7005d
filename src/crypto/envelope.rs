//! Envelope encryption for single field values.
//!
//! A random AES-256 data key encrypts the value. The data key is wrapped
//! with a key agreed between a fresh ephemeral X25519 secret and the
//! recipient's public key (HKDF-SHA256 over the shared secret).
//!
//! ```text
//! ephemeral_public(32) || wrap_nonce(12) || wrapped_key(48) || nonce(12) || ciphertext+tag
//! \__________________ header __________________/
//! ```
//!
//! The wrapped key authenticates the ephemeral public key and the value
//! authenticates the whole header, so no part can be swapped between envelopes.

use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey, SharedSecret};
use zeroize::{Zeroize, Zeroizing};

use crate::crypto::aes::{SecureKey, KEY_SIZE, NONCE_SIZE, TAG_SIZE};
use crate::crypto::keys::{self, KEY_LEN};
use crate::error::{AppError, Result};

const WRAP_INFO: &[u8] = b"sentinel-field-envelope-v1";

/// Size of the data key once wrapped.
pub const WRAPPED_KEY_LEN: usize = KEY_SIZE + TAG_SIZE;

const HEADER_LEN: usize = KEY_LEN + NONCE_SIZE + WRAPPED_KEY_LEN;

/// Smallest possible envelope: an empty value still carries the header and a tag.
pub const MIN_ENVELOPE_LEN: usize = HEADER_LEN + NONCE_SIZE + TAG_SIZE;

fn derive_wrap_key(
    shared: &SharedSecret,
    ephemeral_public: &PublicKey,
    recipient_public: &PublicKey,
) -> Result<SecureKey> {
    if !shared.was_contributory() {
        return Err(AppError::Encryption("Non-contributory key agreement".to_string()));
    }

    let mut salt = [0u8; KEY_LEN * 2];
    salt[..KEY_LEN].copy_from_slice(ephemeral_public.as_bytes());
    salt[KEY_LEN..].copy_from_slice(recipient_public.as_bytes());

    let hk = Hkdf::<Sha256>::new(Some(&salt), shared.as_bytes());
    let mut okm = [0u8; KEY_SIZE];
    hk.expand(WRAP_INFO, &mut okm)
        .map_err(|e| AppError::Encryption(format!("HKDF expand failed: {}", e)))?;

    let key = SecureKey::new(okm);
    okm.zeroize();
    Ok(key)
}

/// Encrypts `plaintext` toward the holder of the secret matching `recipient_public_key`.
pub fn seal(recipient_public_key: &str, plaintext: &[u8]) -> Result<Vec<u8>> {
    let recipient = keys::decode_public_key(recipient_public_key)?;

    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&recipient);
    let wrap_key = derive_wrap_key(&shared, &ephemeral_public, &recipient)?;

    let data_key = SecureKey::random();
    let (wrap_nonce, wrapped_key) = wrap_key.seal(data_key.as_bytes(), ephemeral_public.as_bytes())?;

    let mut envelope = Vec::with_capacity(MIN_ENVELOPE_LEN + plaintext.len());
    envelope.extend_from_slice(ephemeral_public.as_bytes());
    envelope.extend_from_slice(&wrap_nonce);
    envelope.extend_from_slice(&wrapped_key);

    let (nonce, ciphertext) = data_key.seal(plaintext, &envelope)?;
    envelope.extend_from_slice(&nonce);
    envelope.extend_from_slice(&ciphertext);

    Ok(envelope)
}

/// Reverses [`seal`] with the recipient's base64 secret key.
pub fn open(recipient_secret_key: &str, envelope: &[u8]) -> Result<Vec<u8>> {
    if envelope.len() < MIN_ENVELOPE_LEN {
        return Err(AppError::Encryption("Envelope too short".to_string()));
    }

    let secret = keys::decode_secret_key(recipient_secret_key)?;
    let recipient_public = PublicKey::from(&secret);

    let (header, body) = envelope.split_at(HEADER_LEN);
    let (ephemeral_bytes, rest) = header.split_at(KEY_LEN);
    let (wrap_nonce, wrapped_key) = rest.split_at(NONCE_SIZE);
    let (nonce, ciphertext) = body.split_at(NONCE_SIZE);

    let ephemeral_bytes: [u8; KEY_LEN] = ephemeral_bytes
        .try_into()
        .map_err(|_| AppError::Encryption("Invalid ephemeral key".to_string()))?;
    let ephemeral_public = PublicKey::from(ephemeral_bytes);
    let shared = secret.diffie_hellman(&ephemeral_public);
    let wrap_key = derive_wrap_key(&shared, &ephemeral_public, &recipient_public)?;

    let data_key = Zeroizing::new(wrap_key.open(wrap_nonce, wrapped_key, ephemeral_public.as_bytes())?);
    let data_key = SecureKey::from_slice(&data_key)?;

    data_key.open(nonce, ciphertext, header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::generate_key_pair;

    #[test]
    fn sealed_value_opens_with_matching_secret() {
        let pair = generate_key_pair();
        let envelope = seal(&pair.public_key, b"4111 1111 1111 1111").unwrap();
        assert!(envelope.len() >= MIN_ENVELOPE_LEN);
        assert_eq!(open(&pair.secret_key, &envelope).unwrap(), b"4111 1111 1111 1111");
    }

    #[test]
    fn same_value_seals_differently_each_time() {
        let pair = generate_key_pair();
        let a = seal(&pair.public_key, b"same").unwrap();
        let b = seal(&pair.public_key, b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn other_secret_cannot_open() {
        let pair = generate_key_pair();
        let intruder = generate_key_pair();
        let envelope = seal(&pair.public_key, b"secret").unwrap();
        assert!(open(&intruder.secret_key, &envelope).is_err());
    }

    #[test]
    fn truncated_envelope_is_rejected() {
        let pair = generate_key_pair();
        let envelope = seal(&pair.public_key, b"").unwrap();
        assert_eq!(envelope.len(), MIN_ENVELOPE_LEN);
        assert!(open(&pair.secret_key, &envelope[..MIN_ENVELOPE_LEN - 1]).is_err());
    }

    #[test]
    fn swapped_header_is_rejected() {
        let pair = generate_key_pair();
        let first = seal(&pair.public_key, b"first").unwrap();
        let second = seal(&pair.public_key, b"second").unwrap();

        let mut spliced = first[..HEADER_LEN].to_vec();
        spliced.extend_from_slice(&second[HEADER_LEN..]);
        assert!(open(&pair.secret_key, &spliced).is_err());
    }
}
