//! Cryptographic primitives for the route-service signature envelope.
//!
//! A shared secret is stretched into an AES-256 key with PBKDF2; envelopes
//! are sealed with AES-GCM. The wire format is base64(nonce || ciphertext)
//! where the nonce is 12 bytes and the GCM tag trails the ciphertext.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ring::pbkdf2;
use std::num::NonZeroU32;

/// The length of the AES-256 key in bytes
const KEY_LENGTH: usize = 32;

/// The length of the AES-GCM nonce in bytes
const NONCE_LENGTH: usize = 12;

/// Number of PBKDF2 iterations for key derivation
const PBKDF2_ITERATIONS: u32 = 100_000;

/// Fixed 16-byte PBKDF2 salt. Both key generations derive against the same
/// salt so rotation only has to move the secret.
const PBKDF2_SALT: &[u8; 16] = b"gantry-route-svc";

/// Derive a 256-bit key from a shared secret using PBKDF2-HMAC-SHA256.
pub fn derive_key(secret: &str) -> [u8; KEY_LENGTH] {
    let mut key = [0u8; KEY_LENGTH];
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        NonZeroU32::new(PBKDF2_ITERATIONS).unwrap(),
        PBKDF2_SALT,
        secret.as_bytes(),
        &mut key,
    );
    key
}

/// AES-256-GCM sealer/opener bound to one derived key generation.
#[derive(Clone)]
pub struct AesGcm {
    cipher: Aes256Gcm,
}

impl AesGcm {
    /// Build a cipher from a shared secret. An empty secret is refused:
    /// that is a startup-fatal misconfiguration, not a runtime condition.
    pub fn from_secret(secret: &str) -> Result<Self> {
        if secret.is_empty() {
            anyhow::bail!("route service secret must not be empty");
        }
        let key = derive_key(secret);
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| anyhow::anyhow!("Failed to create cipher: {:?}", e))?;
        Ok(Self { cipher })
    }

    /// Seal plaintext, returning base64(nonce || ciphertext).
    pub fn seal(&self, plaintext: &[u8]) -> Result<String> {
        use rand::RngCore;

        let mut nonce_bytes = [0u8; NONCE_LENGTH];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| anyhow::anyhow!("Encryption failed: {}", e))?;

        let mut combined = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);

        Ok(BASE64.encode(&combined))
    }

    /// Open base64(nonce || ciphertext) back into the plaintext. Fails on
    /// malformed input or any authentication mismatch.
    pub fn open(&self, sealed: &str) -> Result<Vec<u8>> {
        let combined = BASE64.decode(sealed).context("Failed to decode base64")?;

        if combined.len() <= NONCE_LENGTH {
            anyhow::bail!("Sealed value too short");
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LENGTH);
        let nonce = Nonce::from_slice(nonce_bytes);

        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| anyhow::anyhow!("Decryption failed: authentication mismatch"))
    }
}
