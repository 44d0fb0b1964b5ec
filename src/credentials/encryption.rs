//! AES-256-GCM encryption for stored tokens.
//!
//! Each token is sealed with a fresh random nonce. The nonce is
//! prepended to the ciphertext and the whole blob is base64-encoded,
//! so one database column holds everything needed for decryption
//! (except the master key, which is provided from an environment
//! variable and never written to disk).

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

/// Master key size in bytes (256 bits)
const KEY_SIZE: usize = 32;

/// Nonce size in bytes (96 bits, standard for GCM)
const NONCE_SIZE: usize = 12;

/// Decodes and validates the base64 master key.
///
/// # Returns
/// * `Ok(Vec<u8>)` - Decoded 32-byte key
/// * `Err` - If the key is not valid base64 or not 32 bytes
pub fn validate_key(key_base64: &str) -> Result<Vec<u8>> {
    let key_bytes = BASE64
        .decode(key_base64)
        .context("Encryption key is not valid base64")?;

    if key_bytes.len() != KEY_SIZE {
        return Err(anyhow!(
            "Encryption key must be {} bytes (256 bits), got {}",
            KEY_SIZE,
            key_bytes.len()
        ));
    }

    Ok(key_bytes)
}

/// Encrypts a token and returns a base64 blob of `nonce || ciphertext`.
///
/// A fresh random nonce is drawn for every call; encrypting the same
/// plaintext twice yields different blobs.
pub fn encrypt(plaintext: &str, key: &[u8]) -> Result<String> {
    if key.len() != KEY_SIZE {
        return Err(anyhow!("Encryption key must be {} bytes", KEY_SIZE));
    }

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| anyhow!("Failed to create cipher: {}", e))?;

    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext.as_bytes())
        .map_err(|e| anyhow!("Encryption failed: {}", e))?;

    let mut blob = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);

    Ok(BASE64.encode(&blob))
}

/// Decrypts a base64 `nonce || ciphertext` blob produced by [`encrypt`].
///
/// Fails on a wrong key, a truncated blob, or tampered ciphertext
/// (GCM is authenticated).
pub fn decrypt(blob_base64: &str, key: &[u8]) -> Result<String> {
    if key.len() != KEY_SIZE {
        return Err(anyhow!("Encryption key must be {} bytes", KEY_SIZE));
    }

    let blob = BASE64
        .decode(blob_base64)
        .context("Failed to decode encrypted token")?;

    if blob.len() <= NONCE_SIZE {
        return Err(anyhow!(
            "Encrypted token too short: {} bytes",
            blob.len()
        ));
    }
    let (nonce_bytes, ciphertext) = blob.split_at(NONCE_SIZE);

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| anyhow!("Failed to create cipher: {}", e))?;

    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|e| anyhow!("Decryption failed (wrong key or corrupted data): {}", e))?;

    String::from_utf8(plaintext).context("Decrypted token is not valid UTF-8")
}
