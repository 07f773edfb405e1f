//! Secrets encryption using AES-256-GCM with SHA-256-based key derivation.
//!
//! Values at rest are stored in a versioned envelope:
//!
//! ```text
//! ENC:v1:<context_id>:<unix_ts>:<base64(nonce || ciphertext || tag)>
//! ```
//!
//! A previous-key slot permits transparent rotation: decryption tries the
//! current key first, then the previous one, without re-encrypting all rows
//! at once.

use aes_gcm::{Aes256Gcm, KeyInit, Nonce, aead::Aead};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha2::{Digest, Sha256};

/// Envelope prefix for the current format version.
const ENVELOPE_PREFIX: &str = "ENC:v1";

/// Manages encryption/decryption of secrets using AES-256-GCM.
pub struct SecretsManager {
    key: [u8; 32],
    previous_key: Option<[u8; 32]>,
}

impl SecretsManager {
    /// Create a new SecretsManager from a passphrase.
    ///
    /// Derives a 32-byte key using iterated SHA-256 hashing (100,000
    /// rounds). Rejects empty passphrases to prevent weak keys.
    pub fn new(passphrase: &str) -> Self {
        assert!(
            !passphrase.is_empty(),
            "SecretsManager passphrase must not be empty"
        );
        Self {
            key: derive_key(passphrase),
            previous_key: None,
        }
    }

    /// Attach a previous passphrase for rotation-window decryption.
    pub fn with_previous(mut self, passphrase: &str) -> Self {
        if !passphrase.is_empty() {
            self.previous_key = Some(derive_key(passphrase));
        }
        self
    }

    /// Encrypt a plaintext into a versioned envelope string.
    ///
    /// Each call generates a fresh random 12-byte nonce, so encrypting the
    /// same plaintext twice produces different envelopes. `context_id`
    /// identifies the owning row and is carried in the clear.
    pub fn encrypt(&self, context_id: &str, plaintext: &str) -> Result<String, SecretError> {
        if context_id.contains(':') {
            return Err(SecretError::InvalidContext(context_id.into()));
        }
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| SecretError::EncryptionFailed(format!("Key init failed: {e}")))?;
        let nonce_bytes = generate_nonce();
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| SecretError::EncryptionFailed("AES-256-GCM encrypt failed".into()))?;

        let mut blob = Vec::with_capacity(12 + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);

        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        Ok(format!(
            "{ENVELOPE_PREFIX}:{context_id}:{ts}:{}",
            BASE64.encode(blob)
        ))
    }

    /// Decrypt an envelope back to plaintext.
    ///
    /// Tries the current key, then the previous key. Returns an error when
    /// the envelope is malformed, the key is wrong, or the ciphertext was
    /// tampered with (authenticated encryption detects modification).
    pub fn decrypt(&self, envelope: &str) -> Result<String, SecretError> {
        let parsed = parse_envelope(envelope)?;

        let plaintext = self
            .try_decrypt(&self.key, &parsed)
            .or_else(|_| match &self.previous_key {
                Some(prev) => self.try_decrypt(prev, &parsed),
                None => Err(SecretError::DecryptionFailed(
                    "Wrong key or corrupted ciphertext".into(),
                )),
            })?;

        String::from_utf8(plaintext)
            .map_err(|_| SecretError::DecryptionFailed("Invalid UTF-8 after decryption".into()))
    }

    /// Whether a stored value is an envelope this manager understands.
    pub fn is_envelope(value: &str) -> bool {
        value.starts_with(ENVELOPE_PREFIX)
    }

    fn try_decrypt(&self, key: &[u8; 32], parsed: &ParsedEnvelope) -> Result<Vec<u8>, SecretError> {
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| SecretError::DecryptionFailed(format!("Key init failed: {e}")))?;
        let nonce = Nonce::from_slice(&parsed.nonce);
        cipher
            .decrypt(nonce, parsed.ciphertext.as_slice())
            .map_err(|_| SecretError::DecryptionFailed("Wrong key or corrupted ciphertext".into()))
    }
}

struct ParsedEnvelope {
    nonce: [u8; 12],
    ciphertext: Vec<u8>,
}

fn parse_envelope(envelope: &str) -> Result<ParsedEnvelope, SecretError> {
    // ENC:v1:<context>:<ts>:<blob>
    let mut parts = envelope.splitn(5, ':');
    let magic = parts.next().unwrap_or_default();
    let version = parts.next().unwrap_or_default();
    let _context = parts
        .next()
        .ok_or_else(|| SecretError::MalformedEnvelope("missing context".into()))?;
    let _ts = parts
        .next()
        .ok_or_else(|| SecretError::MalformedEnvelope("missing timestamp".into()))?;
    let blob_b64 = parts
        .next()
        .ok_or_else(|| SecretError::MalformedEnvelope("missing payload".into()))?;

    if magic != "ENC" || version != "v1" {
        return Err(SecretError::MalformedEnvelope(format!(
            "unknown envelope header {magic}:{version}"
        )));
    }

    let blob = BASE64
        .decode(blob_b64)
        .map_err(|e| SecretError::MalformedEnvelope(format!("bad base64: {e}")))?;
    if blob.len() < 12 + 16 {
        return Err(SecretError::MalformedEnvelope("payload too short".into()));
    }

    let mut nonce = [0u8; 12];
    nonce.copy_from_slice(&blob[..12]);
    Ok(ParsedEnvelope {
        nonce,
        ciphertext: blob[12..].to_vec(),
    })
}

/// Errors from secrets operations.
#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("Context id must not contain ':': {0}")]
    InvalidContext(String),
}

/// Derive a 32-byte AES key from a passphrase using iterated SHA-256.
///
/// Performs 100,000 rounds of SHA-256 hashing to slow down brute-force
/// attacks. A unique salt is mixed in to prevent rainbow table attacks.
fn derive_key(passphrase: &str) -> [u8; 32] {
    let salt = b"tmi-secrets-v1-salt";
    let mut hash = Sha256::new();
    hash.update(salt);
    hash.update(passphrase.as_bytes());
    let mut result = hash.finalize();

    for _ in 0..100_000 {
        let mut h = Sha256::new();
        h.update(result);
        h.update(passphrase.as_bytes());
        result = h.finalize();
    }

    let mut key = [0u8; 32];
    key.copy_from_slice(&result);
    key
}

/// Generate a cryptographically random 12-byte nonce for AES-GCM.
fn generate_nonce() -> [u8; 12] {
    use rand::Rng;
    let mut rng = rand::rng();
    let mut nonce = [0u8; 12];
    rng.fill(&mut nonce);
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let manager = SecretsManager::new("my-secure-password-123");
        let envelope = manager.encrypt("sub-1", "whsec_abcdef").unwrap();
        assert!(envelope.starts_with("ENC:v1:sub-1:"));
        assert_eq!(manager.decrypt(&envelope).unwrap(), "whsec_abcdef");
    }

    #[test]
    fn different_nonces_produce_different_envelopes() {
        let manager = SecretsManager::new("password");
        let e1 = manager.encrypt("ctx", "secret").unwrap();
        let e2 = manager.encrypt("ctx", "secret").unwrap();
        assert_ne!(e1, e2);
        assert_eq!(manager.decrypt(&e1).unwrap(), "secret");
        assert_eq!(manager.decrypt(&e2).unwrap(), "secret");
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let m1 = SecretsManager::new("correct-password");
        let m2 = SecretsManager::new("wrong-password");
        let envelope = m1.encrypt("ctx", "secret").unwrap();
        assert!(m2.decrypt(&envelope).is_err());
    }

    #[test]
    fn previous_key_decrypts_during_rotation() {
        let old = SecretsManager::new("old-passphrase");
        let envelope = old.encrypt("ctx", "secret").unwrap();

        let rotated = SecretsManager::new("new-passphrase").with_previous("old-passphrase");
        assert_eq!(rotated.decrypt(&envelope).unwrap(), "secret");

        // New writes use the new key and still decrypt
        let fresh = rotated.encrypt("ctx", "secret2").unwrap();
        assert_eq!(rotated.decrypt(&fresh).unwrap(), "secret2");
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let manager = SecretsManager::new("password");
        let envelope = manager.encrypt("ctx", "secret").unwrap();
        let mut tampered = envelope.clone();
        tampered.pop();
        tampered.push(if envelope.ends_with('A') { 'B' } else { 'A' });
        assert!(manager.decrypt(&tampered).is_err());
    }

    #[test]
    fn malformed_envelopes_are_rejected() {
        let manager = SecretsManager::new("password");
        assert!(manager.decrypt("not-an-envelope").is_err());
        assert!(manager.decrypt("ENC:v2:ctx:0:AAAA").is_err());
        assert!(manager.decrypt("ENC:v1:ctx:0:!!!").is_err());
        assert!(manager.decrypt("ENC:v1:ctx:0:AAAA").is_err());
    }

    #[test]
    fn context_with_colon_is_rejected() {
        let manager = SecretsManager::new("password");
        assert!(manager.encrypt("a:b", "secret").is_err());
    }

    #[test]
    fn is_envelope_detects_format() {
        assert!(SecretsManager::is_envelope("ENC:v1:x:0:AAAA"));
        assert!(!SecretsManager::is_envelope("plaintext-secret"));
    }
}
