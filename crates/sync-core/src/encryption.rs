//! Workspace content encryption.
//!
//! Every note body crosses the wire as an opaque envelope produced here:
//! `nonce(12) || ciphertext || auth_tag(16)`. The tag is appended by
//! AES-GCM itself, so the smallest well-formed envelope is 28 bytes
//! (an encrypted empty note).
//!
//! The content key is derived from the user's password and the workspace
//! salt. It is never derived from the device fingerprint and it never
//! touches disk; locking the manager drops it.

use std::sync::RwLock;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use pbkdf2::pbkdf2_hmac;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

const KDF_ITERATIONS: u32 = 100_000;
const KEY_BYTES: usize = 32;
const SALT_BYTES: usize = 32;
const NONCE_BYTES: usize = 12;
const TAG_BYTES: usize = 16;
const MIN_ENVELOPE_BYTES: usize = NONCE_BYTES + TAG_BYTES;

const SALT_TAG: &str = "inkstone/workspace-salt/v1:";

#[derive(Debug, Error)]
pub enum EncryptionError {
    #[error("Content key is not loaded; unlock first")]
    Locked,

    #[error("Malformed envelope: {0}")]
    Malformed(String),

    #[error("Decryption failed (wrong key or tampered envelope)")]
    DecryptFailed,

    #[error("Encryption failed")]
    EncryptFailed,
}

pub type Result<T> = std::result::Result<T, EncryptionError>;

/// Derive the 32-byte workspace content key from the sync password and the
/// per-workspace salt. The salt is distinct from the credential salt, so
/// neither the auth proof nor the device-bound blob can yield this key.
pub fn derive_workspace_key(password: &str, workspace_salt: &[u8]) -> [u8; KEY_BYTES] {
    let mut key = [0u8; KEY_BYTES];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), workspace_salt, KDF_ITERATIONS, &mut key);
    key
}

/// Derive the workspace salt from the account email.
///
/// Deterministic, so every device on the account arrives at the same
/// content key with no salt exchange. The email is not secret; the KDF
/// cost lives in `derive_workspace_key`.
pub fn derive_workspace_salt(email: &str) -> [u8; SALT_BYTES] {
    let normalized = email.trim().to_lowercase();
    let mut hasher = Sha256::new();
    hasher.update(SALT_TAG.as_bytes());
    hasher.update(normalized.as_bytes());
    hasher.finalize().into()
}

/// Holds the workspace content key while the engine is unlocked.
///
/// Shared across tasks behind `Arc`; unlock/lock take `&self`.
pub struct EncryptionManager {
    cipher: RwLock<Option<Aes256Gcm>>,
}

impl EncryptionManager {
    pub fn new() -> Self {
        Self {
            cipher: RwLock::new(None),
        }
    }

    /// Derive the content key and load it. Replaces any previous key.
    pub fn unlock(&self, password: &str, workspace_salt: &[u8]) {
        let key = derive_workspace_key(password, workspace_salt);
        self.load_key(&key);
    }

    /// Load a pre-derived key directly (unlock via stored credential).
    pub fn load_key(&self, key: &[u8; KEY_BYTES]) {
        let cipher = Aes256Gcm::new(key.into());
        *self.cipher.write().unwrap() = Some(cipher);
        debug!("Content key loaded");
    }

    /// Drop the content key.
    pub fn lock(&self) {
        *self.cipher.write().unwrap() = None;
        debug!("Content key dropped");
    }

    pub fn is_unlocked(&self) -> bool {
        self.cipher.read().unwrap().is_some()
    }

    /// Encrypt plaintext into an envelope with a fresh random nonce.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let guard = self.cipher.read().unwrap();
        let cipher = guard.as_ref().ok_or(EncryptionError::Locked)?;

        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let nonce_bytes: [u8; NONCE_BYTES] = nonce.into();

        let ciphertext_with_tag = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| EncryptionError::EncryptFailed)?;

        let mut envelope = Vec::with_capacity(NONCE_BYTES + ciphertext_with_tag.len());
        envelope.extend_from_slice(&nonce_bytes);
        envelope.extend_from_slice(&ciphertext_with_tag);
        Ok(envelope)
    }

    /// Decrypt an envelope. Verifies the auth tag; any mismatch (wrong key,
    /// flipped bit, truncation past the minimum) is `DecryptFailed`.
    pub fn decrypt(&self, envelope: &[u8]) -> Result<Vec<u8>> {
        if envelope.len() < MIN_ENVELOPE_BYTES {
            return Err(EncryptionError::Malformed(format!(
                "{} bytes, need at least {}",
                envelope.len(),
                MIN_ENVELOPE_BYTES
            )));
        }

        let guard = self.cipher.read().unwrap();
        let cipher = guard.as_ref().ok_or(EncryptionError::Locked)?;

        let nonce_bytes: [u8; NONCE_BYTES] = envelope[..NONCE_BYTES]
            .try_into()
            .map_err(|_| EncryptionError::Malformed("bad nonce slice".into()))?;
        let nonce = Nonce::from(nonce_bytes);

        cipher
            .decrypt(&nonce, &envelope[NONCE_BYTES..])
            .map_err(|_| EncryptionError::DecryptFailed)
    }
}

impl Default for EncryptionManager {
    fn default() -> Self {
        Self::new()
    }
}
