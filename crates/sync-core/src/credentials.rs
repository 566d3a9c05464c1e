//! Device-bound credential storage.
//!
//! Persists the user's sync password encrypted under a key derived from the
//! device fingerprint, so the blob is useless off this installation. Lost
//! devices are handled by re-authentication, never by decrypting the blob
//! elsewhere.
//!
//! Format history:
//! - v1 (legacy): bare base64 of the password XORed with the fingerprint.
//!   Obfuscation only; migrated to v2 transparently on first read.
//! - v2 (current): JSON `{ "v": 2, "blob": base64(nonce || ciphertext) }`
//!   where the ciphertext is AES-256-GCM under PBKDF2(fingerprint, salt).

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::KvStore;
use crate::fingerprint::device_fingerprint;

const CREDENTIAL_KEY: &str = "sync.credential";
const SALT_KEY: &str = "sync.credential_salt";

const KDF_ITERATIONS: u32 = 100_000;
const KEY_BYTES: usize = 32;
const SALT_BYTES: usize = 32;
const NONCE_BYTES: usize = 12;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("No stored credential")]
    Missing,

    #[error("Stored credential is corrupted: {0}")]
    Corrupted(String),

    #[error("Credential cannot be decrypted on this device (fingerprint changed or blob tampered)")]
    DeviceMismatch,

    #[error("Config store error: {0}")]
    Store(#[from] crate::config::ConfigError),
}

pub type Result<T> = std::result::Result<T, CredentialError>;

#[derive(Serialize, Deserialize)]
struct CredentialBlob {
    v: u32,
    blob: String,
}

/// Encrypts and persists the sync password, bound to this device.
///
/// Never performs network IO. All state lives in the host's key/value
/// store; the derived key is recomputed per call rather than cached.
pub struct CredentialStorage<S: KvStore> {
    store: S,
    fingerprint: String,
}

impl<S: KvStore> CredentialStorage<S> {
    pub fn new(store: S) -> Self {
        Self {
            fingerprint: device_fingerprint(),
            store,
        }
    }

    /// Construct with an explicit fingerprint. Tests use this to simulate
    /// the blob landing on a different device.
    pub fn with_fingerprint(store: S, fingerprint: impl Into<String>) -> Self {
        Self {
            store,
            fingerprint: fingerprint.into(),
        }
    }

    /// Encrypt and persist the password with a fresh nonce.
    pub fn store_password(&self, password: &str) -> Result<()> {
        let salt = self.get_or_create_salt()?;
        let key = self.derive_key(&salt);

        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| CredentialError::Corrupted(format!("invalid key length: {e}")))?;

        let mut nonce_bytes = [0u8; NONCE_BYTES];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, password.as_bytes())
            .map_err(|_| CredentialError::Corrupted("encryption failed".into()))?;

        let mut blob = Vec::with_capacity(NONCE_BYTES + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);

        let entry = CredentialBlob {
            v: 2,
            blob: BASE64.encode(&blob),
        };
        self.store
            .set(CREDENTIAL_KEY, &serde_json::to_string(&entry).map_err(|e| {
                CredentialError::Corrupted(format!("serialize failed: {e}"))
            })?)?;
        debug!("Stored device-bound credential");
        Ok(())
    }

    /// Decrypt and return the stored password.
    ///
    /// A v1 entry is migrated to v2 in place on the first successful read.
    pub fn get_password(&self) -> Result<String> {
        let raw = self.store.get(CREDENTIAL_KEY).ok_or(CredentialError::Missing)?;

        match serde_json::from_str::<CredentialBlob>(&raw) {
            Ok(entry) if entry.v == 2 => self.decrypt_v2(&entry.blob),
            Ok(entry) => Err(CredentialError::Corrupted(format!(
                "unknown credential format version {}",
                entry.v
            ))),
            // Not the JSON wrapper: try the legacy format and upgrade.
            Err(_) => {
                let password = self.decrypt_legacy(&raw)?;
                info!("Migrating legacy credential blob to the current format");
                self.store_password(&password)?;
                Ok(password)
            }
        }
    }

    /// Whether a credential entry exists, readable or not. A blob that can
    /// no longer be decrypted still reports true; callers learn the
    /// difference from `get_password`.
    pub fn has_password(&self) -> bool {
        self.store.get(CREDENTIAL_KEY).is_some()
    }

    /// Remove the stored credential. The salt stays; it is per-install,
    /// not per-password.
    pub fn clear_password(&self) -> Result<()> {
        self.store.remove(CREDENTIAL_KEY)?;
        Ok(())
    }

    fn decrypt_v2(&self, encoded: &str) -> Result<String> {
        let blob = BASE64
            .decode(encoded)
            .map_err(|e| CredentialError::Corrupted(format!("invalid base64: {e}")))?;
        // nonce + at least the GCM tag
        if blob.len() < NONCE_BYTES + 16 {
            return Err(CredentialError::Corrupted("blob too short".into()));
        }

        let salt = self.load_salt()?;
        let key = self.derive_key(&salt);
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| CredentialError::Corrupted(format!("invalid key length: {e}")))?;

        let nonce = Nonce::from_slice(&blob[..NONCE_BYTES]);
        let plaintext = cipher.decrypt(nonce, &blob[NONCE_BYTES..]).map_err(|_| {
            warn!("Credential decrypt failed; fingerprint changed or blob tampered");
            CredentialError::DeviceMismatch
        })?;

        String::from_utf8(plaintext)
            .map_err(|_| CredentialError::Corrupted("decrypted data is not UTF-8".into()))
    }

    /// v1 stored base64(password XOR fingerprint). Weak by construction,
    /// which is why it was replaced.
    fn decrypt_legacy(&self, raw: &str) -> Result<String> {
        let bytes = BASE64
            .decode(raw.trim())
            .map_err(|e| CredentialError::Corrupted(format!("unrecognized format: {e}")))?;
        let fp = self.fingerprint.as_bytes();
        let plaintext: Vec<u8> = bytes
            .iter()
            .enumerate()
            .map(|(i, b)| b ^ fp[i % fp.len()])
            .collect();
        String::from_utf8(plaintext).map_err(|_| CredentialError::DeviceMismatch)
    }

    fn derive_key(&self, salt: &[u8]) -> [u8; KEY_BYTES] {
        let mut key = [0u8; KEY_BYTES];
        pbkdf2_hmac::<Sha256>(self.fingerprint.as_bytes(), salt, KDF_ITERATIONS, &mut key);
        key
    }

    fn load_salt(&self) -> Result<Vec<u8>> {
        let encoded = self.store.get(SALT_KEY).ok_or(CredentialError::Missing)?;
        BASE64
            .decode(&encoded)
            .map_err(|e| CredentialError::Corrupted(format!("invalid salt: {e}")))
    }

    fn get_or_create_salt(&self) -> Result<Vec<u8>> {
        if let Some(encoded) = self.store.get(SALT_KEY) {
            return BASE64
                .decode(&encoded)
                .map_err(|e| CredentialError::Corrupted(format!("invalid salt: {e}")));
        }
        let mut salt = vec![0u8; SALT_BYTES];
        rand::rng().fill_bytes(&mut salt);
        self.store.set(SALT_KEY, &BASE64.encode(&salt))?;
        Ok(salt)
    }
}

/// Legacy v1 encoder, kept for the migration tests.
#[cfg(test)]
pub(crate) fn encode_legacy(password: &str, fingerprint: &str) -> String {
    let fp = fingerprint.as_bytes();
    let obfuscated: Vec<u8> = password
        .bytes()
        .enumerate()
        .map(|(i, b)| b ^ fp[i % fp.len()])
        .collect();
    BASE64.encode(&obfuscated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryKvStore;
    use std::sync::Arc;

    const FP_A: &str = "aaaa1111bbbb2222cccc3333dddd4444";
    const FP_B: &str = "eeee5555ffff66660000777788889999";

    fn storage(fp: &str) -> CredentialStorage<Arc<MemoryKvStore>> {
        CredentialStorage::with_fingerprint(Arc::new(MemoryKvStore::new()), fp)
    }

    #[test]
    fn test_store_and_get_roundtrip() {
        let creds = storage(FP_A);

        creds.store_password("hunter2").unwrap();
        assert!(creds.has_password());
        assert_eq!(creds.get_password().unwrap(), "hunter2");
    }

    #[test]
    fn test_get_without_store_is_missing() {
        let creds = storage(FP_A);
        assert!(matches!(creds.get_password(), Err(CredentialError::Missing)));
        assert!(!creds.has_password());
    }

    #[test]
    fn test_different_fingerprint_cannot_decrypt() {
        let store = Arc::new(MemoryKvStore::new());

        let device_a = CredentialStorage::with_fingerprint(Arc::clone(&store), FP_A);
        device_a.store_password("hunter2").unwrap();

        // Same store, different device identity
        let device_b = CredentialStorage::with_fingerprint(store, FP_B);
        assert!(device_b.has_password());
        assert!(matches!(
            device_b.get_password(),
            Err(CredentialError::DeviceMismatch)
        ));
    }

    #[test]
    fn test_fresh_nonce_per_write() {
        let creds = storage(FP_A);

        creds.store_password("same").unwrap();
        let first = creds.store.get(CREDENTIAL_KEY).unwrap();
        creds.store_password("same").unwrap();
        let second = creds.store.get(CREDENTIAL_KEY).unwrap();

        assert_ne!(first, second);
        assert_eq!(creds.get_password().unwrap(), "same");
    }

    #[test]
    fn test_clear_removes_blob() {
        let creds = storage(FP_A);

        creds.store_password("hunter2").unwrap();
        creds.clear_password().unwrap();

        assert!(!creds.has_password());
        assert!(matches!(creds.get_password(), Err(CredentialError::Missing)));
    }

    #[test]
    fn test_corrupted_blob_reports_error() {
        let creds = storage(FP_A);
        creds.store_password("hunter2").unwrap();

        creds
            .store
            .set(CREDENTIAL_KEY, r#"{"v":2,"blob":"AAAA"}"#)
            .unwrap();

        assert!(matches!(
            creds.get_password(),
            Err(CredentialError::Corrupted(_))
        ));
        // Presence is still reported; the unlock flow decides what to do.
        assert!(creds.has_password());
    }

    #[test]
    fn test_unknown_version_rejected() {
        let creds = storage(FP_A);
        creds
            .store
            .set(CREDENTIAL_KEY, r#"{"v":9,"blob":"AAAA"}"#)
            .unwrap();

        assert!(matches!(
            creds.get_password(),
            Err(CredentialError::Corrupted(_))
        ));
    }

    #[test]
    fn test_legacy_blob_migrates_on_read() {
        let creds = storage(FP_A);

        creds
            .store
            .set(CREDENTIAL_KEY, &encode_legacy("legacy-pass", FP_A))
            .unwrap();

        assert_eq!(creds.get_password().unwrap(), "legacy-pass");

        // Entry was rewritten into the JSON wrapper
        let raw = creds.store.get(CREDENTIAL_KEY).unwrap();
        let entry: CredentialBlob = serde_json::from_str(&raw).unwrap();
        assert_eq!(entry.v, 2);

        // And still decrypts through the normal path
        assert_eq!(creds.get_password().unwrap(), "legacy-pass");
    }
}
