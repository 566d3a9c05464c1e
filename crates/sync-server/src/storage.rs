//! Persistent storage for accounts, sessions, devices, and encrypted objects
//!
//! The server never sees plaintext: object bodies arrive as opaque ciphertext
//! and are stored base64-encoded alongside a sequence-numbered change log.
//! Credentials are stored as digests, never as the raw auth proof.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use anyhow::{Context, Result};
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Storage for all server-side sync data
pub struct Storage {
    data_path: PathBuf,
    /// Registered accounts
    accounts: RwLock<AccountStore>,
    /// Active refresh tokens (persisted so sessions survive restarts)
    sessions: RwLock<SessionStore>,
    /// Active access tokens (short-lived, in-memory only)
    access: RwLock<HashMap<String, AccessGrant>>,
    /// Per-account devices, objects, and change log
    spaces: RwLock<SpaceStore>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct AccountStore {
    /// Maps email -> account data
    accounts: HashMap<String, StoredAccount>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct SessionStore {
    /// Maps refresh token hash -> session data
    refresh_tokens: HashMap<String, StoredRefreshToken>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct SpaceStore {
    /// Maps email -> that account's synced space
    spaces: HashMap<String, AccountSpace>,
}

/// A registered account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredAccount {
    pub email: String,
    /// `hash_token` of the client's auth proof; the proof itself is never kept
    pub proof_hash: String,
    pub created_at: DateTime<Utc>,
}

/// A stored refresh token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRefreshToken {
    pub token_hash: String,
    pub email: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// An active access token grant (never persisted)
#[derive(Debug, Clone)]
struct AccessGrant {
    email: String,
    expires_at: DateTime<Utc>,
}

/// Everything one account has synced
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct AccountSpace {
    /// Monotonic change counter; doubles as the object version
    seq: u64,
    devices: Vec<Device>,
    objects: HashMap<String, StoredObject>,
    log: Vec<ChangeRecord>,
}

/// An encrypted object as stored on disk
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredObject {
    version: u64,
    deleted: bool,
    /// Base64 ciphertext; empty for tombstones
    data: String,
}

/// A device registered on an account, as sent by the client at login
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: String,
    pub display_name: String,
    pub public_fingerprint: String,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// One entry in an account's change feed
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    pub key: String,
    pub version: u64,
    pub deleted: bool,
    pub origin_device: String,
    pub modified_at: DateTime<Utc>,
}

/// A freshly issued session; raw tokens go to the client, only hashes stay here
#[derive(Debug, Clone)]
pub struct IssuedSession {
    pub access_token: String,
    pub refresh_token: String,
    pub access_expires_at: DateTime<Utc>,
}

/// Outcome of a credential check at login
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialCheck {
    Valid,
    WrongProof,
    UnknownAccount,
}

/// A page of an account's change feed
#[derive(Debug, Clone)]
pub struct ChangeBatch {
    pub changes: Vec<ChangeRecord>,
    pub cursor: String,
    pub has_more: bool,
}

impl Storage {
    /// Create a new storage instance
    pub fn new(data_path: &str) -> Result<Self> {
        let data_path = PathBuf::from(data_path);
        std::fs::create_dir_all(&data_path)
            .with_context(|| format!("Failed to create data directory: {:?}", data_path))?;

        let storage = Self {
            data_path,
            accounts: RwLock::new(AccountStore::default()),
            sessions: RwLock::new(SessionStore::default()),
            access: RwLock::new(HashMap::new()),
            spaces: RwLock::new(SpaceStore::default()),
        };

        // Load persisted data; access tokens are short-lived and start empty
        storage.load_accounts()?;
        storage.load_sessions()?;
        storage.load_spaces()?;

        Ok(storage)
    }

    // --- Account Management ---

    /// Register a new account. Returns false if the email is already taken.
    pub fn create_account(&self, email: &str, auth_proof: &str) -> Result<bool> {
        {
            let mut store = self.accounts.write().unwrap();
            if store.accounts.contains_key(email) {
                return Ok(false);
            }
            store.accounts.insert(
                email.to_string(),
                StoredAccount {
                    email: email.to_string(),
                    proof_hash: hash_token(auth_proof),
                    created_at: Utc::now(),
                },
            );
        }
        self.save_accounts()?;
        Ok(true)
    }

    /// Check a login attempt against the stored credential digest
    pub fn check_credentials(&self, email: &str, auth_proof: &str) -> CredentialCheck {
        let store = self.accounts.read().unwrap();
        match store.accounts.get(email) {
            Some(account) if account.proof_hash == hash_token(auth_proof) => {
                CredentialCheck::Valid
            }
            Some(_) => CredentialCheck::WrongProof,
            None => CredentialCheck::UnknownAccount,
        }
    }

    // --- Session Management ---

    /// Issue a fresh access/refresh token pair for an account
    pub fn issue_session(
        &self,
        email: &str,
        access_ttl_secs: u64,
        refresh_ttl_secs: u64,
    ) -> Result<IssuedSession> {
        let access_token = generate_random_string(48);
        let refresh_token = generate_random_string(48);
        let now = Utc::now();
        let access_expires_at = now + Duration::seconds(access_ttl_secs as i64);

        {
            let mut grants = self.access.write().unwrap();
            grants.insert(
                hash_token(&access_token),
                AccessGrant {
                    email: email.to_string(),
                    expires_at: access_expires_at,
                },
            );
        }
        {
            let mut store = self.sessions.write().unwrap();
            let token_hash = hash_token(&refresh_token);
            store.refresh_tokens.insert(
                token_hash.clone(),
                StoredRefreshToken {
                    token_hash,
                    email: email.to_string(),
                    expires_at: now + Duration::seconds(refresh_ttl_secs as i64),
                    created_at: now,
                },
            );
        }
        self.save_sessions()?;

        Ok(IssuedSession {
            access_token,
            refresh_token,
            access_expires_at,
        })
    }

    /// Consume a refresh token (single use). Returns the account it belonged
    /// to, or None if the token is unknown or expired.
    pub fn consume_refresh_token(&self, refresh_token: &str) -> Result<Option<String>> {
        let consumed = {
            let mut store = self.sessions.write().unwrap();
            store.refresh_tokens.remove(&hash_token(refresh_token))
        };
        let Some(stored) = consumed else {
            return Ok(None);
        };
        self.save_sessions()?;
        if stored.expires_at <= Utc::now() {
            return Ok(None);
        }
        Ok(Some(stored.email))
    }

    /// Resolve an access token to its account, if still valid
    pub fn account_for_token(&self, access_token: &str) -> Option<String> {
        let grants = self.access.read().unwrap();
        grants.get(&hash_token(access_token)).and_then(|grant| {
            if grant.expires_at > Utc::now() {
                Some(grant.email.clone())
            } else {
                None
            }
        })
    }

    /// Drop an access token. The refresh token stays valid until it expires
    /// or the client discards it.
    pub fn revoke_access_token(&self, access_token: &str) -> bool {
        let mut grants = self.access.write().unwrap();
        grants.remove(&hash_token(access_token)).is_some()
    }

    // --- Device Management ---

    /// Merge a device record into an account (insert or replace by id).
    /// Returns the full device list.
    pub fn upsert_device(&self, email: &str, device: Device) -> Result<Vec<Device>> {
        let devices = {
            let mut store = self.spaces.write().unwrap();
            let space = store.spaces.entry(email.to_string()).or_default();
            match space.devices.iter_mut().find(|d| d.id == device.id) {
                Some(existing) => *existing = device,
                None => space.devices.push(device),
            }
            space.devices.clone()
        };
        self.save_spaces()?;
        Ok(devices)
    }

    // --- Object Management ---

    /// Store an encrypted object and append it to the change feed
    pub fn put_object(
        &self,
        email: &str,
        key: &str,
        ciphertext: &[u8],
        origin_device: &str,
    ) -> Result<u64> {
        let version = {
            let mut store = self.spaces.write().unwrap();
            let space = store.spaces.entry(email.to_string()).or_default();
            space.seq += 1;
            let version = space.seq;
            space.objects.insert(
                key.to_string(),
                StoredObject {
                    version,
                    deleted: false,
                    data: base64::engine::general_purpose::STANDARD.encode(ciphertext),
                },
            );
            space.log.push(ChangeRecord {
                key: key.to_string(),
                version,
                deleted: false,
                origin_device: origin_device.to_string(),
                modified_at: Utc::now(),
            });
            version
        };
        self.save_spaces()?;
        Ok(version)
    }

    /// Tombstone an object and append the deletion to the change feed
    pub fn delete_object(&self, email: &str, key: &str, origin_device: &str) -> Result<u64> {
        let version = {
            let mut store = self.spaces.write().unwrap();
            let space = store.spaces.entry(email.to_string()).or_default();
            space.seq += 1;
            let version = space.seq;
            space.objects.insert(
                key.to_string(),
                StoredObject {
                    version,
                    deleted: true,
                    data: String::new(),
                },
            );
            space.log.push(ChangeRecord {
                key: key.to_string(),
                version,
                deleted: true,
                origin_device: origin_device.to_string(),
                modified_at: Utc::now(),
            });
            version
        };
        self.save_spaces()?;
        Ok(version)
    }

    /// Fetch an object's ciphertext. None for missing or tombstoned keys.
    pub fn get_object(&self, email: &str, key: &str) -> Option<Vec<u8>> {
        let store = self.spaces.read().unwrap();
        let object = store.spaces.get(email)?.objects.get(key)?;
        if object.deleted {
            return None;
        }
        match base64::engine::general_purpose::STANDARD.decode(&object.data) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                tracing::warn!("Stored object {} is corrupt: {}", key, e);
                None
            }
        }
    }

    /// A page of the account's change feed starting at `start`
    pub fn changes(&self, email: &str, start: usize, page_size: usize) -> ChangeBatch {
        let store = self.spaces.read().unwrap();
        let log: &[ChangeRecord] = store
            .spaces
            .get(email)
            .map(|space| space.log.as_slice())
            .unwrap_or(&[]);

        let start = start.min(log.len());
        let end = (start + page_size).min(log.len());

        ChangeBatch {
            changes: log[start..end].to_vec(),
            cursor: end.to_string(),
            has_more: end < log.len(),
        }
    }

    // --- Persistence ---

    fn accounts_path(&self) -> PathBuf {
        self.data_path.join("accounts.json")
    }

    fn sessions_path(&self) -> PathBuf {
        self.data_path.join("sessions.json")
    }

    fn spaces_path(&self) -> PathBuf {
        self.data_path.join("spaces.json")
    }

    fn load_accounts(&self) -> Result<()> {
        let path = self.accounts_path();
        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let store: AccountStore = serde_json::from_str(&content)?;
            *self.accounts.write().unwrap() = store;
            tracing::info!(
                "Loaded {} accounts",
                self.accounts.read().unwrap().accounts.len()
            );
        }
        Ok(())
    }

    fn save_accounts(&self) -> Result<()> {
        let store = self.accounts.read().unwrap();
        let content = serde_json::to_string_pretty(&*store)?;
        std::fs::write(self.accounts_path(), content)?;
        Ok(())
    }

    fn load_sessions(&self) -> Result<()> {
        let path = self.sessions_path();
        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let mut store: SessionStore = serde_json::from_str(&content)?;

            // Clean up expired refresh tokens on load
            let now = Utc::now();
            store.refresh_tokens.retain(|_, t| t.expires_at > now);

            *self.sessions.write().unwrap() = store;
            tracing::info!(
                "Loaded {} active refresh tokens",
                self.sessions.read().unwrap().refresh_tokens.len()
            );
        }
        Ok(())
    }

    fn save_sessions(&self) -> Result<()> {
        let store = self.sessions.read().unwrap();
        let content = serde_json::to_string_pretty(&*store)?;
        std::fs::write(self.sessions_path(), content)?;
        Ok(())
    }

    fn load_spaces(&self) -> Result<()> {
        let path = self.spaces_path();
        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let store: SpaceStore = serde_json::from_str(&content)?;
            *self.spaces.write().unwrap() = store;
            let store = self.spaces.read().unwrap();
            let objects: usize = store.spaces.values().map(|s| s.objects.len()).sum();
            tracing::info!(
                "Loaded {} synced spaces holding {} objects",
                store.spaces.len(),
                objects
            );
        }
        Ok(())
    }

    fn save_spaces(&self) -> Result<()> {
        let store = self.spaces.read().unwrap();
        let content = serde_json::to_string_pretty(&*store)?;
        std::fs::write(self.spaces_path(), content)?;
        Ok(())
    }

    /// Clean up expired refresh tokens and access grants
    pub fn cleanup_expired(&self) -> Result<()> {
        let now = Utc::now();

        {
            let mut store = self.sessions.write().unwrap();
            let before = store.refresh_tokens.len();
            store.refresh_tokens.retain(|_, t| t.expires_at > now);
            let after = store.refresh_tokens.len();
            if before != after {
                tracing::info!("Cleaned up {} expired refresh tokens", before - after);
            }
        }
        self.save_sessions()?;

        {
            let mut grants = self.access.write().unwrap();
            grants.retain(|_, g| g.expires_at > now);
        }

        Ok(())
    }
}

// --- Utility Functions ---

/// Generate a cryptographically secure random string
pub fn generate_random_string(len: usize) -> String {
    use rand::Rng;
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    (0..len)
        .map(|_| {
            let idx = rng.random_range(0..CHARSET.len());
            CHARSET[idx] as char
        })
        .collect()
}

/// Hash a token/proof for storage (we don't store raw secrets)
pub fn hash_token(token: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    let result = hasher.finalize();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(result)
}
