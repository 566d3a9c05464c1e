//! Remote store protocol.
//!
//! Everything the engine knows about the server lives behind the
//! [`RemoteStore`] trait: auth endpoints, the cursor-paged change feed, and
//! the encrypted object store. The server never sees plaintext or keys;
//! object bodies are opaque envelopes and paths are the only metadata.
//!
//! Two implementations ship here: `HttpRemoteStore` (reqwest, bearer auth)
//! and `MemoryRemoteStore`, the test fake the whole workspace leans on.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::device::Device;

/// Header carrying the writing device's id on object mutations.
pub const ORIGIN_DEVICE_HEADER: &str = "x-inkstone-device";

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Authentication rejected: {0}")]
    Auth(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    Invalid(String),

    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("Network error: {0}")]
    Transport(String),
}

impl RemoteError {
    /// Transport failures and 5xx responses are worth retrying.
    /// Everything else is a definitive answer from the server.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RemoteError::Server { .. } | RemoteError::Transport(_)
        )
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(e: reqwest::Error) -> Self {
        RemoteError::Transport(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RemoteError>;

// ==================== wire types ====================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    pub access_expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub email: String,
    /// `hex(sha256(domain_tag + password))`; never the password itself.
    pub auth_proof: String,
    /// Login doubles as idempotent device registration.
    pub device: Device,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub email: String,
    pub auth_proof: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub session: Session,
    /// All devices on the account, this one included.
    pub devices: Vec<Device>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteChange {
    pub key: String,
    pub version: u64,
    pub deleted: bool,
    pub origin_device: String,
    pub modified_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePage {
    pub changes: Vec<RemoteChange>,
    /// Opaque resume token. Replaying an older cursor is always safe.
    pub cursor: String,
    pub has_more: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionResponse {
    pub version: u64,
}

// ==================== trait ====================

#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn login(&self, request: &LoginRequest) -> Result<LoginResponse>;
    async fn register(&self, request: &RegisterRequest) -> Result<()>;
    async fn refresh(&self, refresh_token: &str) -> Result<Session>;
    /// Best-effort session teardown.
    async fn logout(&self, access_token: &str) -> Result<()>;

    /// Changes since `cursor` (everything when `None`), oldest first.
    async fn list_changes(&self, access_token: &str, cursor: Option<&str>) -> Result<ChangePage>;
    async fn get_object(&self, access_token: &str, key: &str) -> Result<Vec<u8>>;
    /// Returns the object's new version marker.
    async fn put_object(
        &self,
        access_token: &str,
        key: &str,
        ciphertext: &[u8],
        origin_device: &str,
    ) -> Result<u64>;
    /// Tombstones the object; returns the tombstone's version marker.
    async fn delete_object(&self, access_token: &str, key: &str, origin_device: &str)
    -> Result<u64>;
}

#[async_trait]
impl<T: RemoteStore + ?Sized> RemoteStore for std::sync::Arc<T> {
    async fn login(&self, request: &LoginRequest) -> Result<LoginResponse> {
        (**self).login(request).await
    }
    async fn register(&self, request: &RegisterRequest) -> Result<()> {
        (**self).register(request).await
    }
    async fn refresh(&self, refresh_token: &str) -> Result<Session> {
        (**self).refresh(refresh_token).await
    }
    async fn logout(&self, access_token: &str) -> Result<()> {
        (**self).logout(access_token).await
    }
    async fn list_changes(&self, access_token: &str, cursor: Option<&str>) -> Result<ChangePage> {
        (**self).list_changes(access_token, cursor).await
    }
    async fn get_object(&self, access_token: &str, key: &str) -> Result<Vec<u8>> {
        (**self).get_object(access_token, key).await
    }
    async fn put_object(
        &self,
        access_token: &str,
        key: &str,
        ciphertext: &[u8],
        origin_device: &str,
    ) -> Result<u64> {
        (**self)
            .put_object(access_token, key, ciphertext, origin_device)
            .await
    }
    async fn delete_object(
        &self,
        access_token: &str,
        key: &str,
        origin_device: &str,
    ) -> Result<u64> {
        (**self).delete_object(access_token, key, origin_device).await
    }
}

// ==================== HTTP client ====================

pub struct HttpRemoteStore {
    base_url: String,
    client: reqwest::Client,
}

impl HttpRemoteStore {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Object URL with the key spliced in as path segments. Going through
    /// `Url` percent-encodes characters like `?` and `#` that would
    /// otherwise change the meaning of the request line.
    fn object_url(&self, key: &str) -> Result<reqwest::Url> {
        let mut url = reqwest::Url::parse(&self.base_url)
            .map_err(|e| RemoteError::Invalid(format!("invalid server url: {e}")))?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|()| RemoteError::Invalid("server url cannot carry a path".into()))?;
            segments.pop_if_empty();
            segments.extend(["api", "sync", "objects"]);
            segments.extend(key.split('/'));
        }
        Ok(url)
    }

    /// Map a non-success status to the typed error taxonomy.
    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let code = status.as_u16();
        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown error".to_string());
        Err(match code {
            401 | 403 => RemoteError::Auth(message),
            404 => RemoteError::NotFound(message),
            400 | 409 | 422 => RemoteError::Invalid(message),
            _ => RemoteError::Server {
                status: code,
                message,
            },
        })
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn login(&self, request: &LoginRequest) -> Result<LoginResponse> {
        let response = self
            .client
            .post(self.url("/api/auth/login"))
            .json(request)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn register(&self, request: &RegisterRequest) -> Result<()> {
        let response = self
            .client
            .post(self.url("/api/auth/register"))
            .json(request)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn refresh(&self, refresh_token: &str) -> Result<Session> {
        let response = self
            .client
            .post(self.url("/api/auth/refresh"))
            .json(&serde_json::json!({ "refreshToken": refresh_token }))
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn logout(&self, access_token: &str) -> Result<()> {
        let response = self
            .client
            .post(self.url("/api/auth/logout"))
            .bearer_auth(access_token)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn list_changes(&self, access_token: &str, cursor: Option<&str>) -> Result<ChangePage> {
        let mut request = self
            .client
            .get(self.url("/api/sync/changes"))
            .bearer_auth(access_token);
        if let Some(cursor) = cursor {
            request = request.query(&[("cursor", cursor)]);
        }
        let response = request.send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn get_object(&self, access_token: &str, key: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(self.object_url(key)?)
            .bearer_auth(access_token)
            .send()
            .await?;
        Ok(Self::check(response).await?.bytes().await?.to_vec())
    }

    async fn put_object(
        &self,
        access_token: &str,
        key: &str,
        ciphertext: &[u8],
        origin_device: &str,
    ) -> Result<u64> {
        let response = self
            .client
            .put(self.object_url(key)?)
            .bearer_auth(access_token)
            .header(ORIGIN_DEVICE_HEADER, origin_device)
            .body(ciphertext.to_vec())
            .send()
            .await?;
        let parsed: VersionResponse = Self::check(response).await?.json().await?;
        debug!(key, version = parsed.version, "Uploaded object");
        Ok(parsed.version)
    }

    async fn delete_object(
        &self,
        access_token: &str,
        key: &str,
        origin_device: &str,
    ) -> Result<u64> {
        let response = self
            .client
            .delete(self.object_url(key)?)
            .bearer_auth(access_token)
            .header(ORIGIN_DEVICE_HEADER, origin_device)
            .send()
            .await?;
        let parsed: VersionResponse = Self::check(response).await?.json().await?;
        Ok(parsed.version)
    }
}

// ==================== in-memory fake ====================

struct StoredObject {
    version: u64,
    data: Vec<u8>,
    deleted: bool,
}

#[derive(Default)]
struct RemoteState {
    accounts: HashMap<String, String>,
    access_tokens: HashMap<String, DateTime<Utc>>,
    refresh_tokens: HashSet<String>,
    devices: Vec<Device>,
    objects: HashMap<String, StoredObject>,
    log: Vec<RemoteChange>,
    seq: u64,
}

/// Fake remote used by unit and integration tests. Single account space,
/// injectable failures, and counters for the properties the engine must
/// hold (one refresh per stampede, per-key failure isolation).
pub struct MemoryRemoteStore {
    state: Mutex<RemoteState>,
    offline: AtomicBool,
    reject_refresh: AtomicBool,
    refresh_calls: AtomicUsize,
    failing_keys: Mutex<HashSet<String>>,
    page_size: AtomicUsize,
    access_ttl_secs: AtomicI64,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RemoteState::default()),
            offline: AtomicBool::new(false),
            reject_refresh: AtomicBool::new(false),
            refresh_calls: AtomicUsize::new(0),
            failing_keys: Mutex::new(HashSet::new()),
            page_size: AtomicUsize::new(100),
            access_ttl_secs: AtomicI64::new(3600),
        }
    }

    /// Every subsequent call fails with a transport error until cleared.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Make refresh return a definitive auth rejection.
    pub fn set_reject_refresh(&self, reject: bool) {
        self.reject_refresh.store(reject, Ordering::SeqCst);
    }

    pub fn refresh_call_count(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    /// Uploads and deletes of `key` fail with a 500 until cleared.
    pub fn fail_writes_for(&self, key: &str) {
        self.failing_keys.lock().unwrap().insert(key.to_string());
    }

    pub fn clear_write_failures(&self) {
        self.failing_keys.lock().unwrap().clear();
    }

    pub fn set_page_size(&self, size: usize) {
        self.page_size.store(size.max(1), Ordering::SeqCst);
    }

    /// Lifetime of newly issued access tokens.
    pub fn set_access_ttl_secs(&self, secs: i64) {
        self.access_ttl_secs.store(secs, Ordering::SeqCst);
    }

    /// Invalidate every outstanding access token, forcing 401s.
    pub fn expire_access_tokens(&self) {
        self.state.lock().unwrap().access_tokens.clear();
    }

    pub fn object_count(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.objects.values().filter(|o| !o.deleted).count()
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(RemoteError::Transport("connection refused".into()));
        }
        Ok(())
    }

    fn issue_session(&self, state: &mut RemoteState) -> Session {
        let ttl = self.access_ttl_secs.load(Ordering::SeqCst);
        let session = Session {
            access_token: Uuid::new_v4().to_string(),
            refresh_token: Uuid::new_v4().to_string(),
            access_expires_at: Utc::now() + chrono::Duration::seconds(ttl),
        };
        state
            .access_tokens
            .insert(session.access_token.clone(), session.access_expires_at);
        state.refresh_tokens.insert(session.refresh_token.clone());
        session
    }

    fn check_access(state: &RemoteState, token: &str) -> Result<()> {
        match state.access_tokens.get(token) {
            Some(expires) if *expires > Utc::now() => Ok(()),
            Some(_) => Err(RemoteError::Auth("access token expired".into())),
            None => Err(RemoteError::Auth("invalid access token".into())),
        }
    }
}

impl Default for MemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn login(&self, request: &LoginRequest) -> Result<LoginResponse> {
        self.check_online()?;
        let mut state = self.state.lock().unwrap();

        match state.accounts.get(&request.email) {
            Some(proof) if *proof == request.auth_proof => {}
            Some(_) => return Err(RemoteError::Auth("wrong credentials".into())),
            None => return Err(RemoteError::Auth("no such account".into())),
        }

        match state.devices.iter_mut().find(|d| d.id == request.device.id) {
            Some(existing) => *existing = request.device.clone(),
            None => state.devices.push(request.device.clone()),
        }

        let session = self.issue_session(&mut state);
        Ok(LoginResponse {
            session,
            devices: state.devices.clone(),
        })
    }

    async fn register(&self, request: &RegisterRequest) -> Result<()> {
        self.check_online()?;
        let mut state = self.state.lock().unwrap();
        if state.accounts.contains_key(&request.email) {
            return Err(RemoteError::Invalid("account already exists".into()));
        }
        state
            .accounts
            .insert(request.email.clone(), request.auth_proof.clone());
        Ok(())
    }

    async fn refresh(&self, refresh_token: &str) -> Result<Session> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        if self.reject_refresh.load(Ordering::SeqCst) {
            return Err(RemoteError::Auth("refresh token revoked".into()));
        }

        let mut state = self.state.lock().unwrap();
        if !state.refresh_tokens.remove(refresh_token) {
            return Err(RemoteError::Auth("unknown refresh token".into()));
        }
        Ok(self.issue_session(&mut state))
    }

    async fn logout(&self, access_token: &str) -> Result<()> {
        self.check_online()?;
        let mut state = self.state.lock().unwrap();
        state.access_tokens.remove(access_token);
        Ok(())
    }

    async fn list_changes(&self, access_token: &str, cursor: Option<&str>) -> Result<ChangePage> {
        self.check_online()?;
        let state = self.state.lock().unwrap();
        Self::check_access(&state, access_token)?;

        let start = match cursor {
            None => 0,
            Some(c) => c
                .parse::<usize>()
                .map_err(|_| RemoteError::Invalid(format!("bad cursor: {c}")))?,
        };
        let start = start.min(state.log.len());
        let end = (start + self.page_size.load(Ordering::SeqCst)).min(state.log.len());

        Ok(ChangePage {
            changes: state.log[start..end].to_vec(),
            cursor: end.to_string(),
            has_more: end < state.log.len(),
        })
    }

    async fn get_object(&self, access_token: &str, key: &str) -> Result<Vec<u8>> {
        self.check_online()?;
        let state = self.state.lock().unwrap();
        Self::check_access(&state, access_token)?;

        match state.objects.get(key) {
            Some(object) if !object.deleted => Ok(object.data.clone()),
            _ => Err(RemoteError::NotFound(key.to_string())),
        }
    }

    async fn put_object(
        &self,
        access_token: &str,
        key: &str,
        ciphertext: &[u8],
        origin_device: &str,
    ) -> Result<u64> {
        self.check_online()?;
        if self.failing_keys.lock().unwrap().contains(key) {
            return Err(RemoteError::Server {
                status: 500,
                message: format!("injected failure for {key}"),
            });
        }

        let mut state = self.state.lock().unwrap();
        Self::check_access(&state, access_token)?;

        state.seq += 1;
        let version = state.seq;
        state.objects.insert(
            key.to_string(),
            StoredObject {
                version,
                data: ciphertext.to_vec(),
                deleted: false,
            },
        );
        state.log.push(RemoteChange {
            key: key.to_string(),
            version,
            deleted: false,
            origin_device: origin_device.to_string(),
            modified_at: Utc::now(),
        });
        Ok(version)
    }

    async fn delete_object(
        &self,
        access_token: &str,
        key: &str,
        origin_device: &str,
    ) -> Result<u64> {
        self.check_online()?;
        if self.failing_keys.lock().unwrap().contains(key) {
            return Err(RemoteError::Server {
                status: 500,
                message: format!("injected failure for {key}"),
            });
        }

        let mut state = self.state.lock().unwrap();
        Self::check_access(&state, access_token)?;

        state.seq += 1;
        let version = state.seq;
        state.objects.insert(
            key.to_string(),
            StoredObject {
                version,
                data: Vec::new(),
                deleted: true,
            },
        );
        state.log.push(RemoteChange {
            key: key.to_string(),
            version,
            deleted: true,
            origin_device: origin_device.to_string(),
            modified_at: Utc::now(),
        });
        Ok(version)
    }
}
