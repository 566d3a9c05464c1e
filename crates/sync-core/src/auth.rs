//! Account authentication flows.
//!
//! Login sends a derived proof, never the password: the server can check
//! who you are without ever holding material that could decrypt content.
//! The proof and the content key are domain-separated derivations of the
//! same password, so neither yields the other.

use std::sync::Arc;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::KvStore;
use crate::credentials::CredentialStorage;
use crate::device::DeviceManager;
use crate::remote::{LoginRequest, RegisterRequest, RemoteError, RemoteStore, Session};
use crate::tokens::TokenManager;

const AUTH_PROOF_TAG: &str = "inkstone/auth/v1:";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("An account with this email already exists")]
    AccountExists,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Remote rejected the request: {0}")]
    Rejected(String),

    #[error("Credential storage error: {0}")]
    Credential(#[from] crate::credentials::CredentialError),

    #[error("Device record error: {0}")]
    Device(#[from] crate::device::DeviceError),

    #[error("Token error: {0}")]
    Token(#[from] crate::tokens::TokenError),
}

pub type Result<T> = std::result::Result<T, AuthError>;

/// What the server learns instead of the password.
pub fn auth_proof(password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(AUTH_PROOF_TAG.as_bytes());
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

pub struct AuthService<S: KvStore + Clone, R: RemoteStore + Clone> {
    remote: R,
    tokens: Arc<TokenManager<S, R>>,
    credentials: CredentialStorage<S>,
    devices: DeviceManager<S>,
}

impl<S: KvStore + Clone, R: RemoteStore + Clone> AuthService<S, R> {
    pub fn new(store: S, remote: R, tokens: Arc<TokenManager<S, R>>) -> Self {
        Self {
            remote: remote.clone(),
            tokens,
            credentials: CredentialStorage::new(store.clone()),
            devices: DeviceManager::new(store),
        }
    }

    /// Authenticate and establish a session. With `remember`, the password
    /// is stored device-bound so later unlocks need no typing.
    pub async fn login(&self, email: &str, password: &str, remember: bool) -> Result<Session> {
        let device = self.devices.touch()?;
        let request = LoginRequest {
            email: email.to_string(),
            auth_proof: auth_proof(password),
            device,
        };

        let response = match self.remote.login(&request).await {
            Ok(response) => response,
            Err(RemoteError::Auth(_)) => return Err(AuthError::InvalidCredentials),
            Err(e) if e.is_retryable() => return Err(AuthError::Network(e.to_string())),
            Err(e) => return Err(AuthError::Rejected(e.to_string())),
        };

        self.tokens.set_session(&response.session)?;
        self.devices.merge_remote_devices(&response.devices)?;

        if remember {
            self.credentials.store_password(password)?;
        }

        info!(email, "Logged in");
        Ok(response.session)
    }

    /// Create an account. Does not log in; the caller decides when the
    /// first session starts.
    pub async fn register(&self, email: &str, password: &str) -> Result<()> {
        let request = RegisterRequest {
            email: email.to_string(),
            auth_proof: auth_proof(password),
        };

        match self.remote.register(&request).await {
            Ok(()) => {
                info!(email, "Registered account");
                Ok(())
            }
            Err(RemoteError::Invalid(_)) => Err(AuthError::AccountExists),
            Err(e) if e.is_retryable() => Err(AuthError::Network(e.to_string())),
            Err(e) => Err(AuthError::Rejected(e.to_string())),
        }
    }

    /// End the session. Remote teardown is best-effort; local state is
    /// always cleared.
    pub async fn logout(&self) -> Result<()> {
        if let Some(session) = self.tokens.current_session() {
            if let Err(e) = self.remote.logout(&session.access_token).await {
                warn!("Remote logout failed ({e}); clearing local session anyway");
            }
        }

        self.tokens.clear_session()?;
        self.credentials.clear_password()?;
        info!("Logged out");
        Ok(())
    }

    pub fn credentials(&self) -> &CredentialStorage<S> {
        &self.credentials
    }

    pub fn devices(&self) -> &DeviceManager<S> {
        &self.devices
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryKvStore;
    use crate::remote::MemoryRemoteStore;

    fn service(
        remote: &Arc<MemoryRemoteStore>,
    ) -> AuthService<Arc<MemoryKvStore>, Arc<MemoryRemoteStore>> {
        let store = Arc::new(MemoryKvStore::new());
        let tokens = Arc::new(TokenManager::new(Arc::clone(&store), Arc::clone(remote)));
        AuthService::new(store, Arc::clone(remote), tokens)
    }

    #[test]
    fn test_auth_proof_shape() {
        let proof = auth_proof("hunter2");
        assert_eq!(proof.len(), 64);
        assert_eq!(proof, auth_proof("hunter2"));
        assert_ne!(proof, auth_proof("hunter3"));
        // Domain tag means this is not a bare hash of the password
        assert_ne!(proof, hex::encode(Sha256::digest(b"hunter2")));
    }

    #[tokio::test]
    async fn test_register_then_login() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let auth = service(&remote);

        auth.register("a@b.c", "hunter2").await.unwrap();
        // Registration does not create a session
        assert!(!auth.tokens.has_session());

        let session = auth.login("a@b.c", "hunter2", false).await.unwrap();
        assert!(!session.access_token.is_empty());
        assert!(auth.tokens.has_session());
        // Without remember, nothing lands in credential storage
        assert!(!auth.credentials.has_password());
    }

    #[tokio::test]
    async fn test_login_remember_stores_credential() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let auth = service(&remote);

        auth.register("a@b.c", "hunter2").await.unwrap();
        auth.login("a@b.c", "hunter2", true).await.unwrap();

        assert_eq!(auth.credentials.get_password().unwrap(), "hunter2");
    }

    #[tokio::test]
    async fn test_wrong_password_rejected() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let auth = service(&remote);

        auth.register("a@b.c", "hunter2").await.unwrap();
        assert!(matches!(
            auth.login("a@b.c", "wrong", false).await,
            Err(AuthError::InvalidCredentials)
        ));
        assert!(!auth.tokens.has_session());
    }

    #[tokio::test]
    async fn test_duplicate_registration() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let auth = service(&remote);

        auth.register("a@b.c", "hunter2").await.unwrap();
        assert!(matches!(
            auth.register("a@b.c", "other").await,
            Err(AuthError::AccountExists)
        ));
    }

    #[tokio::test]
    async fn test_offline_login_is_network_error() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let auth = service(&remote);
        remote.set_offline(true);

        assert!(matches!(
            auth.login("a@b.c", "hunter2", false).await,
            Err(AuthError::Network(_))
        ));
    }

    #[tokio::test]
    async fn test_login_merges_peer_devices() {
        let remote = Arc::new(MemoryRemoteStore::new());

        let first = service(&remote);
        first.register("a@b.c", "hunter2").await.unwrap();
        first.login("a@b.c", "hunter2", false).await.unwrap();

        // A second installation logs into the same account
        let second = service(&remote);
        second.login("a@b.c", "hunter2", false).await.unwrap();

        let peers = second.devices.list_known_devices().unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(
            peers[0].id,
            first.devices.current_device().unwrap().id
        );
    }

    #[tokio::test]
    async fn test_logout_clears_local_state() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let auth = service(&remote);

        auth.register("a@b.c", "hunter2").await.unwrap();
        auth.login("a@b.c", "hunter2", true).await.unwrap();

        auth.logout().await.unwrap();
        assert!(!auth.tokens.has_session());
        assert!(!auth.credentials.has_password());
    }

    #[tokio::test]
    async fn test_logout_survives_offline_remote() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let auth = service(&remote);

        auth.register("a@b.c", "hunter2").await.unwrap();
        auth.login("a@b.c", "hunter2", true).await.unwrap();

        remote.set_offline(true);
        auth.logout().await.unwrap();
        assert!(!auth.tokens.has_session());
        assert!(!auth.credentials.has_password());
    }
}
