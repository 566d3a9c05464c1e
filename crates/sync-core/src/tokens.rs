//! Session token lifecycle.
//!
//! Holds the access/refresh pair and keeps the access token usable:
//! callers ask for a token and get one that is valid for at least the
//! grace window, refreshed behind a single-flight lock when it is not.
//! The pair is persisted as one document so the two tokens can never be
//! written half-rotated.

use chrono::{Duration, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::KvStore;
use crate::remote::{RemoteStore, Session};

const SESSION_KEY: &str = "sync.session";

/// Tokens expiring within this window are refreshed before use, so a
/// token handed out is never already dead by the time a request carries it.
const REFRESH_GRACE_SECS: i64 = 60;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("Not logged in")]
    NoSession,

    #[error("Session refresh rejected; log in again")]
    RefreshRejected,

    #[error("Network error during refresh: {0}")]
    Network(String),

    #[error("Config store error: {0}")]
    Store(#[from] crate::config::ConfigError),
}

pub type Result<T> = std::result::Result<T, TokenError>;

pub struct TokenManager<S: KvStore, R: RemoteStore> {
    store: S,
    remote: R,
    /// Serializes refreshers. Waiters re-check the persisted session after
    /// acquiring, so a stampede produces exactly one network call.
    refresh_lock: Mutex<()>,
}

impl<S: KvStore, R: RemoteStore> TokenManager<S, R> {
    pub fn new(store: S, remote: R) -> Self {
        Self {
            store,
            remote,
            refresh_lock: Mutex::new(()),
        }
    }

    /// An access token guaranteed fresh for at least the grace window.
    pub async fn valid_access_token(&self) -> Result<String> {
        let session = self.current_session().ok_or(TokenError::NoSession)?;
        if Self::is_fresh(&session) {
            return Ok(session.access_token);
        }

        let _guard = self.refresh_lock.lock().await;

        // Another caller may have refreshed while we waited.
        let session = self.current_session().ok_or(TokenError::NoSession)?;
        if Self::is_fresh(&session) {
            debug!("Reusing token refreshed by a concurrent caller");
            return Ok(session.access_token);
        }

        debug!("Access token stale; refreshing");
        match self.remote.refresh(&session.refresh_token).await {
            Ok(fresh) => {
                let token = fresh.access_token.clone();
                self.set_session(&fresh)?;
                info!("Session refreshed");
                Ok(token)
            }
            Err(e) if e.is_retryable() => Err(TokenError::Network(e.to_string())),
            Err(e) => {
                // Definitive rejection: the pair is dead, keeping it would
                // just replay the same failure forever.
                warn!("Session refresh rejected: {e}");
                self.clear_session()?;
                Err(TokenError::RefreshRejected)
            }
        }
    }

    pub fn set_session(&self, session: &Session) -> Result<()> {
        let json = serde_json::to_string(session)
            .map_err(|e| TokenError::Network(format!("serialize session: {e}")))?;
        self.store.set(SESSION_KEY, &json)?;
        Ok(())
    }

    pub fn clear_session(&self) -> Result<()> {
        self.store.remove(SESSION_KEY)?;
        Ok(())
    }

    /// The persisted session, if any. An unreadable record counts as
    /// logged out; the fix for a mangled session is a fresh login.
    pub fn current_session(&self) -> Option<Session> {
        let raw = self.store.get(SESSION_KEY)?;
        match serde_json::from_str(&raw) {
            Ok(session) => Some(session),
            Err(e) => {
                warn!("Stored session unreadable ({e}); treating as logged out");
                None
            }
        }
    }

    pub fn has_session(&self) -> bool {
        self.current_session().is_some()
    }

    fn is_fresh(session: &Session) -> bool {
        session.access_expires_at - Utc::now() > Duration::seconds(REFRESH_GRACE_SECS)
    }
}
