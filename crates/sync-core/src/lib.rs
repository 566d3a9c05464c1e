//! sync-core: Shared Rust library for end-to-end encrypted workspace sync.
//!
//! This crate provides the core functionality for:
//! - Encrypting note content before it leaves the device
//! - Account sessions, token refresh, and device identity
//! - The per-workspace sync index and change cursor
//! - Conflict detection and resolution between devices
//! - WorkspaceFs, KvStore, and RemoteStore trait abstractions

pub mod auth;
pub mod config;
pub mod conflict;
pub mod credentials;
pub mod database;
pub mod device;
pub mod encryption;
pub mod events;
pub mod fingerprint;
pub mod fs;
pub mod manager;
pub mod paths;
pub mod remote;
pub mod tokens;

pub use auth::{AuthError, AuthService};
pub use config::{JsonFileStore, KvStore, MemoryKvStore, SyncSettings};
pub use conflict::{SyncDecision, conflict_copy_path};
pub use credentials::{CredentialError, CredentialStorage};
pub use database::{ConflictRecord, FileRecord, LocalDatabase, ResolutionStrategy, content_hash};
pub use device::{Device, DeviceManager};
pub use encryption::{
    EncryptionError, EncryptionManager, derive_workspace_key, derive_workspace_salt,
};
pub use events::{EventBus, Subscription, SyncEvent, SyncState};
pub use fingerprint::device_fingerprint;
pub use fs::{DirEntry, FileStat, MemoryFs, StorageError, WorkspaceFs};
pub use manager::{CancelToken, CycleReport, SyncError, SyncManager, SyncOutcome};
pub use paths::{PathError, PathManager, validate_sync_path};
pub use remote::{
    ChangePage, HttpRemoteStore, MemoryRemoteStore, RemoteChange, RemoteError, RemoteStore,
    Session,
};
pub use tokens::{TokenError, TokenManager};
