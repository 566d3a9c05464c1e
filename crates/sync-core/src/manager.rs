//! Sync orchestration.
//!
//! `SyncManager` is the piece the host talks to. It owns the lifecycle
//! state machine, serializes cycles, and glues the other modules
//! together. A cycle runs in a fixed order:
//!
//! 1. Check settings, session, and the content key
//! 2. Acquire a valid access token
//! 3. Snapshot the local dirty set
//! 4. Page remote changes from the saved cursor, deciding and applying
//!    per path; the cursor advances only after a page's records are
//!    durably saved
//! 5. Push whatever local work the feed did not already cover
//!
//! A cycle never aborts wholesale for one bad item: network failures
//! mark the item retryable, undecryptable payloads are skipped with a
//! warning, and only auth or credential failures change the engine
//! state.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, KvStore, SyncSettings};
use crate::conflict::{self, PathState, SyncDecision};
use crate::credentials::{CredentialError, CredentialStorage};
use crate::database::{
    ConflictRecord, DatabaseError, FileRecord, LocalDatabase, ResolutionStrategy, content_hash,
};
use crate::device::{DeviceError, DeviceManager};
use crate::encryption::{EncryptionManager, derive_workspace_salt};
use crate::events::{EventBus, SyncEvent, SyncState};
use crate::fs::{StorageError, WorkspaceFs};
use crate::paths::validate_sync_path;
use crate::remote::{RemoteChange, RemoteError, RemoteStore};
use crate::tokens::{TokenError, TokenManager};

/// How long a watcher-reported edit keeps pulls away from its path.
pub const EDIT_SETTLE_TTL: Duration = Duration::from_secs(2);

/// How long an engine write is recognizable as our own watcher echo.
const SYNC_WRITE_TTL: Duration = Duration::from_secs(5);

/// Extra retries for a transient remote failure within one cycle.
const MAX_RETRIES: u32 = 2;

/// Base delay for the backoff schedule (500ms, then 1s).
const BASE_DELAY: Duration = Duration::from_millis(500);

/// Cap on conflict-copy name probing per path.
const MAX_CONFLICT_COPIES: u32 = 100;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Device identity error: {0}")]
    Device(#[from] DeviceError),
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Cooperative cancellation for a running cycle.
///
/// Checked between per-file steps; a single file's transfer and record
/// update never observe it mid-flight. The token is sticky, which is
/// what a shutdown path wants.
#[derive(Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Path flags that expire after a TTL.
///
/// Backs both write-echo suppression (consumed flags) and the
/// edit-settle gate (peeked flags). Expiry keeps a dropped watcher
/// event from suppressing real work forever.
struct TtlFlags {
    ttl: Duration,
    paths: Mutex<HashMap<String, Instant>>,
}

impl TtlFlags {
    fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            paths: Mutex::new(HashMap::new()),
        }
    }

    fn mark(&self, path: &str) {
        self.paths
            .lock()
            .unwrap()
            .insert(path.to_string(), Instant::now());
    }

    /// Remove the flag; true if it was present and not expired.
    fn consume(&self, path: &str) -> bool {
        match self.paths.lock().unwrap().remove(path) {
            Some(marked) => marked.elapsed() < self.ttl,
            None => false,
        }
    }

    /// Check without removing.
    fn peek(&self, path: &str) -> bool {
        self.paths
            .lock()
            .unwrap()
            .get(path)
            .map(|marked| marked.elapsed() < self.ttl)
            .unwrap_or(false)
    }

    /// Drop expired flags so the map does not grow unbounded.
    fn sweep(&self) {
        let ttl = self.ttl;
        self.paths
            .lock()
            .unwrap()
            .retain(|_, marked| marked.elapsed() < ttl);
    }
}

/// What one cycle did.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CycleReport {
    pub pushed: usize,
    pub pulled: usize,
    pub deleted_local: usize,
    pub deleted_remote: usize,
    pub conflicts: usize,
    /// Undecryptable payloads and unusable remote keys, skipped with a warning.
    pub skipped: usize,
    /// Items that failed on the network and stay dirty for the next cycle.
    pub failed_retryable: usize,
    /// Pulls withheld because the path was inside the edit-settle window.
    pub deferred: usize,
}

impl CycleReport {
    pub fn has_changes(&self) -> bool {
        self.pushed + self.pulled + self.deleted_local + self.deleted_remote + self.conflicts > 0
    }

    pub fn is_clean(&self) -> bool {
        self.skipped == 0 && self.failed_retryable == 0 && self.deferred == 0
    }

    fn merge(&mut self, other: &CycleReport) {
        self.pushed += other.pushed;
        self.pulled += other.pulled;
        self.deleted_local += other.deleted_local;
        self.deleted_remote += other.deleted_remote;
        self.conflicts += other.conflicts;
        self.skipped += other.skipped;
        self.failed_retryable += other.failed_retryable;
        self.deferred += other.deferred;
    }
}

/// Result of a `sync_now` call.
#[derive(Debug)]
pub enum SyncOutcome {
    /// Ran at least one cycle.
    Completed(CycleReport),
    /// Another task was mid-cycle; this trigger folded into its rerun.
    Coalesced,
    /// Sync is disabled in settings.
    Disabled,
    /// Content key unavailable; unlock required.
    Locked,
    /// No session, or the session was rejected for good.
    LoggedOut,
    /// Server unreachable before any work started; next trigger retries.
    Offline,
    /// Cancelled between file steps. Partial work is recorded.
    Cancelled(CycleReport),
}

#[derive(Debug)]
enum CycleEnd {
    Completed(CycleReport),
    Cancelled(CycleReport),
    Disabled,
    Locked,
    LoggedOut,
    Offline,
}

#[derive(Debug)]
enum PipelineEnd {
    Completed(CycleReport),
    Cancelled(CycleReport),
    AuthFailed,
}

#[derive(Debug)]
enum ItemStatus {
    Applied,
    AuthFailed,
}

/// Run a remote call, retrying transient failures with exponential
/// backoff. Definitive failures return immediately.
async fn with_retry<T, Fut>(
    op: &'static str,
    call: impl Fn() -> Fut,
) -> std::result::Result<T, RemoteError>
where
    Fut: Future<Output = std::result::Result<T, RemoteError>>,
{
    let mut attempt = 0;
    loop {
        match call().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(op, attempt, "remote call succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) if attempt < MAX_RETRIES && error.is_retryable() => {
                let delay = BASE_DELAY * 2u32.pow(attempt);
                warn!(op, attempt, error = %error, "transient remote failure; backing off");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

/// Shared per-item failure handling. Auth rejections escalate to the
/// cycle; everything else stays local to the item.
fn note_remote_failure(path: &str, error: &RemoteError, report: &mut CycleReport) -> ItemStatus {
    match error {
        RemoteError::Auth(_) => ItemStatus::AuthFailed,
        _ => {
            warn!(path, error = %error, "item failed; will retry next cycle");
            report.failed_retryable += 1;
            ItemStatus::Applied
        }
    }
}

/// Orchestrates the sync lifecycle for one workspace.
///
/// All methods take `&self`; the manager is meant to live in an `Arc`
/// shared between the host's trigger sources (watcher, timer, UI).
pub struct SyncManager<F, S, R>
where
    F: WorkspaceFs + Clone,
    S: KvStore + Clone,
    R: RemoteStore + Clone,
{
    fs: F,
    store: S,
    remote: R,
    db: LocalDatabase<F>,
    encryption: EncryptionManager,
    credentials: CredentialStorage<S>,
    devices: DeviceManager<S>,
    tokens: Arc<TokenManager<S, R>>,
    events: Arc<EventBus>,
    state: Mutex<SyncState>,
    busy: AtomicBool,
    rerun: AtomicBool,
    cancel: CancelToken,
    edit_gate: TtlFlags,
    sync_writes: TtlFlags,
}

impl<F, S, R> SyncManager<F, S, R>
where
    F: WorkspaceFs + Clone,
    S: KvStore + Clone,
    R: RemoteStore + Clone,
{
    /// Load the index and wire up the component set. The token manager
    /// is shared with `AuthService` so both observe one session and one
    /// in-flight refresh.
    pub async fn init(fs: F, store: S, remote: R, tokens: Arc<TokenManager<S, R>>) -> Result<Self> {
        let db = LocalDatabase::load(fs.clone()).await?;
        Ok(Self {
            db,
            encryption: EncryptionManager::new(),
            credentials: CredentialStorage::new(store.clone()),
            devices: DeviceManager::new(store.clone()),
            tokens,
            events: Arc::new(EventBus::new()),
            state: Mutex::new(SyncState::Disabled),
            busy: AtomicBool::new(false),
            rerun: AtomicBool::new(false),
            cancel: CancelToken::new(),
            edit_gate: TtlFlags::new(EDIT_SETTLE_TTL),
            sync_writes: TtlFlags::new(SYNC_WRITE_TTL),
            fs,
            store,
            remote,
        })
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn state(&self) -> SyncState {
        *self.state.lock().unwrap()
    }

    /// Token for cancelling a running cycle from another task.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn database(&self) -> &LocalDatabase<F> {
        &self.db
    }

    /// Record a host edit. Pulls for this path are deferred until the
    /// autosave window has settled.
    pub fn mark_edited(&self, path: &str) {
        self.edit_gate.mark(path);
    }

    /// True exactly once for a path the engine itself just wrote. The
    /// watcher calls this to drop echo events instead of re-triggering.
    pub fn consume_sync_write(&self, path: &str) -> bool {
        self.sync_writes.consume(path)
    }

    fn set_state(&self, next: SyncState) {
        let mut guard = self.state.lock().unwrap();
        if *guard == next {
            return;
        }
        let previous = *guard;
        *guard = next;
        drop(guard);
        debug!(from = %previous, to = %next, "sync state changed");
        self.events.emit(SyncEvent::StateChanged { state: next });
    }

    /// Evaluate settings, session, and stored credential, and land in
    /// the matching state. Run once at host startup and again after
    /// login or logout.
    pub fn start(&self) -> SyncState {
        let settings = SyncSettings::load(&self.store);
        if !settings.enabled {
            self.set_state(SyncState::Disabled);
            return SyncState::Disabled;
        }
        self.set_state(SyncState::Unlocking);
        if !self.tokens.has_session() {
            self.set_state(SyncState::LoggedOut);
            return SyncState::LoggedOut;
        }
        if !self.encryption.is_unlocked() && !self.try_stored_unlock(&settings) {
            self.set_state(SyncState::Locked);
            self.events.emit(SyncEvent::UnlockRequired);
            return SyncState::Locked;
        }
        self.set_state(SyncState::Idle);
        SyncState::Idle
    }

    /// Install the content key from a freshly-entered password and
    /// persist it for the next start.
    pub fn unlock(&self, password: &str) -> SyncState {
        let settings = SyncSettings::load(&self.store);
        match self.resolve_salt(&settings) {
            Some(salt) => self.encryption.unlock(password, &salt),
            None => {
                warn!("cannot unlock: settings carry neither workspace salt nor email");
                self.set_state(SyncState::Locked);
                return SyncState::Locked;
            }
        }
        if let Err(error) = self.credentials.store_password(password) {
            warn!(error = %error, "could not persist sync password");
        }
        if self.tokens.has_session() {
            self.set_state(SyncState::Idle);
            SyncState::Idle
        } else {
            self.set_state(SyncState::LoggedOut);
            SyncState::LoggedOut
        }
    }

    /// Drop the content key and require a password before further
    /// cycles.
    pub fn lock(&self) {
        self.encryption.lock();
        self.set_state(SyncState::Locked);
        self.events.emit(SyncEvent::UnlockRequired);
    }

    fn resolve_salt(&self, settings: &SyncSettings) -> Option<Vec<u8>> {
        if let Some(encoded) = &settings.workspace_salt {
            match BASE64.decode(encoded) {
                Ok(bytes) => return Some(bytes),
                Err(_) => {
                    warn!("stored workspace salt is not valid base64; deriving from email");
                }
            }
        }
        settings
            .email
            .as_deref()
            .map(|email| derive_workspace_salt(email).to_vec())
    }

    fn try_stored_unlock(&self, settings: &SyncSettings) -> bool {
        let password = match self.credentials.get_password() {
            Ok(password) => password,
            Err(CredentialError::Missing) => {
                debug!("no stored sync password");
                return false;
            }
            Err(error) => {
                warn!(error = %error, "stored credential unusable");
                return false;
            }
        };
        match self.resolve_salt(settings) {
            Some(salt) => {
                self.encryption.unlock(&password, &salt);
                true
            }
            None => {
                warn!("no workspace salt available; cannot derive content key");
                false
            }
        }
    }

    /// Run a sync cycle now, unless one is already running.
    ///
    /// Concurrent callers coalesce: the running cycle picks the trigger
    /// up as a single follow-up pass instead of stacking cycles.
    pub async fn sync_now(&self) -> Result<SyncOutcome> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.rerun.store(true, Ordering::SeqCst);
            return Ok(SyncOutcome::Coalesced);
        }

        let outcome = self.run_cycles().await;
        self.busy.store(false, Ordering::SeqCst);
        outcome
    }

    async fn run_cycles(&self) -> Result<SyncOutcome> {
        let mut total = CycleReport::default();
        loop {
            let report = match self.run_cycle().await? {
                CycleEnd::Completed(report) => report,
                CycleEnd::Cancelled(report) => {
                    total.merge(&report);
                    return Ok(SyncOutcome::Cancelled(total));
                }
                CycleEnd::Disabled => return Ok(SyncOutcome::Disabled),
                CycleEnd::Locked => return Ok(SyncOutcome::Locked),
                CycleEnd::LoggedOut => return Ok(SyncOutcome::LoggedOut),
                CycleEnd::Offline => return Ok(SyncOutcome::Offline),
            };
            let deferred = report.deferred;
            total.merge(&report);
            if !self.rerun.swap(false, Ordering::SeqCst) {
                break;
            }
            if deferred > 0 {
                // Give the editor's debounce window time to settle
                // before retrying the deferred pulls.
                tokio::time::sleep(EDIT_SETTLE_TTL).await;
            }
        }
        Ok(SyncOutcome::Completed(total))
    }

    async fn run_cycle(&self) -> Result<CycleEnd> {
        if self.cancel.is_cancelled() {
            return Ok(CycleEnd::Cancelled(CycleReport::default()));
        }
        self.edit_gate.sweep();
        self.sync_writes.sweep();

        let settings = SyncSettings::load(&self.store);
        if !settings.enabled {
            self.set_state(SyncState::Disabled);
            return Ok(CycleEnd::Disabled);
        }
        if !self.tokens.has_session() {
            self.set_state(SyncState::LoggedOut);
            return Ok(CycleEnd::LoggedOut);
        }
        if !self.encryption.is_unlocked() && !self.try_stored_unlock(&settings) {
            self.set_state(SyncState::Locked);
            self.events.emit(SyncEvent::UnlockRequired);
            return Ok(CycleEnd::Locked);
        }

        let token = match self.tokens.valid_access_token().await {
            Ok(token) => token,
            Err(TokenError::Network(message)) => {
                warn!(error = %message, "cannot refresh session; server unreachable");
                return Ok(CycleEnd::Offline);
            }
            Err(error) => {
                info!(error = %error, "session unusable; login required");
                self.set_state(SyncState::LoggedOut);
                return Ok(CycleEnd::LoggedOut);
            }
        };

        self.set_state(SyncState::Syncing);
        match self.run_pipeline(&token).await? {
            PipelineEnd::Completed(report) => {
                if report.has_changes() {
                    info!(
                        pushed = report.pushed,
                        pulled = report.pulled,
                        deleted_local = report.deleted_local,
                        deleted_remote = report.deleted_remote,
                        conflicts = report.conflicts,
                        "sync cycle finished"
                    );
                } else {
                    debug!("sync cycle finished; nothing to do");
                }
                self.set_state(SyncState::Idle);
                Ok(CycleEnd::Completed(report))
            }
            PipelineEnd::Cancelled(report) => {
                info!("sync cycle cancelled");
                self.set_state(SyncState::Idle);
                Ok(CycleEnd::Cancelled(report))
            }
            PipelineEnd::AuthFailed => {
                // The server stopped accepting our tokens mid-cycle
                // (revoked device or expired account). Keeping the
                // session would just loop the same rejection.
                warn!("access rejected mid-cycle; login required");
                if let Err(error) = self.tokens.clear_session() {
                    warn!(error = %error, "could not clear rejected session");
                }
                self.set_state(SyncState::LoggedOut);
                Ok(CycleEnd::LoggedOut)
            }
        }
    }

    async fn run_pipeline(&self, token: &str) -> Result<PipelineEnd> {
        let mut report = CycleReport::default();
        let device = self.devices.touch()?;

        // Snapshot local work before pulling; pushes run after the pull
        // phase so a remote change for the same path wins the merge
        // decision instead of racing it.
        let dirty = self.db.list_dirty().await?;
        let mut local_work: BTreeSet<String> = BTreeSet::new();
        for entry in dirty.modified.iter().chain(dirty.created.iter()) {
            local_work.insert(entry.relative_path.clone());
        }
        for path in &dirty.missing {
            local_work.insert(path.clone());
        }
        for record in self.db.all_records().await {
            if record.deleted {
                local_work.insert(record.relative_path);
            }
        }

        // Pull phase: walk the feed one page at a time.
        let mut handled: HashSet<String> = HashSet::new();
        let mut cursor = self.db.cursor().await;
        loop {
            if self.cancel.is_cancelled() {
                return Ok(PipelineEnd::Cancelled(report));
            }
            let page = match with_retry("list_changes", || {
                self.remote.list_changes(token, cursor.as_deref())
            })
            .await
            {
                Ok(page) => page,
                Err(RemoteError::Auth(_)) => return Ok(PipelineEnd::AuthFailed),
                Err(error) => {
                    warn!(error = %error, "cannot list remote changes; deferring to next cycle");
                    report.failed_retryable += 1;
                    break;
                }
            };

            for change in &page.changes {
                if self.cancel.is_cancelled() {
                    return Ok(PipelineEnd::Cancelled(report));
                }
                if let Err(error) = validate_sync_path(&change.key) {
                    warn!(key = %change.key, error = %error, "unusable key in change feed; skipping");
                    report.skipped += 1;
                    continue;
                }
                let status = self
                    .process_path(token, &device.id, &change.key, Some(change), &mut report)
                    .await?;
                if matches!(status, ItemStatus::AuthFailed) {
                    return Ok(PipelineEnd::AuthFailed);
                }
                handled.insert(change.key.clone());
            }

            // Records for this page are saved; now the cursor may move.
            let has_more = page.has_more;
            if cursor.as_deref() != Some(page.cursor.as_str()) {
                self.db.advance_cursor(&page.cursor).await?;
            }
            cursor = Some(page.cursor);
            if !has_more {
                break;
            }
        }

        // Push phase: everything local the feed did not already cover.
        for path in local_work {
            if handled.contains(&path) {
                continue;
            }
            if self.cancel.is_cancelled() {
                return Ok(PipelineEnd::Cancelled(report));
            }
            let status = self
                .process_path(token, &device.id, &path, None, &mut report)
                .await?;
            if matches!(status, ItemStatus::AuthFailed) {
                return Ok(PipelineEnd::AuthFailed);
            }
        }

        Ok(PipelineEnd::Completed(report))
    }

    /// Decide and apply one path. Everything the decision needs is read
    /// fresh here; the dirty snapshot only chose which paths to visit.
    async fn process_path(
        &self,
        token: &str,
        device_id: &str,
        path: &str,
        remote: Option<&RemoteChange>,
        report: &mut CycleReport,
    ) -> Result<ItemStatus> {
        let record = self.db.record(path).await;
        let local_bytes = match self.fs.read(path).await {
            Ok(bytes) => Some(bytes),
            Err(StorageError::NotFound(_)) => None,
            Err(error) => {
                warn!(path, error = %error, "cannot read local file; skipping");
                report.failed_retryable += 1;
                return Ok(ItemStatus::Applied);
            }
        };
        let local_hash = local_bytes.as_deref().map(content_hash);

        let decision = conflict::decide(&PathState {
            record: record.as_ref(),
            local_exists: local_bytes.is_some(),
            local_hash: local_hash.as_deref(),
            remote,
            remote_hash: None,
        });

        match decision {
            SyncDecision::NoOp => Ok(ItemStatus::Applied),
            SyncDecision::Push => match local_bytes {
                Some(bytes) => self.push_file(token, device_id, path, bytes, report).await,
                // Vanished between scan and read; next cycle reclassifies.
                None => Ok(ItemStatus::Applied),
            },
            SyncDecision::PushDelete => {
                self.push_tombstone(token, device_id, path, record, report)
                    .await
            }
            SyncDecision::Pull => match remote {
                Some(change) => self.pull_file(token, path, change, report).await,
                None => Ok(ItemStatus::Applied),
            },
            SyncDecision::PullDelete => self.pull_delete(path, report).await,
            SyncDecision::FetchAndCompare | SyncDecision::FastForward | SyncDecision::Conflict => {
                match remote {
                    Some(change) => {
                        self.fetch_and_resolve(
                            token,
                            path,
                            change,
                            record,
                            local_bytes,
                            local_hash,
                            report,
                        )
                        .await
                    }
                    None => Ok(ItemStatus::Applied),
                }
            }
        }
    }

    async fn push_file(
        &self,
        token: &str,
        device_id: &str,
        path: &str,
        bytes: Vec<u8>,
        report: &mut CycleReport,
    ) -> Result<ItemStatus> {
        let envelope = match self.encryption.encrypt(&bytes) {
            Ok(envelope) => envelope,
            Err(error) => {
                // lock() raced the cycle; the item stays dirty.
                warn!(path, error = %error, "cannot encrypt; leaving item dirty");
                report.failed_retryable += 1;
                return Ok(ItemStatus::Applied);
            }
        };
        let version = match with_retry("put_object", || {
            self.remote.put_object(token, path, &envelope, device_id)
        })
        .await
        {
            Ok(version) => version,
            Err(error) => return Ok(note_remote_failure(path, &error, report)),
        };
        self.db
            .upsert_record(FileRecord {
                relative_path: path.to_string(),
                content_hash: content_hash(&bytes),
                remote_version: version,
                last_synced_at: Utc::now(),
                deleted: false,
            })
            .await?;
        report.pushed += 1;
        debug!(path, version, "pushed");
        Ok(ItemStatus::Applied)
    }

    async fn push_tombstone(
        &self,
        token: &str,
        device_id: &str,
        path: &str,
        record: Option<FileRecord>,
        report: &mut CycleReport,
    ) -> Result<ItemStatus> {
        // Persist the delete intent before telling the server; a crash
        // between the two must not resurrect the file on this device.
        let needs_intent = record.as_ref().map(|r| !r.deleted).unwrap_or(true);
        if needs_intent {
            let base = record.unwrap_or_else(|| FileRecord {
                relative_path: path.to_string(),
                content_hash: String::new(),
                remote_version: 0,
                last_synced_at: Utc::now(),
                deleted: true,
            });
            self.db
                .upsert_record(FileRecord {
                    deleted: true,
                    ..base
                })
                .await?;
        }
        match with_retry("delete_object", || {
            self.remote.delete_object(token, path, device_id)
        })
        .await
        {
            Ok(_version) => {
                self.db.delete_record(path).await?;
                report.deleted_remote += 1;
                debug!(path, "tombstone acknowledged");
                Ok(ItemStatus::Applied)
            }
            Err(error) => Ok(note_remote_failure(path, &error, report)),
        }
    }

    async fn pull_file(
        &self,
        token: &str,
        path: &str,
        change: &RemoteChange,
        report: &mut CycleReport,
    ) -> Result<ItemStatus> {
        if self.defer_if_editing(path, report) {
            return Ok(ItemStatus::Applied);
        }
        let envelope = match with_retry("get_object", || self.remote.get_object(token, &change.key))
            .await
        {
            Ok(bytes) => bytes,
            Err(error) => return Ok(note_remote_failure(path, &error, report)),
        };
        let plaintext = match self.encryption.decrypt(&envelope) {
            Ok(plaintext) => plaintext,
            Err(error) => {
                warn!(path, error = %error, "cannot decrypt remote object; skipping");
                report.skipped += 1;
                return Ok(ItemStatus::Applied);
            }
        };
        // The echo mark precedes the write so the watcher can never see
        // the write before the flag exists.
        self.sync_writes.mark(path);
        if let Err(error) = self.fs.write(path, &plaintext).await {
            warn!(path, error = %error, "cannot write pulled file");
            report.failed_retryable += 1;
            return Ok(ItemStatus::Applied);
        }
        self.db
            .upsert_record(FileRecord {
                relative_path: path.to_string(),
                content_hash: content_hash(&plaintext),
                remote_version: change.version,
                last_synced_at: change.modified_at,
                deleted: false,
            })
            .await?;
        report.pulled += 1;
        debug!(path, version = change.version, "pulled");
        Ok(ItemStatus::Applied)
    }

    async fn pull_delete(&self, path: &str, report: &mut CycleReport) -> Result<ItemStatus> {
        if self.defer_if_editing(path, report) {
            return Ok(ItemStatus::Applied);
        }
        self.sync_writes.mark(path);
        match self.fs.delete(path).await {
            Ok(()) | Err(StorageError::NotFound(_)) => {}
            Err(error) => {
                warn!(path, error = %error, "cannot remove local file");
                report.failed_retryable += 1;
                return Ok(ItemStatus::Applied);
            }
        }
        self.db.delete_record(path).await?;
        report.deleted_local += 1;
        debug!(path, "removed (remote tombstone)");
        Ok(ItemStatus::Applied)
    }

    /// Both sides advanced. The feed only carries version markers, so
    /// fetch and decrypt the remote content before separating a true
    /// conflict from two devices arriving at the same bytes.
    #[allow(clippy::too_many_arguments)]
    async fn fetch_and_resolve(
        &self,
        token: &str,
        path: &str,
        change: &RemoteChange,
        record: Option<FileRecord>,
        local_bytes: Option<Vec<u8>>,
        local_hash: Option<String>,
        report: &mut CycleReport,
    ) -> Result<ItemStatus> {
        if self.defer_if_editing(path, report) {
            return Ok(ItemStatus::Applied);
        }
        let envelope = match with_retry("get_object", || self.remote.get_object(token, &change.key))
            .await
        {
            Ok(bytes) => bytes,
            Err(error) => return Ok(note_remote_failure(path, &error, report)),
        };
        let remote_plain = match self.encryption.decrypt(&envelope) {
            Ok(plaintext) => plaintext,
            Err(error) => {
                warn!(path, error = %error, "cannot decrypt remote object; skipping");
                report.skipped += 1;
                return Ok(ItemStatus::Applied);
            }
        };
        let remote_hash = content_hash(&remote_plain);

        let decision = conflict::decide(&PathState {
            record: record.as_ref(),
            local_exists: local_bytes.is_some(),
            local_hash: local_hash.as_deref(),
            remote: Some(change),
            remote_hash: Some(&remote_hash),
        });
        match decision {
            SyncDecision::FastForward => {
                // Same bytes on both sides; just align the record.
                self.db
                    .upsert_record(FileRecord {
                        relative_path: path.to_string(),
                        content_hash: remote_hash,
                        remote_version: change.version,
                        last_synced_at: change.modified_at,
                        deleted: false,
                    })
                    .await?;
                debug!(path, version = change.version, "fast-forwarded");
                Ok(ItemStatus::Applied)
            }
            SyncDecision::Conflict => {
                let local_hash = local_hash.unwrap_or_default();
                self.materialize_conflict(
                    path,
                    change,
                    local_bytes.unwrap_or_default(),
                    local_hash,
                    remote_plain,
                    remote_hash,
                    report,
                )
                .await
            }
            other => {
                debug!(path, ?other, "divergence settled on re-decision");
                Ok(ItemStatus::Applied)
            }
        }
    }

    /// Remote stays canonical at the path; the losing local bytes
    /// survive in a conflict-suffixed copy. The conflict record is
    /// persisted first so a crash mid-way is finished by the next
    /// cycle instead of losing the local version.
    #[allow(clippy::too_many_arguments)]
    async fn materialize_conflict(
        &self,
        path: &str,
        change: &RemoteChange,
        local_bytes: Vec<u8>,
        local_hash: String,
        remote_plain: Vec<u8>,
        remote_hash: String,
        report: &mut CycleReport,
    ) -> Result<ItemStatus> {
        let Some(copy_path) = self.free_conflict_path(path).await else {
            warn!(path, "no free conflict copy name; leaving item dirty");
            report.failed_retryable += 1;
            return Ok(ItemStatus::Applied);
        };

        self.db
            .add_conflict(ConflictRecord {
                relative_path: path.to_string(),
                local_hash,
                remote_version: change.version,
                detected_at: Utc::now(),
                resolution: ResolutionStrategy::LocalCopied,
            })
            .await?;

        self.sync_writes.mark(&copy_path);
        if let Err(error) = self.fs.write(&copy_path, &local_bytes).await {
            warn!(path, error = %error, "cannot write conflict copy");
            report.failed_retryable += 1;
            return Ok(ItemStatus::Applied);
        }
        self.sync_writes.mark(path);
        if let Err(error) = self.fs.write(path, &remote_plain).await {
            warn!(path, error = %error, "cannot write canonical content");
            report.failed_retryable += 1;
            return Ok(ItemStatus::Applied);
        }

        self.db
            .upsert_record(FileRecord {
                relative_path: path.to_string(),
                content_hash: remote_hash,
                remote_version: change.version,
                last_synced_at: change.modified_at,
                deleted: false,
            })
            .await?;
        self.db.resolve_conflict(path).await?;
        report.conflicts += 1;
        info!(path, copy = %copy_path, "conflict resolved; local version preserved");
        self.events.emit(SyncEvent::Conflict {
            path: path.to_string(),
            resolution: ResolutionStrategy::LocalCopied,
            conflict_copy: copy_path,
            timestamp: Utc::now(),
        });
        Ok(ItemStatus::Applied)
    }

    async fn free_conflict_path(&self, path: &str) -> Option<String> {
        for attempt in 1..=MAX_CONFLICT_COPIES {
            let candidate = conflict::conflict_copy_path(path, attempt);
            match self.fs.exists(&candidate).await {
                Ok(false) => return Some(candidate),
                Ok(true) => continue,
                Err(_) => return None,
            }
        }
        None
    }

    fn defer_if_editing(&self, path: &str, report: &mut CycleReport) -> bool {
        if self.edit_gate.peek(path) {
            debug!(path, "edit window open; deferring pull");
            report.deferred += 1;
            self.rerun.store(true, Ordering::SeqCst);
            return true;
        }
        false
    }
}
