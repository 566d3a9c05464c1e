//! Per-workspace sync index.
//!
//! One JSON document under `.sync/index.json` holds the file records, any
//! unresolved conflict records, and the remote change cursor. Every save
//! goes through temp-file + rename, so a crash never leaves the index
//! half-written.
//!
//! The cursor is deliberately written by its own save, after a batch's
//! records are durable. Replaying changes from an old cursor is harmless;
//! losing a record that said "this version is already synced" is not.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::fs::{StorageError, WorkspaceFs};
use crate::paths::SYNC_DIR;

const SCHEMA_VERSION: u32 = 1;

pub fn index_path() -> String {
    format!("{SYNC_DIR}/index.json")
}

fn index_temp_path() -> String {
    format!("{SYNC_DIR}/index.json.tmp")
}

/// Hash used for change detection and as the local version marker.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Corrupted sync index: {0}")]
    Corrupted(String),

    #[error("Sync index schema {0} is newer than this build understands")]
    UnsupportedSchema(u32),
}

pub type Result<T> = std::result::Result<T, DatabaseError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub relative_path: String,
    /// Hash of the content as of the last successful sync.
    pub content_hash: String,
    /// Server-issued version marker; 0 means never pushed.
    pub remote_version: u64,
    pub last_synced_at: DateTime<Utc>,
    /// Tombstone: deleted locally, deletion not yet confirmed remote-side.
    pub deleted: bool,
}

/// How a conflict was materialized.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResolutionStrategy {
    /// Remote stays canonical at the path; local bytes preserved in a
    /// conflict-suffixed copy.
    LocalCopied,
}

/// A detected divergence that has not reached its resolved state yet.
/// Exists only inside that window; removal happens in the same cycle once
/// the FileRecord is updated, or in the next cycle after a crash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub relative_path: String,
    pub local_hash: String,
    pub remote_version: u64,
    pub detected_at: DateTime<Utc>,
    pub resolution: ResolutionStrategy,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DirtyEntry {
    pub relative_path: String,
    pub content_hash: String,
}

/// Outcome of a lazy re-hash of the workspace against the index.
#[derive(Debug, Default)]
pub struct DirtyReport {
    /// Tracked files whose bytes no longer match the recorded hash.
    pub modified: Vec<DirtyEntry>,
    /// Files with no live record (brand new, or reborn over a tombstone).
    pub created: Vec<DirtyEntry>,
    /// Live records whose file is gone. Candidate deletes.
    pub missing: Vec<String>,
}

impl DirtyReport {
    pub fn is_empty(&self) -> bool {
        self.modified.is_empty() && self.created.is_empty() && self.missing.is_empty()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexState {
    #[serde(default)]
    schema: u32,
    #[serde(default)]
    cursor: Option<String>,
    #[serde(default)]
    records: BTreeMap<String, FileRecord>,
    #[serde(default)]
    conflicts: Vec<ConflictRecord>,
}

impl Default for IndexState {
    fn default() -> Self {
        Self {
            schema: SCHEMA_VERSION,
            cursor: None,
            records: BTreeMap::new(),
            conflicts: Vec::new(),
        }
    }
}

/// A schema 0 index predates the schema field; its layout is otherwise
/// identical. Newer schemas are refused rather than guessed at.
fn migrate(state: &mut IndexState) {
    if state.schema == 0 {
        state.schema = 1;
    }
}

pub struct LocalDatabase<F: WorkspaceFs> {
    fs: F,
    state: Mutex<IndexState>,
}

impl<F: WorkspaceFs> LocalDatabase<F> {
    pub async fn load(fs: F) -> Result<Self> {
        let state = match fs.read(&index_path()).await {
            Ok(bytes) => {
                let mut state: IndexState = serde_json::from_slice(&bytes)
                    .map_err(|e| DatabaseError::Corrupted(e.to_string()))?;
                if state.schema > SCHEMA_VERSION {
                    return Err(DatabaseError::UnsupportedSchema(state.schema));
                }
                migrate(&mut state);
                debug!(records = state.records.len(), "Loaded sync index");
                state
            }
            Err(StorageError::NotFound(_)) => IndexState::default(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            fs,
            state: Mutex::new(state),
        })
    }

    pub async fn record(&self, path: &str) -> Option<FileRecord> {
        self.state.lock().await.records.get(path).cloned()
    }

    pub async fn all_records(&self) -> Vec<FileRecord> {
        self.state.lock().await.records.values().cloned().collect()
    }

    /// Insert or update one record and persist. `last_synced_at` never
    /// moves backwards; a stale timestamp is clamped to the stored one.
    pub async fn upsert_record(&self, mut record: FileRecord) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.records.get(&record.relative_path) {
            if existing.last_synced_at > record.last_synced_at {
                debug!(
                    path = %record.relative_path,
                    "Clamping stale lastSyncedAt on upsert"
                );
                record.last_synced_at = existing.last_synced_at;
            }
        }
        state.records.insert(record.relative_path.clone(), record);
        self.save(&state).await
    }

    /// Remove a record entirely (tombstones use `deleted` on upsert
    /// instead; this is for when the remote has confirmed the delete).
    pub async fn delete_record(&self, path: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.records.remove(path).is_some() {
            self.save(&state).await?;
        }
        Ok(())
    }

    pub async fn cursor(&self) -> Option<String> {
        self.state.lock().await.cursor.clone()
    }

    /// Persist a new cursor position. Callers only do this after the
    /// batch's record upserts have completed.
    pub async fn advance_cursor(&self, cursor: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.cursor = Some(cursor.to_string());
        self.save(&state).await
    }

    pub async fn conflicts(&self) -> Vec<ConflictRecord> {
        self.state.lock().await.conflicts.clone()
    }

    pub async fn add_conflict(&self, conflict: ConflictRecord) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .conflicts
            .retain(|c| c.relative_path != conflict.relative_path);
        state.conflicts.push(conflict);
        self.save(&state).await
    }

    pub async fn resolve_conflict(&self, path: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let before = state.conflicts.len();
        state.conflicts.retain(|c| c.relative_path != path);
        if state.conflicts.len() != before {
            self.save(&state).await?;
        }
        Ok(())
    }

    /// Re-hash the workspace and report what drifted from the index.
    ///
    /// Hashing happens here, on demand, never inside upserts; a cycle pays
    /// the cost once.
    pub async fn list_dirty(&self) -> Result<DirtyReport> {
        let files = self.scan_workspace_files().await?;
        let records: BTreeMap<String, FileRecord> = {
            let state = self.state.lock().await;
            state.records.clone()
        };

        let mut report = DirtyReport::default();
        let mut seen = std::collections::HashSet::new();

        for path in files {
            seen.insert(path.clone());
            let bytes = match self.fs.read(&path).await {
                Ok(bytes) => bytes,
                // Deleted between listing and hashing; the record side of
                // the diff below will pick it up.
                Err(StorageError::NotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            };
            let hash = content_hash(&bytes);

            match records.get(&path) {
                Some(record) if !record.deleted => {
                    if record.content_hash != hash {
                        report.modified.push(DirtyEntry {
                            relative_path: path,
                            content_hash: hash,
                        });
                    }
                }
                // No record, or a tombstone the file was reborn over.
                _ => report.created.push(DirtyEntry {
                    relative_path: path,
                    content_hash: hash,
                }),
            }
        }

        for (path, record) in &records {
            if !record.deleted && !seen.contains(path) {
                report.missing.push(path.clone());
            }
        }

        if !report.is_empty() {
            debug!(
                modified = report.modified.len(),
                created = report.created.len(),
                missing = report.missing.len(),
                "Local drift detected"
            );
        }
        Ok(report)
    }

    /// All `.md` files in the workspace, skipping the state directory and
    /// hidden entries.
    async fn scan_workspace_files(&self) -> Result<Vec<String>> {
        let mut files = Vec::new();
        let mut queue = vec![String::new()];

        while let Some(dir) = queue.pop() {
            let entries = match self.fs.list(&dir).await {
                Ok(entries) => entries,
                Err(StorageError::NotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            };

            for entry in entries {
                if entry.name.starts_with('.') {
                    continue;
                }
                let path = if dir.is_empty() {
                    entry.name.clone()
                } else {
                    format!("{}/{}", dir, entry.name)
                };
                if entry.is_dir {
                    queue.push(path);
                } else if path.ends_with(".md") {
                    files.push(path);
                }
            }
        }

        files.sort();
        Ok(files)
    }

    async fn save(&self, state: &IndexState) -> Result<()> {
        let json = serde_json::to_string_pretty(state)
            .map_err(|e| DatabaseError::Corrupted(e.to_string()))?;
        self.fs.write(&index_temp_path(), json.as_bytes()).await?;
        self.fs.rename(&index_temp_path(), &index_path()).await?;
        Ok(())
    }
}
