//! Per-path sync decisions.
//!
//! `decide` is a pure function from one path's local state, index record,
//! and latest remote change to the action a cycle should take. All the
//! policy lives here; the cycle only executes.
//!
//! Ground rules:
//! - A remote change whose version equals the recorded version is the echo
//!   of this device's own write, not new information.
//! - Edits beat deletes, in both directions.
//! - Two divergent edits never silently reduce to one survivor: remote
//!   stays canonical at the path, local bytes move to a conflict copy.

use crate::database::FileRecord;
use crate::remote::RemoteChange;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDecision {
    /// Nothing to do.
    NoOp,
    /// Local content is newer; encrypt and upload.
    Push,
    /// Local delete not yet on the remote; send a tombstone.
    PushDelete,
    /// Remote content is newer; download, decrypt, write.
    Pull,
    /// Remote tombstone; remove the local file and record.
    PullDelete,
    /// Both sides advanced. Fetch the remote content, hash it, and call
    /// `decide` again with `remote_hash` filled in.
    FetchAndCompare,
    /// Both sides advanced to identical bytes; adopt the remote version
    /// marker without transferring anything.
    FastForward,
    /// True divergence. Materialize a conflict copy, keep remote canonical.
    Conflict,
}

/// Everything known about one path at decision time.
///
/// `remote` is the latest feed entry for the path since the cursor, or
/// `None` when the remote has not moved. `remote_hash` is only available
/// after a fetch; `decide` asks for one via `FetchAndCompare` when it
/// matters.
#[derive(Debug, Clone, Copy)]
pub struct PathState<'a> {
    pub record: Option<&'a FileRecord>,
    pub local_exists: bool,
    pub local_hash: Option<&'a str>,
    pub remote: Option<&'a RemoteChange>,
    pub remote_hash: Option<&'a str>,
}

pub fn decide(state: &PathState) -> SyncDecision {
    let recorded_version = state.record.map(|r| r.remote_version).unwrap_or(0);
    let remote_changed = match state.remote {
        None => false,
        Some(change) => change.version != recorded_version,
    };
    let remote_deleted = state.remote.map(|c| c.deleted).unwrap_or(false);

    // A pending local tombstone is its own little state machine: the
    // delete intent is durable but the remote has not confirmed it.
    if let Some(record) = state.record {
        if record.deleted && !state.local_exists {
            return if !remote_changed {
                SyncDecision::PushDelete
            } else if remote_deleted {
                // Someone else deleted it too; just confirm.
                SyncDecision::PullDelete
            } else {
                // Their edit outlives our delete.
                SyncDecision::Pull
            };
        }
    }

    let local_changed = match state.record {
        None => state.local_exists,
        Some(record) if record.deleted => state.local_exists,
        Some(record) => {
            !state.local_exists || state.local_hash != Some(record.content_hash.as_str())
        }
    };

    match (local_changed, remote_changed) {
        (false, false) => SyncDecision::NoOp,

        (true, false) => {
            if state.local_exists {
                SyncDecision::Push
            } else {
                SyncDecision::PushDelete
            }
        }

        (false, true) => {
            if !remote_deleted {
                SyncDecision::Pull
            } else if state.record.is_some() {
                SyncDecision::PullDelete
            } else {
                // Tombstone for a path we never tracked and do not have.
                SyncDecision::NoOp
            }
        }

        (true, true) => match (remote_deleted, state.local_exists) {
            // Edits beat deletes.
            (true, true) => SyncDecision::Push,
            (false, false) => SyncDecision::Pull,
            // Both sides deleted independently.
            (true, false) => SyncDecision::PullDelete,
            // Both sides edited. Identical bytes fast-forward; anything
            // else is a real conflict.
            (false, true) => match state.remote_hash {
                None => SyncDecision::FetchAndCompare,
                Some(remote_hash) if state.local_hash == Some(remote_hash) => {
                    SyncDecision::FastForward
                }
                Some(_) => SyncDecision::Conflict,
            },
        },
    }
}

/// Name for the n-th conflict copy of a path.
/// `notes/a.md` becomes `notes/a.md (conflict).md`, then
/// `notes/a.md (conflict 2).md`, and so on.
pub fn conflict_copy_path(path: &str, attempt: u32) -> String {
    if attempt <= 1 {
        format!("{path} (conflict).md")
    } else {
        format!("{path} (conflict {attempt}).md")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(hash: &str, version: u64, deleted: bool) -> FileRecord {
        FileRecord {
            relative_path: "a.md".to_string(),
            content_hash: hash.to_string(),
            remote_version: version,
            last_synced_at: Utc::now(),
            deleted,
        }
    }

    fn change(version: u64, deleted: bool) -> RemoteChange {
        RemoteChange {
            key: "a.md".to_string(),
            version,
            deleted,
            origin_device: "other".to_string(),
            modified_at: Utc::now(),
        }
    }

    fn state<'a>(
        record: Option<&'a FileRecord>,
        local_hash: Option<&'a str>,
        remote: Option<&'a RemoteChange>,
        remote_hash: Option<&'a str>,
    ) -> PathState<'a> {
        PathState {
            record,
            local_exists: local_hash.is_some(),
            local_hash,
            remote,
            remote_hash,
        }
    }

    // ==================== quiet paths ====================

    #[test]
    fn test_unchanged_both_sides_is_noop() {
        let r = record("h1", 3, false);
        assert_eq!(
            decide(&state(Some(&r), Some("h1"), None, None)),
            SyncDecision::NoOp
        );
    }

    #[test]
    fn test_own_echo_is_noop() {
        // The feed replays our own push; version matches the record.
        let r = record("h1", 3, false);
        let c = change(3, false);
        assert_eq!(
            decide(&state(Some(&r), Some("h1"), Some(&c), None)),
            SyncDecision::NoOp
        );
    }

    #[test]
    fn test_foreign_tombstone_for_unknown_path_is_noop() {
        let c = change(5, true);
        assert_eq!(decide(&state(None, None, Some(&c), None)), SyncDecision::NoOp);
    }

    // ==================== one-sided changes ====================

    #[test]
    fn test_new_local_file_pushes() {
        assert_eq!(
            decide(&state(None, Some("h1"), None, None)),
            SyncDecision::Push
        );
    }

    #[test]
    fn test_local_edit_pushes() {
        let r = record("h1", 3, false);
        assert_eq!(
            decide(&state(Some(&r), Some("h2"), None, None)),
            SyncDecision::Push
        );
    }

    #[test]
    fn test_local_delete_pushes_tombstone() {
        let r = record("h1", 3, false);
        assert_eq!(
            decide(&state(Some(&r), None, None, None)),
            SyncDecision::PushDelete
        );
    }

    #[test]
    fn test_pending_tombstone_retries_push_delete() {
        let r = record("h1", 3, true);
        assert_eq!(
            decide(&state(Some(&r), None, None, None)),
            SyncDecision::PushDelete
        );
    }

    #[test]
    fn test_remote_advance_pulls() {
        let r = record("h1", 3, false);
        let c = change(4, false);
        assert_eq!(
            decide(&state(Some(&r), Some("h1"), Some(&c), None)),
            SyncDecision::Pull
        );
    }

    #[test]
    fn test_brand_new_remote_file_pulls() {
        let c = change(7, false);
        assert_eq!(decide(&state(None, None, Some(&c), None)), SyncDecision::Pull);
    }

    #[test]
    fn test_remote_tombstone_pull_deletes() {
        let r = record("h1", 3, false);
        let c = change(4, true);
        assert_eq!(
            decide(&state(Some(&r), Some("h1"), Some(&c), None)),
            SyncDecision::PullDelete
        );
    }

    // ==================== edits vs deletes ====================

    #[test]
    fn test_local_edit_beats_remote_delete() {
        let r = record("h1", 3, false);
        let c = change(4, true);
        assert_eq!(
            decide(&state(Some(&r), Some("h2"), Some(&c), None)),
            SyncDecision::Push
        );
    }

    #[test]
    fn test_remote_edit_beats_local_delete() {
        let r = record("h1", 3, false);
        let c = change(4, false);
        assert_eq!(
            decide(&state(Some(&r), None, Some(&c), None)),
            SyncDecision::Pull
        );
    }

    #[test]
    fn test_remote_edit_beats_pending_local_tombstone() {
        let r = record("h1", 3, true);
        let c = change(4, false);
        assert_eq!(
            decide(&state(Some(&r), None, Some(&c), None)),
            SyncDecision::Pull
        );
    }

    #[test]
    fn test_both_deleted_confirms_quietly() {
        let r = record("h1", 3, false);
        let c = change(4, true);
        assert_eq!(
            decide(&state(Some(&r), None, Some(&c), None)),
            SyncDecision::PullDelete
        );

        let tomb = record("h1", 3, true);
        assert_eq!(
            decide(&state(Some(&tomb), None, Some(&c), None)),
            SyncDecision::PullDelete
        );
    }

    #[test]
    fn test_reborn_file_over_tombstone_pushes() {
        let r = record("h1", 3, true);
        assert_eq!(
            decide(&state(Some(&r), Some("h2"), None, None)),
            SyncDecision::Push
        );
    }

    // ==================== divergence ====================

    #[test]
    fn test_divergence_requires_fetch_first() {
        let r = record("h1", 3, false);
        let c = change(4, false);
        assert_eq!(
            decide(&state(Some(&r), Some("h2"), Some(&c), None)),
            SyncDecision::FetchAndCompare
        );
    }

    #[test]
    fn test_identical_bytes_fast_forward() {
        let r = record("h1", 3, false);
        let c = change(4, false);
        assert_eq!(
            decide(&state(Some(&r), Some("h2"), Some(&c), Some("h2"))),
            SyncDecision::FastForward
        );
    }

    #[test]
    fn test_divergent_bytes_conflict() {
        let r = record("h1", 3, false);
        let c = change(4, false);
        assert_eq!(
            decide(&state(Some(&r), Some("h2"), Some(&c), Some("h3"))),
            SyncDecision::Conflict
        );
    }

    #[test]
    fn test_new_file_both_sides_with_same_bytes_fast_forwards() {
        // Created independently on two devices with identical content
        let c = change(4, false);
        assert_eq!(
            decide(&state(None, Some("h2"), Some(&c), Some("h2"))),
            SyncDecision::FastForward
        );
        assert_eq!(
            decide(&state(None, Some("h2"), Some(&c), Some("h9"))),
            SyncDecision::Conflict
        );
    }

    // ==================== conflict copy naming ====================

    #[test]
    fn test_conflict_copy_names() {
        assert_eq!(conflict_copy_path("notes/a.md", 1), "notes/a.md (conflict).md");
        assert_eq!(
            conflict_copy_path("notes/a.md", 2),
            "notes/a.md (conflict 2).md"
        );
        assert_eq!(
            conflict_copy_path("notes/a.md", 3),
            "notes/a.md (conflict 3).md"
        );
    }
}
