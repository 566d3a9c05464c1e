//! Debounced file watcher for the workspace.
//!
//! Editors save in bursts (write, truncate, rename dance), so raw notify
//! events are debounced before they reach the sync loop. Everything under
//! `.sync/`, hidden entries, and non-markdown files are filtered out here
//! so the loop only ever sees syncable paths.

use anyhow::Result;
use notify::RecursiveMode;
use notify_debouncer_mini::{DebouncedEvent, new_debouncer};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Debounce window for editor save bursts.
const DEBOUNCE: Duration = Duration::from_millis(200);

/// A change inside the workspace, relative to its root.
#[derive(Debug, Clone)]
pub struct FileEvent {
    pub path: String,
    pub kind: FileEventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventKind {
    /// File was created or modified
    Modified,
    /// File was deleted
    Deleted,
}

/// Watches the workspace directory and feeds filtered events to the
/// sync loop over an unbounded channel.
pub struct WorkspaceWatcher {
    root: PathBuf,
    /// Debouncer handle (must keep alive)
    _debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
    event_rx: mpsc::UnboundedReceiver<FileEvent>,
}

/// Last seen mtimes, used to drop duplicate notifications some platforms
/// emit for a single write.
type MtimeCache = Arc<Mutex<HashMap<PathBuf, SystemTime>>>;

impl WorkspaceWatcher {
    pub fn new(root: PathBuf) -> Result<Self> {
        // Resolve symlinks up front; on macOS the FSEvents stream needs
        // the real path, not the /var -> /private/var alias.
        let root = root.canonicalize().unwrap_or(root);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let root_clone = root.clone();
        let mtime_cache: MtimeCache = Arc::new(Mutex::new(HashMap::new()));
        let cache_clone = Arc::clone(&mtime_cache);

        let mut debouncer = new_debouncer(
            DEBOUNCE,
            move |result: Result<Vec<DebouncedEvent>, notify::Error>| match result {
                Ok(events) => {
                    for event in events {
                        if let Some(file_event) =
                            Self::process_event(&event, &root_clone, &cache_clone)
                        {
                            if event_tx.send(file_event).is_err() {
                                // Receiver dropped; daemon is shutting down.
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    error!("File watcher error: {e}");
                }
            },
        )?;

        debouncer.watcher().watch(&root, RecursiveMode::Recursive)?;

        Ok(Self {
            root,
            _debouncer: debouncer,
            event_rx,
        })
    }

    fn process_event(
        event: &DebouncedEvent,
        root: &Path,
        mtime_cache: &MtimeCache,
    ) -> Option<FileEvent> {
        let path = &event.path;
        let relative = path.strip_prefix(root).ok()?;
        let relative_str = relative.to_str()?.replace('\\', "/");

        if !is_watchable(&relative_str) {
            return None;
        }

        let kind = if path.exists() {
            FileEventKind::Modified
        } else {
            FileEventKind::Deleted
        };

        // Mtime dedup for modifications; keyed by relative path so the
        // cache stays bounded by workspace size.
        let relative_key = relative.to_path_buf();
        match kind {
            FileEventKind::Modified => {
                if let Ok(metadata) = std::fs::metadata(path) {
                    if let Ok(mtime) = metadata.modified() {
                        let mut cache = mtime_cache.lock().unwrap();
                        if cache.get(&relative_key) == Some(&mtime) {
                            return None;
                        }
                        cache.insert(relative_key, mtime);
                    }
                }
            }
            FileEventKind::Deleted => {
                mtime_cache.lock().unwrap().remove(&relative_key);
            }
        }

        debug!("File event: {kind:?} - {relative_str}");

        Some(FileEvent {
            path: relative_str,
            kind,
        })
    }

    pub fn event_rx(&mut self) -> &mut mpsc::UnboundedReceiver<FileEvent> {
        &mut self.event_rx
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Whether a workspace-relative path is one the sync loop cares about.
fn is_watchable(relative: &str) -> bool {
    if relative.starts_with(".sync") || relative.contains("/.sync/") {
        return false;
    }
    if relative.starts_with('.') || relative.contains("/.") {
        return false;
    }
    relative.ends_with(".md")
}
