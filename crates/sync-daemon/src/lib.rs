//! sync-daemon library: Exposes internal modules for testing.
//!
//! This is a thin library layer over the daemon components, allowing
//! integration tests to access internal types.

pub mod native_fs;
pub mod watcher;

pub use native_fs::NativeFs;
pub use watcher::{FileEvent, FileEventKind, WorkspaceWatcher};
