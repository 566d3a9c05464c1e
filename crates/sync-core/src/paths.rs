//! Workspace path handling.
//!
//! Sync state is keyed by workspace-relative paths with `/` separators and
//! a `.md` leaf. This module converts between those and host paths, turns
//! note titles into safe relative paths, and enforces the rules every
//! sync-bound path must satisfy before it becomes a remote object key.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::fs::WorkspaceFs;

/// Engine state directory inside the workspace. Never synced.
pub const SYNC_DIR: &str = ".sync";

const MAX_PATH_BYTES: usize = 1024;

/// Characters that are illegal in filenames on at least one supported
/// filesystem. `/` is the segment separator and handled separately.
const ILLEGAL_CHARS: &[char] = &['<', '>', ':', '"', '|', '?', '*', '\\'];

#[derive(Debug, Error)]
pub enum PathError {
    #[error("Invalid path: {0}")]
    Invalid(String),

    #[error("Path is outside the workspace: {0}")]
    OutsideWorkspace(String),

    #[error("Storage error: {0}")]
    Storage(#[from] crate::fs::StorageError),
}

pub type Result<T> = std::result::Result<T, PathError>;

/// Check that a relative path is acceptable as a sync key.
pub fn validate_sync_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(PathError::Invalid("Empty path not allowed".into()));
    }
    if path.contains("..") {
        return Err(PathError::Invalid("Path traversal not allowed".into()));
    }
    if path.contains("//") {
        return Err(PathError::Invalid("Empty path segment not allowed".into()));
    }
    if path.starts_with('/') {
        return Err(PathError::Invalid("Absolute path not allowed".into()));
    }
    if path.len() >= 2 && path.chars().nth(1) == Some(':') {
        return Err(PathError::Invalid(
            "Windows absolute path not allowed".into(),
        ));
    }
    if path.contains('\\') {
        return Err(PathError::Invalid("Backslash in path not allowed".into()));
    }
    if path.contains('\0') {
        return Err(PathError::Invalid("Null byte in path not allowed".into()));
    }
    if !path.ends_with(".md") {
        return Err(PathError::Invalid("Only markdown files allowed".into()));
    }
    if path.chars().any(|c| c.is_control()) {
        return Err(PathError::Invalid(
            "Control character in path not allowed".into(),
        ));
    }
    if path.len() > MAX_PATH_BYTES {
        return Err(PathError::Invalid("Path too long".into()));
    }
    Ok(())
}

/// The parent chain of a relative path, shallowest first.
/// `"a/b/c.md"` yields `["a", "a/b"]`.
pub fn parent_directories(relative: &str) -> Vec<String> {
    let mut parents = Vec::new();
    let mut prefix = String::new();
    let segments: Vec<&str> = relative.split('/').collect();
    for segment in &segments[..segments.len().saturating_sub(1)] {
        if !prefix.is_empty() {
            prefix.push('/');
        }
        prefix.push_str(segment);
        parents.push(prefix.clone());
    }
    parents
}

/// Turn a note title into a sync-safe relative path.
///
/// Slashes in the title create folders. Each segment loses characters that
/// are illegal on common filesystems, whitespace runs collapse to one
/// space, and leading/trailing dots and spaces are trimmed. Segments that
/// end up empty are dropped. The leaf always gets a `.md` extension.
pub fn sanitize_title(title: &str) -> Result<String> {
    let mut segments = Vec::new();
    for raw in title.split('/') {
        let segment = sanitize_segment(raw);
        if !segment.is_empty() {
            segments.push(segment);
        }
    }
    if segments.is_empty() {
        return Err(PathError::Invalid(
            "Title contains no usable characters".into(),
        ));
    }

    let mut path = segments.join("/");
    if !path.ends_with(".md") {
        path.push_str(".md");
    }
    validate_sync_path(&path)?;
    Ok(path)
}

fn sanitize_segment(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if ILLEGAL_CHARS.contains(&c) || c.is_control() {
                ' '
            } else {
                c
            }
        })
        .collect();

    // Collapse whitespace runs, then trim the dot/space decorations
    // Windows refuses at the edges of a name.
    let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.trim_matches(|c| c == '.' || c == ' ').to_string()
}

/// Maps between host paths and workspace-relative sync paths.
pub struct PathManager {
    root: PathBuf,
}

impl PathManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Workspace-relative form of a host path, with `/` separators.
    pub fn relative_path(&self, full: &Path) -> Result<String> {
        let stripped = full
            .strip_prefix(&self.root)
            .map_err(|_| PathError::OutsideWorkspace(full.display().to_string()))?;

        let mut parts = Vec::new();
        for component in stripped.components() {
            match component.as_os_str().to_str() {
                Some(s) => parts.push(s),
                None => {
                    return Err(PathError::Invalid(format!(
                        "Non-UTF-8 path: {}",
                        full.display()
                    )));
                }
            }
        }
        Ok(parts.join("/"))
    }

    /// Host path for a workspace-relative sync path.
    pub fn full_path(&self, relative: &str) -> PathBuf {
        let mut path = self.root.clone();
        for segment in relative.split('/') {
            path.push(segment);
        }
        path
    }

    /// Create every missing parent of `relative`, shallowest first.
    ///
    /// A create that fails is retried once after re-checking existence, so
    /// losing the race to a concurrent create stays an Ok path.
    pub async fn ensure_directory_exists<F: WorkspaceFs>(
        &self,
        fs: &F,
        relative: &str,
    ) -> Result<()> {
        for dir in parent_directories(relative) {
            if fs.exists(&dir).await? {
                continue;
            }
            if let Err(first) = fs.mkdir(&dir).await {
                if fs.exists(&dir).await? {
                    continue;
                }
                fs.mkdir(&dir).await.map_err(|_| PathError::Storage(first))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemoryFs;

    // ==================== validation tests ====================

    #[test]
    fn test_validate_accepts_normal_paths() {
        assert!(validate_sync_path("note.md").is_ok());
        assert!(validate_sync_path("folder/note.md").is_ok());
        assert!(validate_sync_path("a/b/c/deep note.md").is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_paths() {
        assert!(validate_sync_path("").is_err());
        assert!(validate_sync_path("../escape.md").is_err());
        assert!(validate_sync_path("a//b.md").is_err());
        assert!(validate_sync_path("/absolute.md").is_err());
        assert!(validate_sync_path("C:/windows.md").is_err());
        assert!(validate_sync_path("a\\b.md").is_err());
        assert!(validate_sync_path("nul\0byte.md").is_err());
        assert!(validate_sync_path("not-markdown.txt").is_err());
        assert!(validate_sync_path("bell\u{7}.md").is_err());
        assert!(validate_sync_path(&format!("{}.md", "x".repeat(1100))).is_err());
    }

    // ==================== title sanitization tests ====================

    #[test]
    fn test_sanitize_plain_title() {
        assert_eq!(sanitize_title("Meeting notes").unwrap(), "Meeting notes.md");
    }

    #[test]
    fn test_sanitize_keeps_md_extension() {
        assert_eq!(sanitize_title("notes.md").unwrap(), "notes.md");
    }

    #[test]
    fn test_sanitize_slashes_become_folders() {
        assert_eq!(
            sanitize_title("projects/inkstone/roadmap").unwrap(),
            "projects/inkstone/roadmap.md"
        );
    }

    #[test]
    fn test_sanitize_strips_illegal_characters() {
        assert_eq!(
            sanitize_title("draft: what now?").unwrap(),
            "draft what now.md"
        );
        assert_eq!(sanitize_title("a<b>c|d*e").unwrap(), "a b c d e.md");
    }

    #[test]
    fn test_sanitize_collapses_whitespace() {
        assert_eq!(sanitize_title("too   many\tspaces").unwrap(), "too many spaces.md");
    }

    #[test]
    fn test_sanitize_trims_dot_segments() {
        // ".." trims to nothing and is dropped, so no traversal survives
        assert_eq!(sanitize_title("../secrets").unwrap(), "secrets.md");
        assert_eq!(sanitize_title("ok./.hidden").unwrap(), "ok/hidden.md");
    }

    #[test]
    fn test_sanitize_rejects_unusable_title() {
        assert!(sanitize_title("").is_err());
        assert!(sanitize_title("???").is_err());
        assert!(sanitize_title("///").is_err());
    }

    // ==================== mapping tests ====================

    #[test]
    fn test_relative_and_full_roundtrip() {
        let pm = PathManager::new("/workspace");

        let full = pm.full_path("notes/today.md");
        assert_eq!(full, PathBuf::from("/workspace/notes/today.md"));
        assert_eq!(pm.relative_path(&full).unwrap(), "notes/today.md");
    }

    #[test]
    fn test_sanitized_title_survives_mapping_roundtrip() {
        let pm = PathManager::new("/workspace");

        let relative = sanitize_title("java/spring boot").unwrap();
        assert_eq!(relative, "java/spring boot.md");
        assert_eq!(pm.relative_path(&pm.full_path(&relative)).unwrap(), relative);
        validate_sync_path(&relative).unwrap();
    }

    #[test]
    fn test_relative_path_outside_root_rejected() {
        let pm = PathManager::new("/workspace");
        assert!(matches!(
            pm.relative_path(Path::new("/elsewhere/note.md")),
            Err(PathError::OutsideWorkspace(_))
        ));
    }

    #[test]
    fn test_parent_directories() {
        assert_eq!(parent_directories("note.md"), Vec::<String>::new());
        assert_eq!(parent_directories("a/note.md"), vec!["a"]);
        assert_eq!(parent_directories("a/b/c/note.md"), vec!["a", "a/b", "a/b/c"]);
    }

    #[tokio::test]
    async fn test_ensure_directory_exists_creates_chain() {
        let fs = MemoryFs::new();
        let pm = PathManager::new("/workspace");

        pm.ensure_directory_exists(&fs, "a/b/c/note.md").await.unwrap();

        assert!(fs.exists("a").await.unwrap());
        assert!(fs.exists("a/b").await.unwrap());
        assert!(fs.exists("a/b/c").await.unwrap());

        // Idempotent on the second pass
        pm.ensure_directory_exists(&fs, "a/b/c/note.md").await.unwrap();
    }
}
