//! Workspace storage abstraction.
//!
//! The engine never touches `std::fs` directly; everything goes through
//! `WorkspaceFs` so hosts can plug in their own storage:
//! - `MemoryFs` - for tests
//! - `NativeFs` (in sync-daemon) - tokio::fs against a workspace root
//!
//! Paths are always workspace-relative, `/`-separated strings.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Is a directory: {0}")]
    IsDirectory(String),

    #[error("IO error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// File metadata.
#[derive(Debug, Clone)]
pub struct FileStat {
    /// Modification time in milliseconds since epoch
    pub mtime_millis: u64,
    /// File size in bytes
    pub size: u64,
    /// Whether this is a directory
    pub is_dir: bool,
}

/// Directory entry.
#[derive(Debug, Clone)]
pub struct DirEntry {
    /// File or directory name (not full path)
    pub name: String,
    /// Whether this is a directory
    pub is_dir: bool,
}

/// Storage operations the sync engine needs from its host.
///
/// Implementations must be `Send + Sync`; the engine shares one instance
/// across the cycle task and the host's event handlers.
#[async_trait]
pub trait WorkspaceFs: Send + Sync {
    /// Read file contents
    async fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Write file contents (creates parent directories if needed)
    async fn write(&self, path: &str, content: &[u8]) -> Result<()>;

    /// List directory contents
    async fn list(&self, path: &str) -> Result<Vec<DirEntry>>;

    /// Delete file or empty directory
    async fn delete(&self, path: &str) -> Result<()>;

    /// Check if path exists
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Get file metadata
    async fn stat(&self, path: &str) -> Result<FileStat>;

    /// Create directory (and parents if needed)
    async fn mkdir(&self, path: &str) -> Result<()>;

    /// Atomically replace `to` with `from`. Used for crash-safe index commits.
    async fn rename(&self, from: &str, to: &str) -> Result<()>;
}

/// In-memory storage for tests.
pub struct MemoryFs {
    files: RwLock<HashMap<String, Vec<u8>>>,
    dirs: RwLock<HashMap<String, ()>>,
    mtimes: RwLock<HashMap<String, u64>>,
}

impl MemoryFs {
    pub fn new() -> Self {
        let mut dirs = HashMap::new();
        dirs.insert(String::new(), ()); // Root directory
        Self {
            files: RwLock::new(HashMap::new()),
            dirs: RwLock::new(dirs),
            mtimes: RwLock::new(HashMap::new()),
        }
    }

    /// Set a specific mtime for testing ordering-sensitive scenarios.
    pub fn set_mtime(&self, path: &str, mtime: u64) {
        let path = Self::normalize(path);
        self.mtimes.write().unwrap().insert(path, mtime);
    }

    fn now_millis() -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64
    }

    fn normalize(path: &str) -> String {
        path.trim_matches('/').to_string()
    }

    fn parent(path: &str) -> Option<String> {
        let normalized = Self::normalize(path);
        if normalized.is_empty() {
            None
        } else {
            match normalized.rfind('/') {
                Some(pos) => Some(normalized[..pos].to_string()),
                None => Some(String::new()),
            }
        }
    }
}

impl Default for MemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkspaceFs for MemoryFs {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let path = Self::normalize(path);
        let files = self.files.read().unwrap();
        files
            .get(&path)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(path))
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        let path = Self::normalize(path);

        if let Some(parent) = Self::parent(&path) {
            self.mkdir(&parent).await?;
        }

        self.files
            .write()
            .unwrap()
            .insert(path.clone(), content.to_vec());
        self.mtimes.write().unwrap().insert(path, Self::now_millis());
        Ok(())
    }

    async fn list(&self, path: &str) -> Result<Vec<DirEntry>> {
        let path = Self::normalize(path);
        let prefix = if path.is_empty() {
            String::new()
        } else {
            format!("{}/", path)
        };

        let dirs = self.dirs.read().unwrap();
        if !path.is_empty() && !dirs.contains_key(&path) {
            return Err(StorageError::NotFound(path));
        }

        let mut entries = Vec::new();
        let mut seen = std::collections::HashSet::new();

        let files = self.files.read().unwrap();
        for file_path in files.keys() {
            if let Some(rest) = file_path.strip_prefix(&prefix) {
                if !rest.is_empty() && !rest.contains('/') && seen.insert(rest.to_string()) {
                    entries.push(DirEntry {
                        name: rest.to_string(),
                        is_dir: false,
                    });
                }
            }
        }

        for dir_path in dirs.keys() {
            if let Some(rest) = dir_path.strip_prefix(&prefix) {
                let name = rest.split('/').next().unwrap();
                if !name.is_empty() && seen.insert(name.to_string()) {
                    entries.push(DirEntry {
                        name: name.to_string(),
                        is_dir: true,
                    });
                }
            }
        }

        Ok(entries)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let path = Self::normalize(path);

        {
            let mut files = self.files.write().unwrap();
            if files.remove(&path).is_some() {
                self.mtimes.write().unwrap().remove(&path);
                return Ok(());
            }
        }

        {
            let mut dirs = self.dirs.write().unwrap();
            if dirs.remove(&path).is_some() {
                return Ok(());
            }
        }

        Err(StorageError::NotFound(path))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let path = Self::normalize(path);
        let files = self.files.read().unwrap();
        let dirs = self.dirs.read().unwrap();
        Ok(files.contains_key(&path) || dirs.contains_key(&path))
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        let path = Self::normalize(path);

        let files = self.files.read().unwrap();
        if let Some(content) = files.get(&path) {
            let mtimes = self.mtimes.read().unwrap();
            let mtime = mtimes.get(&path).copied().unwrap_or(0);
            return Ok(FileStat {
                mtime_millis: mtime,
                size: content.len() as u64,
                is_dir: false,
            });
        }

        let dirs = self.dirs.read().unwrap();
        if dirs.contains_key(&path) {
            return Ok(FileStat {
                mtime_millis: 0,
                size: 0,
                is_dir: true,
            });
        }

        Err(StorageError::NotFound(path))
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let path = Self::normalize(path);
        if path.is_empty() {
            return Ok(()); // Root always exists
        }

        if let Some(parent) = Self::parent(&path) {
            Box::pin(self.mkdir(&parent)).await?;
        }

        self.dirs.write().unwrap().insert(path, ());
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from = Self::normalize(from);
        let to = Self::normalize(to);

        let content = {
            let mut files = self.files.write().unwrap();
            files
                .remove(&from)
                .ok_or_else(|| StorageError::NotFound(from.clone()))?
        };

        if let Some(parent) = Self::parent(&to) {
            self.mkdir(&parent).await?;
        }

        self.files.write().unwrap().insert(to.clone(), content);
        let mut mtimes = self.mtimes.write().unwrap();
        let mtime = mtimes.remove(&from).unwrap_or_else(Self::now_millis);
        mtimes.insert(to, mtime);
        Ok(())
    }
}

// Blanket impl so one storage instance can be shared between components
// (engine + database + tests) behind an Arc.
#[async_trait]
impl<T: WorkspaceFs + Send + Sync> WorkspaceFs for std::sync::Arc<T> {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        (**self).read(path).await
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        (**self).write(path, content).await
    }

    async fn list(&self, path: &str) -> Result<Vec<DirEntry>> {
        (**self).list(path).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        (**self).delete(path).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        (**self).exists(path).await
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        (**self).stat(path).await
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        (**self).mkdir(path).await
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        (**self).rename(from, to).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_fs_basic_operations() {
        let fs = MemoryFs::new();

        fs.write("note.md", b"hello world").await.unwrap();

        let content = fs.read("note.md").await.unwrap();
        assert_eq!(content, b"hello world");

        assert!(fs.exists("note.md").await.unwrap());
        assert!(!fs.exists("missing.md").await.unwrap());

        fs.delete("note.md").await.unwrap();
        assert!(!fs.exists("note.md").await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_fs_nested_write_creates_parents() {
        let fs = MemoryFs::new();

        fs.write("a/b/c.md", b"content").await.unwrap();

        assert!(fs.exists("a").await.unwrap());
        assert!(fs.exists("a/b").await.unwrap());

        let entries = fs.list("a").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "b");
        assert!(entries[0].is_dir);

        let entries = fs.list("a/b").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "c.md");
        assert!(!entries[0].is_dir);
    }

    #[tokio::test]
    async fn test_memory_fs_rename_replaces_target() {
        let fs = MemoryFs::new();

        fs.write("index.json.tmp", b"new").await.unwrap();
        fs.write("index.json", b"old").await.unwrap();

        fs.rename("index.json.tmp", "index.json").await.unwrap();

        assert_eq!(fs.read("index.json").await.unwrap(), b"new");
        assert!(!fs.exists("index.json.tmp").await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_fs_stat_reports_size() {
        let fs = MemoryFs::new();
        fs.write("n.md", b"12345").await.unwrap();

        let stat = fs.stat("n.md").await.unwrap();
        assert_eq!(stat.size, 5);
        assert!(!stat.is_dir);
    }
}
