//! Native workspace storage using tokio::fs.

use async_trait::async_trait;
use std::path::PathBuf;
use sync_core::fs::{DirEntry, FileStat, Result, StorageError, WorkspaceFs};
use tokio::fs;

/// Workspace storage rooted at a directory on the local disk.
pub struct NativeFs {
    root: PathBuf,
}

impl NativeFs {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn full_path(&self, path: &str) -> PathBuf {
        if path.is_empty() {
            self.root.clone()
        } else {
            self.root.join(path)
        }
    }

    fn map_io(path: &str, error: std::io::Error) -> StorageError {
        if error.kind() == std::io::ErrorKind::NotFound {
            StorageError::NotFound(path.to_string())
        } else {
            StorageError::Io(error.to_string())
        }
    }
}

#[async_trait]
impl WorkspaceFs for NativeFs {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let full = self.full_path(path);
        match fs::metadata(&full).await {
            Ok(meta) if meta.is_dir() => {
                return Err(StorageError::IsDirectory(path.to_string()));
            }
            Ok(_) => {}
            Err(e) => return Err(Self::map_io(path, e)),
        }
        fs::read(&full).await.map_err(|e| Self::map_io(path, e))
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        let full = self.full_path(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Self::map_io(path, e))?;
        }
        fs::write(&full, content)
            .await
            .map_err(|e| Self::map_io(path, e))
    }

    async fn list(&self, path: &str) -> Result<Vec<DirEntry>> {
        let full = self.full_path(path);
        let mut entries = Vec::new();

        let mut dir = fs::read_dir(&full).await.map_err(|e| Self::map_io(path, e))?;
        while let Some(entry) = dir.next_entry().await.map_err(|e| Self::map_io(path, e))? {
            let name = entry.file_name().to_string_lossy().to_string();
            let metadata = entry.metadata().await.map_err(|e| Self::map_io(path, e))?;
            entries.push(DirEntry {
                name,
                is_dir: metadata.is_dir(),
            });
        }

        Ok(entries)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full = self.full_path(path);
        let metadata = fs::metadata(&full).await.map_err(|e| Self::map_io(path, e))?;

        if metadata.is_dir() {
            fs::remove_dir(&full).await.map_err(|e| Self::map_io(path, e))
        } else {
            fs::remove_file(&full).await.map_err(|e| Self::map_io(path, e))
        }
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.full_path(path).exists())
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        let full = self.full_path(path);
        let metadata = fs::metadata(&full).await.map_err(|e| Self::map_io(path, e))?;

        let mtime_millis = metadata
            .modified()
            .map(|t| {
                t.duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or(0)
            })
            .unwrap_or(0);

        Ok(FileStat {
            mtime_millis,
            size: metadata.len(),
            is_dir: metadata.is_dir(),
        })
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let full = self.full_path(path);
        fs::create_dir_all(&full)
            .await
            .map_err(|e| Self::map_io(path, e))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let src = self.full_path(from);
        let dst = self.full_path(to);
        fs::rename(&src, &dst)
            .await
            .map_err(|e| Self::map_io(from, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_creates_parents_and_reads_back() {
        let dir = TempDir::new().unwrap();
        let fs = NativeFs::new(dir.path().to_path_buf());

        fs.write("deep/nested/note.md", b"hello").await.unwrap();

        assert_eq!(fs.read("deep/nested/note.md").await.unwrap(), b"hello");
        assert!(fs.exists("deep/nested").await.unwrap());
    }

    #[tokio::test]
    async fn test_read_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        let fs = NativeFs::new(dir.path().to_path_buf());

        assert!(matches!(
            fs.read("ghost.md").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_read_directory_is_typed_error() {
        let dir = TempDir::new().unwrap();
        let fs = NativeFs::new(dir.path().to_path_buf());

        fs.mkdir("folder").await.unwrap();

        assert!(matches!(
            fs.read("folder").await,
            Err(StorageError::IsDirectory(_))
        ));
    }

    #[tokio::test]
    async fn test_rename_replaces_destination() {
        let dir = TempDir::new().unwrap();
        let fs = NativeFs::new(dir.path().to_path_buf());

        fs.write(".sync/index.json.tmp", b"new").await.unwrap();
        fs.write(".sync/index.json", b"old").await.unwrap();

        fs.rename(".sync/index.json.tmp", ".sync/index.json")
            .await
            .unwrap();

        assert_eq!(fs.read(".sync/index.json").await.unwrap(), b"new");
        assert!(!fs.exists(".sync/index.json.tmp").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_reports_kinds() {
        let dir = TempDir::new().unwrap();
        let fs = NativeFs::new(dir.path().to_path_buf());

        fs.write("a.md", b"a").await.unwrap();
        fs.mkdir("sub").await.unwrap();

        let mut entries = fs.list("").await.unwrap();
        entries.sort_by(|x, y| x.name.cmp(&y.name));

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "a.md");
        assert!(!entries[0].is_dir);
        assert_eq!(entries[1].name, "sub");
        assert!(entries[1].is_dir);
    }

    #[tokio::test]
    async fn test_delete_file_and_missing() {
        let dir = TempDir::new().unwrap();
        let fs = NativeFs::new(dir.path().to_path_buf());

        fs.write("gone.md", b"x").await.unwrap();
        fs.delete("gone.md").await.unwrap();
        assert!(!fs.exists("gone.md").await.unwrap());

        assert!(matches!(
            fs.delete("gone.md").await,
            Err(StorageError::NotFound(_))
        ));
    }
}
