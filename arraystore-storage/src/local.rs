use std::{
    future::Future,
    path::{Path, PathBuf},
};

use bytes::Bytes;
use tokio::io::AsyncWriteExt;

use crate::{
    error::{StorageError, StorageResult},
    StorageBackend,
};

/// Plain filesystem access. Stateless.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalBackend;

async fn ensure_parent(path: &str) -> StorageResult<()> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::from_io(path, e))?;
        }
    }
    Ok(())
}

async fn copy_dir_recursive(from: &Path, to: &Path) -> std::io::Result<()> {
    let mut pending: Vec<(PathBuf, PathBuf)> = vec![(from.to_path_buf(), to.to_path_buf())];
    while let Some((src, dst)) = pending.pop() {
        tokio::fs::create_dir_all(&dst).await?;
        let mut entries = tokio::fs::read_dir(&src).await?;
        while let Some(entry) = entries.next_entry().await? {
            let target = dst.join(entry.file_name());
            if entry.file_type().await?.is_dir() {
                pending.push((entry.path(), target));
            } else {
                tokio::fs::copy(entry.path(), &target).await?;
            }
        }
    }
    Ok(())
}

/// Creates `path`, failing if it exists, and hands the file to `fill`. A failed fill removes the
/// file again so no partial record blocks later creates.
async fn create_new_with<F, Fut>(path: &str, fill: F) -> StorageResult<()>
where
    F: FnOnce(tokio::fs::File) -> Fut,
    Fut: Future<Output = std::io::Result<()>>,
{
    ensure_parent(path).await?;
    let file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
        .map_err(|e| StorageError::from_io(path, e))?;
    if let Err(e) = fill(file).await {
        if let Err(cleanup) = tokio::fs::remove_file(path).await {
            tracing::warn!(path, error = %cleanup, "failed to remove partial file");
        }
        return Err(StorageError::from_io(path, e));
    }
    Ok(())
}

#[async_trait::async_trait]
impl StorageBackend for LocalBackend {
    async fn exists(&self, path: &str) -> StorageResult<bool> {
        tokio::fs::try_exists(path)
            .await
            .map_err(|e| StorageError::from_io(path, e))
    }

    async fn read(&self, path: &str) -> StorageResult<Bytes> {
        tokio::fs::read(path)
            .await
            .map(Bytes::from)
            .map_err(|e| StorageError::from_io(path, e))
    }

    async fn write(&self, path: &str, data: Bytes) -> StorageResult<()> {
        ensure_parent(path).await?;
        tokio::fs::write(path, &data)
            .await
            .map_err(|e| StorageError::from_io(path, e))
    }

    async fn create_exclusive(&self, path: &str, data: Bytes) -> StorageResult<()> {
        create_new_with(path, |mut file| async move {
            file.write_all(&data).await?;
            file.sync_all().await
        })
        .await
    }

    async fn remove(&self, path: &str, recursive: bool) -> StorageResult<()> {
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| StorageError::from_io(path, e))?;
        let result = if meta.is_dir() {
            if recursive {
                tokio::fs::remove_dir_all(path).await
            } else {
                tokio::fs::remove_dir(path).await
            }
        } else {
            tokio::fs::remove_file(path).await
        };
        result.map_err(|e| StorageError::from_io(path, e))
    }

    async fn list_dir(&self, path: &str) -> StorageResult<Vec<String>> {
        let mut entries = tokio::fs::read_dir(path)
            .await
            .map_err(|e| StorageError::from_io(path, e))?;
        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::from_io(path, e))?
        {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    async fn make_dir(&self, path: &str) -> StorageResult<()> {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| StorageError::from_io(path, e))
    }

    async fn copy(&self, from: &str, to: &str) -> StorageResult<()> {
        let meta = tokio::fs::metadata(from)
            .await
            .map_err(|e| StorageError::from_io(from, e))?;
        if meta.is_dir() {
            copy_dir_recursive(Path::new(from), Path::new(to))
                .await
                .map_err(|e| StorageError::from_io(to, e))
        } else {
            ensure_parent(to).await?;
            tokio::fs::copy(from, to)
                .await
                .map(|_| ())
                .map_err(|e| StorageError::from_io(to, e))
        }
    }

    async fn rename(&self, from: &str, to: &str) -> StorageResult<()> {
        ensure_parent(to).await?;
        match tokio::fs::rename(from, to).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StorageError::NotFound {
                path: from.to_string(),
            }),
            Err(e) => {
                // Renames across filesystems fail; fall back to copy and delete.
                tracing::debug!(from, to, error = %e, "rename failed, copying instead");
                self.copy(from, to).await?;
                self.remove(from, true).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(dir: &tempfile::TempDir, name: &str) -> String {
        dir.path().join(name).to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn failed_exclusive_create_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = p(&dir, "lock/.zattrs");

        let err = create_new_with(&path, |mut file| async move {
            file.write_all(b"{\"str_uuid").await?;
            Err(std::io::Error::other("disk full"))
        })
        .await
        .unwrap_err();
        assert!(!matches!(err, StorageError::AlreadyExists { .. }));
        assert!(!Path::new(&path).exists());

        LocalBackend
            .create_exclusive(&path, Bytes::from_static(b"whole"))
            .await
            .unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"whole");
    }

    #[tokio::test]
    async fn exclusive_create_collides() {
        let dir = tempfile::tempdir().unwrap();
        let path = p(&dir, "lock/.zattrs");
        let backend = LocalBackend;

        backend
            .create_exclusive(&path, Bytes::from_static(b"first"))
            .await
            .unwrap();
        let err = backend
            .create_exclusive(&path, Bytes::from_static(b"second"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists { .. }));
        assert_eq!(
            backend.read(&path).await.unwrap(),
            Bytes::from_static(b"first")
        );
    }

    #[tokio::test]
    async fn remove_distinguishes_directories() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend;
        backend
            .write(&p(&dir, "tree/a/b.bin"), Bytes::from_static(b"x"))
            .await
            .unwrap();

        assert!(backend.remove(&p(&dir, "tree"), false).await.is_err());
        backend.remove(&p(&dir, "tree"), true).await.unwrap();
        assert!(!backend.exists(&p(&dir, "tree")).await.unwrap());

        let err = backend.remove(&p(&dir, "tree"), true).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn copy_and_rename_directories() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend;
        backend
            .write(&p(&dir, "src/x/1"), Bytes::from_static(b"one"))
            .await
            .unwrap();
        backend
            .write(&p(&dir, "src/2"), Bytes::from_static(b"two"))
            .await
            .unwrap();

        backend.copy(&p(&dir, "src"), &p(&dir, "copy")).await.unwrap();
        assert_eq!(
            backend.read(&p(&dir, "copy/x/1")).await.unwrap(),
            Bytes::from_static(b"one")
        );
        assert_eq!(
            backend.list_dir(&p(&dir, "copy")).await.unwrap(),
            vec!["2", "x"]
        );

        backend
            .rename(&p(&dir, "copy"), &p(&dir, "moved/here"))
            .await
            .unwrap();
        assert!(!backend.exists(&p(&dir, "copy")).await.unwrap());
        assert_eq!(
            backend.read(&p(&dir, "moved/here/2")).await.unwrap(),
            Bytes::from_static(b"two")
        );

        let err = backend
            .rename(&p(&dir, "missing"), &p(&dir, "other"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
