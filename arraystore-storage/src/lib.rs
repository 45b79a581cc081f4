//! Backend-agnostic storage access for the array store.
//!
//! A [`StorageOperator`] performs primitive path operations against local disk, object storage
//! (`s3://bucket/key`) and HTTP (`http(s)://...`). Every multi-path operation accepts a
//! heterogeneous list, fans out once per backend and returns per-path results in input order.

use bytes::Bytes;
use indexmap::IndexMap;

pub mod backend;
pub mod content;
pub mod error;
pub mod http;
pub mod local;
pub mod object;
pub mod operator;
pub mod options;
pub mod scratch;

#[cfg(test)]
pub(crate) mod test_util;

pub use backend::{classify, BackendKind, BackendPartition};
pub use content::{Content, ReadMode};
pub use error::{StorageError, StorageResult};
pub use operator::StorageOperator;
pub use options::StorageOptions;

/// JSON attributes stored in a resource's sidecar.
pub type Attributes = serde_json::Map<String, serde_json::Value>;

/// Name of the attribute sidecar of arrays, groups and lock objects.
pub const ATTRIBUTES_KEY: &str = ".zattrs";

/// Joins a child name onto a resource identifier using `/`.
pub fn join_path(base: &str, name: &str) -> String {
    if base.is_empty() {
        name.to_string()
    } else if base.ends_with('/') {
        format!("{base}{name}")
    } else {
        format!("{base}/{name}")
    }
}

/// Single-path primitives implemented once per backend.
#[async_trait::async_trait]
pub trait StorageBackend: Send + Sync {
    async fn exists(&self, path: &str) -> StorageResult<bool>;
    async fn read(&self, path: &str) -> StorageResult<Bytes>;
    async fn write(&self, path: &str, data: Bytes) -> StorageResult<()>;
    /// Fails with [`StorageError::AlreadyExists`] when `path` is present.
    async fn create_exclusive(&self, path: &str, data: Bytes) -> StorageResult<()>;
    async fn remove(&self, path: &str, recursive: bool) -> StorageResult<()>;
    async fn list_dir(&self, path: &str) -> StorageResult<Vec<String>>;
    async fn make_dir(&self, path: &str) -> StorageResult<()>;
    async fn copy(&self, from: &str, to: &str) -> StorageResult<()>;
    async fn rename(&self, from: &str, to: &str) -> StorageResult<()>;
}

/// The operation set shared by in-process operators and worker proxies.
///
/// Batch methods return one slot per input, in input order; a failing path never affects its
/// siblings.
#[async_trait::async_trait]
pub trait StorageOperations: Send + Sync + std::fmt::Debug {
    async fn exists(&self, paths: Vec<String>) -> Vec<StorageResult<bool>>;
    async fn read(&self, paths: Vec<String>, mode: ReadMode) -> Vec<StorageResult<Content>>;
    async fn write(&self, entries: IndexMap<String, Content>) -> Vec<StorageResult<()>>;
    async fn remove(&self, paths: Vec<String>, recursive: bool) -> Vec<StorageResult<()>>;
    async fn make_dirs(&self, paths: Vec<String>) -> Vec<StorageResult<()>>;
    async fn copy(&self, pairs: Vec<(String, String)>) -> Vec<StorageResult<()>>;
    async fn rename(&self, pairs: Vec<(String, String)>) -> Vec<StorageResult<()>>;
    async fn list_dir(&self, path: &str) -> StorageResult<Vec<String>>;
    async fn get_metadata(&self, path: &str) -> StorageResult<Attributes>;
    async fn set_metadata(&self, path: &str, attributes: Attributes) -> StorageResult<()>;
    async fn create_exclusive(&self, path: &str, content: Content) -> StorageResult<()>;

    async fn exists_one(&self, path: &str) -> StorageResult<bool> {
        single(path, self.exists(vec![path.to_string()]).await)
    }

    async fn read_one(&self, path: &str, mode: ReadMode) -> StorageResult<Content> {
        single(path, self.read(vec![path.to_string()], mode).await)
    }

    async fn write_one(&self, path: &str, content: Content) -> StorageResult<()> {
        let mut entries = IndexMap::new();
        entries.insert(path.to_string(), content);
        single(path, self.write(entries).await)
    }

    async fn remove_one(&self, path: &str, recursive: bool) -> StorageResult<()> {
        single(path, self.remove(vec![path.to_string()], recursive).await)
    }
}

fn single<T>(path: &str, mut results: Vec<StorageResult<T>>) -> StorageResult<T> {
    results
        .pop()
        .unwrap_or_else(|| Err(StorageError::protocol(path, "empty batch result")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_paths() {
        assert_eq!(join_path("a/b", ".zattrs"), "a/b/.zattrs");
        assert_eq!(
            join_path("s3://bucket/lock/", ".zattrs"),
            "s3://bucket/lock/.zattrs"
        );
        assert_eq!(join_path("", "0.0"), "0.0");
    }
}
