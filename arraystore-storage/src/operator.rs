use std::{future::Future, sync::Arc, time::Duration};

use futures::StreamExt;
use indexmap::IndexMap;
use object_store::ObjectStore;

use crate::{
    backend::{classify, BackendKind, BackendPartition},
    content::{Content, ReadMode},
    error::{StorageError, StorageResult},
    http::HttpBackend,
    join_path,
    local::LocalBackend,
    object::ObjectBackend,
    options::StorageOptions,
    scratch::ScratchDir,
    Attributes, StorageBackend, StorageOperations, ATTRIBUTES_KEY,
};

/// Performs path operations against all three backends.
///
/// One operator lives per process (or per pool worker). It owns a private scratch directory used
/// to stage object-storage uploads, removed again when the operator is dropped.
pub struct StorageOperator {
    local: LocalBackend,
    object: ObjectBackend,
    http: HttpBackend,
    batch_concurrency: usize,
    scratch: ScratchDir,
}

impl std::fmt::Debug for StorageOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageOperator")
            .field("scratch", &self.scratch.path())
            .field("object", &self.object)
            .field("batch_concurrency", &self.batch_concurrency)
            .finish()
    }
}

impl StorageOperator {
    pub fn new(options: StorageOptions) -> StorageResult<Self> {
        let scratch = ScratchDir::create(&options.scratch_root)
            .map_err(|e| StorageError::from_io(options.scratch_root.to_string_lossy(), e))?;
        let http = HttpBackend::new(Duration::from_millis(options.http_timeout_ms))?;
        let object = ObjectBackend::new(options.credentials, scratch.path().to_path_buf());

        tracing::debug!(scratch = %scratch.path().display(), "storage operator created");
        Ok(Self {
            local: LocalBackend,
            object,
            http,
            batch_concurrency: options.batch_concurrency.max(1),
            scratch,
        })
    }

    pub fn scratch(&self) -> &ScratchDir {
        &self.scratch
    }

    /// Serves `s3://<bucket>/...` identifiers from `store`.
    pub fn register_object_store(&self, bucket: impl Into<String>, store: Arc<dyn ObjectStore>) {
        self.object.register(bucket, store);
    }

    /// Tears the operator down, removing its scratch directory.
    pub fn close(self) -> std::io::Result<()> {
        self.scratch.close()
    }

    fn backend(&self, kind: BackendKind) -> &dyn StorageBackend {
        match kind {
            BackendKind::Local => &self.local,
            BackendKind::ObjectStorage => &self.object,
            BackendKind::Http => &self.http,
        }
    }

    /// Runs `op` for every item: one concurrent group per backend, bounded concurrency inside a
    /// group. Returns when every item finished, results in input order.
    async fn fan_out<I, T, F, Fut>(
        &self,
        items: Vec<I>,
        route: impl Fn(&I) -> &str,
        op: F,
    ) -> Vec<StorageResult<T>>
    where
        F: Fn(BackendKind, I) -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        let partition = BackendPartition::from_ids(items.iter().map(&route));
        let total = items.len();
        let mut pending: Vec<Option<I>> = items.into_iter().map(Some).collect();
        let concurrency = self.batch_concurrency;
        let op = &op;

        let groups: Vec<_> = partition
            .groups()
            .map(|(kind, indexes)| {
                let work: Vec<(usize, I)> = indexes
                    .iter()
                    .filter_map(|&index| pending[index].take().map(|item| (index, item)))
                    .collect();
                async move {
                    tracing::trace!(backend = %kind, paths = work.len(), "running batch group");
                    futures::stream::iter(work)
                        .map(move |(index, item)| async move { (index, op(kind, item).await) })
                        .buffer_unordered(concurrency)
                        .collect::<Vec<_>>()
                        .await
                }
            })
            .collect();

        let mut slots: Vec<Option<StorageResult<T>>> = (0..total).map(|_| None).collect();
        for group in futures::future::join_all(groups).await {
            for (index, result) in group {
                slots[index] = Some(result);
            }
        }
        slots.into_iter().flatten().collect()
    }

    async fn transfer(&self, from: &str, to: &str, remove_source: bool) -> StorageResult<()> {
        let (source, target) = (classify(from), classify(to));
        if source == target {
            return if remove_source {
                self.backend(source).rename(from, to).await
            } else {
                self.backend(source).copy(from, to).await
            };
        }

        // Across backends only single resources move, as one read and one write.
        let data = self.backend(source).read(from).await?;
        self.backend(target).write(to, data).await?;
        if remove_source {
            self.backend(source).remove(from, false).await?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl StorageOperations for StorageOperator {
    async fn exists(&self, paths: Vec<String>) -> Vec<StorageResult<bool>> {
        self.fan_out(paths, |path| path.as_str(), |kind, path| async move {
            self.backend(kind).exists(&path).await
        })
        .await
    }

    async fn read(&self, paths: Vec<String>, mode: ReadMode) -> Vec<StorageResult<Content>> {
        self.fan_out(paths, |path| path.as_str(), |kind, path| async move {
            let raw = self.backend(kind).read(&path).await?;
            Content::decode(&path, raw, mode)
        })
        .await
    }

    async fn write(&self, entries: IndexMap<String, Content>) -> Vec<StorageResult<()>> {
        let entries: Vec<(String, Content)> = entries.into_iter().collect();
        self.fan_out(
            entries,
            |(path, _)| path.as_str(),
            |kind, (path, content)| async move {
                self.backend(kind).write(&path, content.into_bytes()).await
            },
        )
        .await
    }

    async fn remove(&self, paths: Vec<String>, recursive: bool) -> Vec<StorageResult<()>> {
        self.fan_out(paths, |path| path.as_str(), |kind, path| async move {
            self.backend(kind).remove(&path, recursive).await
        })
        .await
    }

    async fn make_dirs(&self, paths: Vec<String>) -> Vec<StorageResult<()>> {
        self.fan_out(paths, |path| path.as_str(), |kind, path| async move {
            self.backend(kind).make_dir(&path).await
        })
        .await
    }

    async fn copy(&self, pairs: Vec<(String, String)>) -> Vec<StorageResult<()>> {
        self.fan_out(
            pairs,
            |(from, _)| from.as_str(),
            |_, (from, to)| async move { self.transfer(&from, &to, false).await },
        )
        .await
    }

    async fn rename(&self, pairs: Vec<(String, String)>) -> Vec<StorageResult<()>> {
        self.fan_out(
            pairs,
            |(from, _)| from.as_str(),
            |_, (from, to)| async move { self.transfer(&from, &to, true).await },
        )
        .await
    }

    async fn list_dir(&self, path: &str) -> StorageResult<Vec<String>> {
        self.backend(classify(path)).list_dir(path).await
    }

    async fn get_metadata(&self, path: &str) -> StorageResult<Attributes> {
        let sidecar = join_path(path, ATTRIBUTES_KEY);
        let raw = self.backend(classify(&sidecar)).read(&sidecar).await?;
        serde_json::from_slice(&raw)
            .map_err(|e| StorageError::protocol(sidecar, format!("invalid attributes: {e}")))
    }

    async fn set_metadata(&self, path: &str, attributes: Attributes) -> StorageResult<()> {
        let sidecar = join_path(path, ATTRIBUTES_KEY);
        let data = serde_json::to_vec_pretty(&attributes)
            .map_err(|e| StorageError::protocol(&sidecar, e.to_string()))?;
        self.backend(classify(&sidecar))
            .write(&sidecar, data.into())
            .await
    }

    async fn create_exclusive(&self, path: &str, content: Content) -> StorageResult<()> {
        self.backend(classify(path))
            .create_exclusive(path, content.into_bytes())
            .await
    }
}
