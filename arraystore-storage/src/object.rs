//! Object-storage backend on top of `object_store`.
//!
//! Identifiers look like `s3://bucket/key`. One client is built per bucket on first use from the
//! caller-supplied options and cached for the operator's lifetime. Directory-like resources are
//! key prefixes: existence, removal, copy and rename of a prefix act on every key below it.

use std::{collections::HashMap, path::PathBuf, sync::Arc};

use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use object_store::{
    aws::{AmazonS3Builder, AmazonS3ConfigKey},
    path::Path,
    ObjectStore, PutMode, PutPayload,
};
use tokio::io::AsyncReadExt;

use crate::{
    backend::OBJECT_STORAGE_SCHEME,
    error::{StorageError, StorageResult},
    scratch::stage_path,
    StorageBackend,
};

const STREAM_CHUNK_SIZE: usize = 8 * 1024 * 1024; // 8 MiB

pub struct ObjectBackend {
    options: HashMap<String, String>,
    stores: parking_lot::Mutex<HashMap<String, Arc<dyn ObjectStore>>>,
    staging_dir: PathBuf,
}

impl std::fmt::Debug for ObjectBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Options hold credentials; only the keys are shown.
        f.debug_struct("ObjectBackend")
            .field("options", &self.options.keys().collect::<Vec<_>>())
            .field("buckets", &self.stores.lock().keys().cloned().collect::<Vec<_>>())
            .finish()
    }
}

/// Splits `s3://bucket/key` into the bucket name and the object path.
pub fn parse_object_url(url: &str) -> StorageResult<(String, Path)> {
    let rest = url
        .strip_prefix(OBJECT_STORAGE_SCHEME)
        .ok_or_else(|| StorageError::protocol(url, "not an object-storage identifier"))?;
    let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
    if bucket.is_empty() {
        return Err(StorageError::protocol(url, "missing bucket name"));
    }
    Ok((bucket.to_string(), Path::from(key)))
}

impl ObjectBackend {
    pub fn new(options: HashMap<String, String>, staging_dir: PathBuf) -> Self {
        Self {
            options,
            stores: parking_lot::Mutex::new(HashMap::new()),
            staging_dir,
        }
    }

    /// Uses `store` for every identifier in `bucket` instead of building a client for it.
    pub fn register(&self, bucket: impl Into<String>, store: Arc<dyn ObjectStore>) {
        self.stores.lock().insert(bucket.into(), store);
    }

    fn resolve(&self, url: &str) -> StorageResult<(Arc<dyn ObjectStore>, Path)> {
        let (bucket, location) = parse_object_url(url)?;
        if let Some(store) = self.stores.lock().get(&bucket) {
            return Ok((store.clone(), location));
        }

        tracing::debug!(bucket, "building object store client");
        let mut builder = AmazonS3Builder::from_env().with_bucket_name(&bucket);
        for (key, value) in &self.options {
            let config_key: AmazonS3ConfigKey = key.parse().map_err(|e| {
                StorageError::protocol(url, format!("invalid option {key}: {e}"))
            })?;
            builder = builder.with_config(config_key, value);
        }
        let store: Arc<dyn ObjectStore> = Arc::new(
            builder
                .build()
                .map_err(|e| StorageError::from_object_store(url, e))?,
        );

        let store = self
            .stores
            .lock()
            .entry(bucket)
            .or_insert(store)
            .clone();
        Ok((store, location))
    }

    /// Every key at or below `location`, the key itself first when it exists.
    async fn keys_under(
        store: &Arc<dyn ObjectStore>,
        url: &str,
        location: &Path,
    ) -> StorageResult<Vec<Path>> {
        let mut keys = Vec::new();
        match store.head(location).await {
            Ok(_) => keys.push(location.clone()),
            Err(object_store::Error::NotFound { .. }) => {}
            Err(e) => return Err(StorageError::from_object_store(url, e)),
        }
        let children: Vec<Path> = store
            .list(Some(location))
            .map_ok(|meta| meta.location)
            .try_collect()
            .await
            .map_err(|e| StorageError::from_object_store(url, e))?;
        keys.extend(children.into_iter().filter(|key| key != location));
        Ok(keys)
    }

    /// Maps a key under `from` to the same relative key under `to`.
    fn relocate(key: &Path, from: &Path, to: &Path) -> Path {
        match key.prefix_match(from) {
            Some(parts) => parts.fold(to.clone(), |acc, part| acc.child(part)),
            None => to.clone(),
        }
    }

    async fn upload_staged(
        store: &Arc<dyn ObjectStore>,
        url: &str,
        location: &Path,
        staged: &std::path::Path,
    ) -> StorageResult<()> {
        let staged_name = staged.to_string_lossy().into_owned();
        let mut file = tokio::fs::File::open(staged)
            .await
            .map_err(|e| StorageError::from_io(&staged_name, e))?;
        let size = file
            .metadata()
            .await
            .map_err(|e| StorageError::from_io(&staged_name, e))?
            .len() as usize;

        if size <= STREAM_CHUNK_SIZE {
            let mut data = Vec::with_capacity(size);
            file.read_to_end(&mut data)
                .await
                .map_err(|e| StorageError::from_io(&staged_name, e))?;
            store
                .put(location, PutPayload::from(data))
                .await
                .map_err(|e| StorageError::from_object_store(url, e))?;
            return Ok(());
        }

        let mut upload = store
            .put_multipart(location)
            .await
            .map_err(|e| StorageError::from_object_store(url, e))?;
        let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
        loop {
            // Parts other than the last must be full sized.
            let mut filled = 0;
            while filled < buf.len() {
                let read = file
                    .read(&mut buf[filled..])
                    .await
                    .map_err(|e| StorageError::from_io(&staged_name, e))?;
                if read == 0 {
                    break;
                }
                filled += read;
            }
            if filled == 0 {
                break;
            }
            if let Err(e) = upload
                .put_part(Bytes::copy_from_slice(&buf[..filled]).into())
                .await
            {
                let _ = upload.abort().await;
                return Err(StorageError::from_object_store(url, e));
            }
        }
        upload
            .complete()
            .await
            .map(|_| ())
            .map_err(|e| StorageError::from_object_store(url, e))
    }
}

#[async_trait::async_trait]
impl StorageBackend for ObjectBackend {
    async fn exists(&self, path: &str) -> StorageResult<bool> {
        let (store, location) = self.resolve(path)?;
        match store.head(&location).await {
            Ok(_) => return Ok(true),
            Err(object_store::Error::NotFound { .. }) => {}
            Err(e) => return Err(StorageError::from_object_store(path, e)),
        }
        // A prefix with children counts as an existing directory.
        let listing = store
            .list_with_delimiter(Some(&location))
            .await
            .map_err(|e| StorageError::from_object_store(path, e))?;
        Ok(!listing.objects.is_empty() || !listing.common_prefixes.is_empty())
    }

    async fn read(&self, path: &str) -> StorageResult<Bytes> {
        let (store, location) = self.resolve(path)?;
        let result = store
            .get(&location)
            .await
            .map_err(|e| StorageError::from_object_store(path, e))?;
        result
            .bytes()
            .await
            .map_err(|e| StorageError::from_object_store(path, e))
    }

    async fn write(&self, path: &str, data: Bytes) -> StorageResult<()> {
        let (store, location) = self.resolve(path)?;

        let staged = stage_path(&self.staging_dir);
        tokio::fs::write(&staged, &data)
            .await
            .map_err(|e| StorageError::from_io(staged.to_string_lossy(), e))?;

        let result = Self::upload_staged(&store, path, &location, &staged).await;
        if let Err(e) = tokio::fs::remove_file(&staged).await {
            tracing::warn!(staged = %staged.display(), error = %e, "failed to remove staged upload");
        }
        result
    }

    async fn create_exclusive(&self, path: &str, data: Bytes) -> StorageResult<()> {
        let (store, location) = self.resolve(path)?;
        store
            .put_opts(&location, PutPayload::from(data), PutMode::Create.into())
            .await
            .map(|_| ())
            .map_err(|e| StorageError::from_object_store(path, e))
    }

    async fn remove(&self, path: &str, recursive: bool) -> StorageResult<()> {
        let (store, location) = self.resolve(path)?;
        let keys = if recursive {
            Self::keys_under(&store, path, &location).await?
        } else {
            store
                .head(&location)
                .await
                .map_err(|e| StorageError::from_object_store(path, e))?;
            vec![location]
        };
        if keys.is_empty() {
            return Err(StorageError::NotFound {
                path: path.to_string(),
            });
        }

        let locations =
            futures::stream::iter(keys.into_iter().map(Ok::<_, object_store::Error>)).boxed();
        store
            .delete_stream(locations)
            .try_collect::<Vec<_>>()
            .await
            .map(|_| ())
            .map_err(|e| StorageError::from_object_store(path, e))
    }

    async fn list_dir(&self, path: &str) -> StorageResult<Vec<String>> {
        let (store, location) = self.resolve(path)?;
        let listing = store
            .list_with_delimiter(Some(&location))
            .await
            .map_err(|e| StorageError::from_object_store(path, e))?;
        let mut names: Vec<String> = listing
            .objects
            .iter()
            .filter_map(|meta| meta.location.filename().map(str::to_string))
            .chain(
                listing
                    .common_prefixes
                    .iter()
                    .filter_map(|prefix| prefix.filename().map(str::to_string)),
            )
            .collect();
        names.sort();
        Ok(names)
    }

    async fn make_dir(&self, path: &str) -> StorageResult<()> {
        // Prefixes exist implicitly.
        parse_object_url(path).map(|_| ())
    }

    async fn copy(&self, from: &str, to: &str) -> StorageResult<()> {
        let (src_store, src) = self.resolve(from)?;
        let (dst_store, dst) = self.resolve(to)?;
        let same_bucket = parse_object_url(from)?.0 == parse_object_url(to)?.0;

        let keys = Self::keys_under(&src_store, from, &src).await?;
        if keys.is_empty() {
            return Err(StorageError::NotFound {
                path: from.to_string(),
            });
        }
        for key in keys {
            let target = Self::relocate(&key, &src, &dst);
            if same_bucket {
                src_store
                    .copy(&key, &target)
                    .await
                    .map_err(|e| StorageError::from_object_store(from, e))?;
            } else {
                let data = src_store
                    .get(&key)
                    .await
                    .map_err(|e| StorageError::from_object_store(from, e))?
                    .bytes()
                    .await
                    .map_err(|e| StorageError::from_object_store(from, e))?;
                dst_store
                    .put(&target, PutPayload::from(data))
                    .await
                    .map_err(|e| StorageError::from_object_store(to, e))?;
            }
        }
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> StorageResult<()> {
        self.copy(from, to).await?;
        self.remove(from, true).await
    }
}
