use std::time::Duration;

use bytes::Bytes;
use reqwest::StatusCode;

use crate::{
    error::{StorageError, StorageResult},
    StorageBackend,
};

/// Read-only HTTP access.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
}

impl HttpBackend {
    pub fn new(timeout: Duration) -> StorageResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StorageError::protocol("http", e.to_string()))?;
        Ok(Self { client })
    }

    fn read_only(path: &str) -> StorageError {
        StorageError::protocol(path, "http backend is read-only")
    }
}

#[async_trait::async_trait]
impl StorageBackend for HttpBackend {
    /// A resource exists when it answers with status 200. Connection failures count as absent.
    async fn exists(&self, path: &str) -> StorageResult<bool> {
        // Servers may refuse HEAD on resources they serve, so check with GET and drop the body.
        match self.client.get(path).send().await {
            Ok(response) => Ok(response.status() == StatusCode::OK),
            Err(e) => {
                tracing::debug!(url = path, error = %e, "http existence check failed");
                Ok(false)
            }
        }
    }

    async fn read(&self, path: &str) -> StorageResult<Bytes> {
        let response = self
            .client
            .get(path)
            .send()
            .await
            .map_err(|e| StorageError::unavailable(path, e.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(StorageError::NotFound {
                path: path.to_string(),
            });
        }
        if status.is_server_error() {
            return Err(StorageError::unavailable(path, status.to_string()));
        }
        if !status.is_success() {
            return Err(StorageError::protocol(path, status.to_string()));
        }

        response
            .bytes()
            .await
            .map_err(|e| StorageError::unavailable(path, e.to_string()))
    }

    async fn write(&self, path: &str, _data: Bytes) -> StorageResult<()> {
        Err(Self::read_only(path))
    }

    async fn create_exclusive(&self, path: &str, _data: Bytes) -> StorageResult<()> {
        Err(Self::read_only(path))
    }

    async fn remove(&self, path: &str, _recursive: bool) -> StorageResult<()> {
        Err(Self::read_only(path))
    }

    async fn list_dir(&self, path: &str) -> StorageResult<Vec<String>> {
        Err(StorageError::protocol(path, "http resources cannot be listed"))
    }

    async fn make_dir(&self, path: &str) -> StorageResult<()> {
        Err(Self::read_only(path))
    }

    async fn copy(&self, _from: &str, to: &str) -> StorageResult<()> {
        Err(Self::read_only(to))
    }

    async fn rename(&self, from: &str, _to: &str) -> StorageResult<()> {
        Err(Self::read_only(from))
    }
}
