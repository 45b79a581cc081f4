use std::{collections::HashMap, path::PathBuf};

use serde::{Deserialize, Serialize};

use arraystore_config::{CONFIG, SCRATCH_ROOT};

/// Construction options of a storage operator.
///
/// `credentials` is handed verbatim to the object-storage client builder.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageOptions {
    pub credentials: HashMap<String, String>,
    pub scratch_root: PathBuf,
    pub batch_concurrency: usize,
    pub http_timeout_ms: u64,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            credentials: HashMap::new(),
            scratch_root: SCRATCH_ROOT.clone(),
            batch_concurrency: CONFIG.batch_concurrency,
            http_timeout_ms: CONFIG.http_timeout_ms,
        }
    }
}

impl StorageOptions {
    pub fn with_credential(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.credentials.insert(key.into(), value.into());
        self
    }

    pub fn with_credentials(mut self, credentials: HashMap<String, String>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_scratch_root(mut self, scratch_root: impl Into<PathBuf>) -> Self {
        self.scratch_root = scratch_root.into();
        self
    }

    pub fn with_batch_concurrency(mut self, batch_concurrency: usize) -> Self {
        self.batch_concurrency = batch_concurrency.max(1);
        self
    }
}

impl std::fmt::Debug for StorageOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageOptions")
            .field("credentials", &self.credentials.keys().collect::<Vec<_>>())
            .field("scratch_root", &self.scratch_root)
            .field("batch_concurrency", &self.batch_concurrency)
            .field("http_timeout_ms", &self.http_timeout_ms)
            .finish()
    }
}
