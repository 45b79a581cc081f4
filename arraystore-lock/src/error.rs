use arraystore_storage::StorageError;
use serde::{Deserialize, Serialize};

pub type LockResult<T> = Result<T, LockError>;

#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "error", content = "detail")]
pub enum LockError {
    #[error("Lock {path} is held by another owner")]
    Unavailable { path: String },
    #[error("Timed out after {waited_ms}ms waiting for lock {path}")]
    Timeout { path: String, waited_ms: u64 },
    #[error("Lock record at {path} is unreadable: {message}")]
    InvalidRecord { path: String, message: String },
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}
