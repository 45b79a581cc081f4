use serde::{Deserialize, Serialize};

/// Failure of a single path operation.
///
/// Errors carry the path they belong to and are serializable so that a worker process can hand
/// them back to the caller unchanged.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum StorageError {
    #[error("{path}: not found")]
    NotFound { path: String },
    #[error("{path}: already exists")]
    AlreadyExists { path: String },
    #[error("{path}: rejected by backend: {message}")]
    PermissionOrProtocol { path: String, message: String },
    #[error("{path}: backend unavailable: {message}")]
    Unavailable { path: String, message: String },
}

pub type StorageResult<T> = Result<T, StorageError>;

impl StorageError {
    pub fn path(&self) -> &str {
        match self {
            StorageError::NotFound { path }
            | StorageError::AlreadyExists { path }
            | StorageError::PermissionOrProtocol { path, .. }
            | StorageError::Unavailable { path, .. } => path,
        }
    }

    /// Transient failures may be retried for idempotent operations.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Unavailable { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }

    pub fn protocol(path: impl Into<String>, message: impl Into<String>) -> Self {
        StorageError::PermissionOrProtocol {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn unavailable(path: impl Into<String>, message: impl Into<String>) -> Self {
        StorageError::Unavailable {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn from_io(path: impl Into<String>, err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let path = path.into();
        match err.kind() {
            ErrorKind::NotFound => StorageError::NotFound { path },
            ErrorKind::AlreadyExists => StorageError::AlreadyExists { path },
            ErrorKind::PermissionDenied
            | ErrorKind::InvalidInput
            | ErrorKind::InvalidData
            | ErrorKind::Unsupported => StorageError::protocol(path, err.to_string()),
            _ => StorageError::unavailable(path, err.to_string()),
        }
    }

    pub fn from_object_store(path: impl Into<String>, err: object_store::Error) -> Self {
        let path = path.into();
        match err {
            object_store::Error::NotFound { .. } => StorageError::NotFound { path },
            object_store::Error::AlreadyExists { .. } | object_store::Error::Precondition { .. } => {
                StorageError::AlreadyExists { path }
            }
            object_store::Error::PermissionDenied { .. }
            | object_store::Error::Unauthenticated { .. }
            | object_store::Error::NotSupported { .. }
            | object_store::Error::NotImplemented
            | object_store::Error::InvalidPath { .. }
            | object_store::Error::UnknownConfigurationKey { .. } => {
                StorageError::protocol(path, err.to_string())
            }
            other => StorageError::unavailable(path, other.to_string()),
        }
    }
}
