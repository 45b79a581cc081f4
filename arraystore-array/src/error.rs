use arraystore_lock::LockError;
use arraystore_storage::StorageError;
use serde::{Deserialize, Serialize};

use crate::dtype::ElementType;

pub type ArrayResult<T> = Result<T, ArrayError>;

#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "error", content = "detail")]
pub enum ArrayError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Synchronizer lock error: {0}")]
    Lock(#[from] LockError),
    #[error("No array or group at {path}")]
    NotFound { path: String },
    #[error("{path} is a group, not an array")]
    NotAnArray { path: String },
    #[error("{path} is an array, not a group")]
    NotAGroup { path: String },
    #[error("{path} was opened read-only")]
    ReadOnly { path: String },
    #[error("Invalid array metadata at {path}: {message}")]
    InvalidMetadata { path: String, message: String },
    #[error("Creating {path} requires a shape and a chunk shape")]
    MissingShape { path: String },
    #[error("Index {index:?} is out of bounds for shape {shape:?}")]
    IndexOutOfBounds { index: Vec<u64>, shape: Vec<u64> },
    #[error("Expected {expected} dimensions, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("Value {value} cannot be stored as {dtype}")]
    TypeMismatch { dtype: ElementType, value: String },
    #[error("Selection holds {expected} elements but {actual} values were given")]
    ValueCountMismatch { expected: usize, actual: usize },
}

impl ArrayError {
    pub fn invalid_metadata(path: impl Into<String>, message: impl Into<String>) -> Self {
        ArrayError::InvalidMetadata {
            path: path.into(),
            message: message.into(),
        }
    }
}
