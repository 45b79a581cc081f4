use arraystore_array::ArrayError;
use arraystore_storage::StorageError;

use crate::protocol::{HandleId, RemoteError};

pub type PoolResult<T> = Result<T, PoolError>;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Worker process failed with IO error: {0}")]
    IoError(std::io::Error),
    #[error("Worker process failed with protocol error: {0}")]
    SerdeError(serde_json::Error),
    #[error("Worker protocol violation: {0}")]
    ProtocolError(String),
    #[error("Worker produced an unexpected response to {command}")]
    UnexpectedResponse { command: &'static str },
    #[error("Worker request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("Worker {worker_id} is gone")]
    WorkerGone { worker_id: usize },
    #[error("No open array handle {handle}, its worker may have restarted")]
    HandleNotFound { handle: HandleId },
    #[error("Worker could not be initialised: {0}")]
    Init(String),
    #[error("Array error: {0}")]
    Array(#[from] ArrayError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl PoolError {
    /// Whether the worker process must be replaced after this error.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            PoolError::IoError(_)
                | PoolError::SerdeError(_)
                | PoolError::ProtocolError(_)
                | PoolError::Timeout { .. }
        )
    }
}

impl From<RemoteError> for PoolError {
    fn from(value: RemoteError) -> Self {
        match value {
            RemoteError::Array(e) => PoolError::Array(e),
            RemoteError::HandleNotFound { handle } => PoolError::HandleNotFound { handle },
            RemoteError::Storage(e) => PoolError::Storage(e),
            RemoteError::InvalidRequest { message } => PoolError::ProtocolError(message),
            RemoteError::NotInitialised => {
                PoolError::Init("worker has not received an init command".to_string())
            }
        }
    }
}
