//! Storage operations forwarded to a worker process.

use arraystore_storage::{
    Attributes, Content, ReadMode, StorageError, StorageOperations, StorageResult,
};
use indexmap::IndexMap;

use crate::{
    client::WorkerClient,
    error::PoolError,
    protocol::{Command, Reply},
};

/// A [`StorageOperations`] implementation whose operator lives in a worker process.
///
/// Failures of the worker itself are reported per path as [`StorageError::Unavailable`], so
/// callers see the same result shape as with an in-process operator.
#[derive(Debug, Clone)]
pub struct RemoteOperator {
    worker: WorkerClient,
}

fn unavailable(path: &str, err: &PoolError) -> StorageError {
    StorageError::unavailable(path, format!("worker request failed: {err}"))
}

fn unavailable_all<T>(paths: &[String], err: &PoolError) -> Vec<StorageResult<T>> {
    paths.iter().map(|path| Err(unavailable(path, err))).collect()
}

impl RemoteOperator {
    pub fn new(worker: WorkerClient) -> Self {
        Self { worker }
    }

    pub fn worker_id(&self) -> usize {
        self.worker.worker_id()
    }

    async fn done(&self, paths: Vec<String>, command: Command) -> Vec<StorageResult<()>> {
        let name = command.name();
        match self.worker.call(command).await {
            Ok(Reply::Done(results)) => results,
            Ok(_) => unavailable_all(&paths, &PoolError::UnexpectedResponse { command: name }),
            Err(e) => unavailable_all(&paths, &e),
        }
    }

    async fn single(&self, path: &str, command: Command) -> StorageResult<Reply> {
        self.worker
            .call(command)
            .await
            .map_err(|e| unavailable(path, &e))
    }
}

#[async_trait::async_trait]
impl StorageOperations for RemoteOperator {
    async fn exists(&self, paths: Vec<String>) -> Vec<StorageResult<bool>> {
        let command = Command::Exists {
            paths: paths.clone(),
        };
        match self.worker.call(command).await {
            Ok(Reply::Flags(results)) => results,
            Ok(_) => {
                unavailable_all(&paths, &PoolError::UnexpectedResponse { command: "exists" })
            }
            Err(e) => unavailable_all(&paths, &e),
        }
    }

    async fn read(&self, paths: Vec<String>, mode: ReadMode) -> Vec<StorageResult<Content>> {
        let command = Command::Read {
            paths: paths.clone(),
            mode,
        };
        match self.worker.call(command).await {
            Ok(Reply::Contents(results)) => results,
            Ok(_) => {
                unavailable_all(&paths, &PoolError::UnexpectedResponse { command: "read" })
            }
            Err(e) => unavailable_all(&paths, &e),
        }
    }

    async fn write(&self, entries: IndexMap<String, Content>) -> Vec<StorageResult<()>> {
        let paths: Vec<String> = entries.keys().cloned().collect();
        self.done(paths, Command::Write { entries }).await
    }

    async fn remove(&self, paths: Vec<String>, recursive: bool) -> Vec<StorageResult<()>> {
        let command = Command::Remove {
            paths: paths.clone(),
            recursive,
        };
        self.done(paths, command).await
    }

    async fn make_dirs(&self, paths: Vec<String>) -> Vec<StorageResult<()>> {
        let command = Command::MakeDirs {
            paths: paths.clone(),
        };
        self.done(paths, command).await
    }

    async fn copy(&self, pairs: Vec<(String, String)>) -> Vec<StorageResult<()>> {
        let sources = pairs.iter().map(|(from, _)| from.clone()).collect();
        self.done(sources, Command::Copy { pairs }).await
    }

    async fn rename(&self, pairs: Vec<(String, String)>) -> Vec<StorageResult<()>> {
        let sources = pairs.iter().map(|(from, _)| from.clone()).collect();
        self.done(sources, Command::Rename { pairs }).await
    }

    async fn list_dir(&self, path: &str) -> StorageResult<Vec<String>> {
        let command = Command::ListDir {
            path: path.to_string(),
        };
        match self.single(path, command).await? {
            Reply::Names(result) => result,
            _ => Err(unavailable(
                path,
                &PoolError::UnexpectedResponse {
                    command: "list_dir",
                },
            )),
        }
    }

    async fn get_metadata(&self, path: &str) -> StorageResult<Attributes> {
        let command = Command::GetMetadata {
            path: path.to_string(),
        };
        match self.single(path, command).await? {
            Reply::Metadata(result) => result,
            _ => Err(unavailable(
                path,
                &PoolError::UnexpectedResponse {
                    command: "get_metadata",
                },
            )),
        }
    }

    async fn set_metadata(&self, path: &str, attributes: Attributes) -> StorageResult<()> {
        let command = Command::SetMetadata {
            path: path.to_string(),
            attributes,
        };
        match self.single(path, command).await? {
            Reply::Unit(result) => result,
            _ => Err(unavailable(
                path,
                &PoolError::UnexpectedResponse {
                    command: "set_metadata",
                },
            )),
        }
    }

    async fn create_exclusive(&self, path: &str, content: Content) -> StorageResult<()> {
        let command = Command::CreateExclusive {
            path: path.to_string(),
            content,
        };
        match self.single(path, command).await? {
            Reply::Unit(result) => result,
            _ => Err(unavailable(
                path,
                &PoolError::UnexpectedResponse {
                    command: "create_exclusive",
                },
            )),
        }
    }
}
