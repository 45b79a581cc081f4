use std::{path::PathBuf, sync::Arc, time::Duration};

use arraystore_array::{ChunkedArray, OpenOptions};
use arraystore_config::CONFIG;
use arraystore_lock::{LockOptions, SpinLock};
use arraystore_storage::{StorageOperations, StorageOperator, StorageOptions};
use rand::Rng;

use crate::{
    client::{worker_executable_path, WorkerClient, WorkerSpec},
    error::{PoolError, PoolResult},
    handle::{ArrayHandle, RemoteArray},
    proxy::RemoteOperator,
};

#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Number of worker processes, 0 runs everything in-process.
    pub workers: usize,
    pub storage: StorageOptions,
    pub worker_executable: Option<PathBuf>,
    pub request_timeout: Option<Duration>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            workers: CONFIG.pool_workers,
            storage: StorageOptions::default(),
            worker_executable: None,
            request_timeout: CONFIG.worker_request_timeout(),
        }
    }
}

impl PoolOptions {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_storage(mut self, storage: StorageOptions) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_worker_executable(mut self, executable: impl Into<PathBuf>) -> Self {
        self.worker_executable = Some(executable.into());
        self
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Hands out storage operators and array handles, in-process or backed by worker processes.
#[derive(Debug)]
pub enum OperatorPool {
    InProcess {
        operator: Arc<StorageOperator>,
    },
    Workers {
        workers: Vec<WorkerClient>,
        operators: Vec<Arc<RemoteOperator>>,
    },
}

impl OperatorPool {
    pub async fn new(options: PoolOptions) -> PoolResult<Self> {
        if options.workers == 0 {
            tracing::debug!("operator pool running in-process");
            return Ok(Self::in_process(StorageOperator::new(options.storage)?));
        }

        let spec = WorkerSpec {
            executable: options
                .worker_executable
                .unwrap_or_else(worker_executable_path),
            storage: options.storage,
            request_timeout: options.request_timeout,
        };
        tracing::info!(
            workers = options.workers,
            executable = ?spec.executable,
            "starting operator pool"
        );

        let workers = futures::future::try_join_all(
            (0..options.workers).map(|worker_id| WorkerClient::start(worker_id, spec.clone())),
        )
        .await?;
        let operators = workers
            .iter()
            .map(|worker| Arc::new(RemoteOperator::new(worker.clone())))
            .collect();
        Ok(OperatorPool::Workers { workers, operators })
    }

    /// A pool without workers around an existing operator.
    pub fn in_process(operator: StorageOperator) -> Self {
        OperatorPool::InProcess {
            operator: Arc::new(operator),
        }
    }

    pub fn worker_count(&self) -> usize {
        match self {
            OperatorPool::InProcess { .. } => 0,
            OperatorPool::Workers { workers, .. } => workers.len(),
        }
    }

    fn pick(len: usize) -> usize {
        rand::rng().random_range(0..len)
    }

    /// One operator; with workers, the proxy of a uniformly chosen worker.
    pub fn get_operator(&self) -> Arc<dyn StorageOperations> {
        match self {
            OperatorPool::InProcess { operator } => operator.clone(),
            OperatorPool::Workers { operators, .. } => {
                operators[Self::pick(operators.len())].clone()
            }
        }
    }

    pub async fn open_array(&self, path: &str, options: OpenOptions) -> PoolResult<ArrayHandle> {
        match self {
            OperatorPool::InProcess { operator } => Ok(ArrayHandle::Direct(
                ChunkedArray::open(operator.clone(), path, options).await?,
            )),
            OperatorPool::Workers { workers, .. } => {
                let worker = workers[Self::pick(workers.len())].clone();
                Ok(ArrayHandle::Proxy(
                    RemoteArray::open(worker, path, options).await?,
                ))
            }
        }
    }

    /// A lock coordinator bound to [`OperatorPool::get_operator`].
    pub fn create_lock_coordinator(&self, options: LockOptions) -> SpinLock {
        SpinLock::new(self.get_operator(), options)
    }

    /// Stops every worker, or removes the in-process operator's scratch directory.
    pub async fn shutdown(self) -> PoolResult<()> {
        match self {
            OperatorPool::InProcess { operator } => match Arc::try_unwrap(operator) {
                Ok(operator) => operator.close().map_err(PoolError::IoError),
                Err(_) => {
                    tracing::debug!("operator still in use, scratch is removed when it drops");
                    Ok(())
                }
            },
            OperatorPool::Workers { workers, operators } => {
                drop(operators);
                let results =
                    futures::future::join_all(workers.iter().map(|worker| worker.shutdown())).await;
                tracing::info!(workers = workers.len(), "operator pool shut down");
                results.into_iter().collect()
            }
        }
    }
}
