use std::ops::Range;

use arraystore_array::{
    AccessMode, BooleanMask, ChunkedArray, ElementType, HandleInfo, OpenOptions, Scalar,
    Selection,
};
use arraystore_storage::Attributes;

use crate::{
    client::WorkerClient,
    error::{PoolError, PoolResult},
    protocol::{Command, HandleId, Reply},
};

/// An array handle held open inside a worker process.
///
/// The cached [`HandleInfo`] is refreshed from the worker after open, resize and reload. Dropping
/// the proxy closes the remote handle in the background.
#[derive(Debug)]
pub struct RemoteArray {
    worker: WorkerClient,
    handle: HandleId,
    info: HandleInfo,
    closed: bool,
}

impl RemoteArray {
    pub(crate) async fn open(
        worker: WorkerClient,
        path: &str,
        options: OpenOptions,
    ) -> PoolResult<Self> {
        let command = Command::OpenArray {
            path: path.to_string(),
            options,
        };
        match worker.call(command).await? {
            Reply::Opened { handle, info } => Ok(Self {
                worker,
                handle,
                info,
                closed: false,
            }),
            _ => Err(PoolError::UnexpectedResponse {
                command: "open_array",
            }),
        }
    }

    pub fn handle_id(&self) -> HandleId {
        self.handle
    }

    pub fn worker_id(&self) -> usize {
        self.worker.worker_id()
    }

    async fn ack(&self, command: Command) -> PoolResult<()> {
        let name = command.name();
        match self.worker.call(command).await? {
            Reply::Ack => Ok(()),
            _ => Err(PoolError::UnexpectedResponse { command: name }),
        }
    }

    async fn sync(&mut self, command: Command) -> PoolResult<()> {
        let name = command.name();
        match self.worker.call(command).await? {
            Reply::Info(info) => {
                self.info = info;
                Ok(())
            }
            _ => Err(PoolError::UnexpectedResponse { command: name }),
        }
    }

    async fn close(mut self) -> PoolResult<()> {
        self.closed = true;
        self.ack(Command::CloseArray {
            handle: self.handle,
        })
        .await
    }
}

impl Drop for RemoteArray {
    fn drop(&mut self) {
        if !self.closed {
            self.worker.notify(Command::CloseArray {
                handle: self.handle,
            });
        }
    }
}

/// An open array or group, either in this process or in a pool worker.
#[derive(Debug)]
pub enum ArrayHandle {
    Direct(ChunkedArray),
    Proxy(RemoteArray),
}

impl ArrayHandle {
    pub fn info(&self) -> HandleInfo {
        match self {
            ArrayHandle::Direct(array) => array.info(),
            ArrayHandle::Proxy(remote) => remote.info.clone(),
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, ArrayHandle::Proxy(_))
    }

    pub fn path(&self) -> String {
        self.info().path
    }

    pub fn mode(&self) -> AccessMode {
        self.info().mode
    }

    pub fn shape(&self) -> Option<Vec<u64>> {
        self.info().shape().map(<[u64]>::to_vec)
    }

    pub fn chunks(&self) -> Option<Vec<u64>> {
        self.info().chunks().map(<[u64]>::to_vec)
    }

    pub fn dtype(&self) -> Option<ElementType> {
        self.info().dtype()
    }

    pub fn fill_value(&self) -> Option<Scalar> {
        self.info().fill_value()
    }

    pub async fn get(&self, selection: &Selection) -> PoolResult<Vec<Scalar>> {
        match self {
            ArrayHandle::Direct(array) => Ok(array.get(selection).await?),
            ArrayHandle::Proxy(remote) => {
                let command = Command::ArrayGet {
                    handle: remote.handle,
                    selection: selection.clone(),
                };
                match remote.worker.call(command).await? {
                    Reply::Values(values) => Ok(values),
                    _ => Err(PoolError::UnexpectedResponse {
                        command: "array_get",
                    }),
                }
            }
        }
    }

    pub async fn set(&self, selection: &Selection, values: Vec<Scalar>) -> PoolResult<()> {
        match self {
            ArrayHandle::Direct(array) => Ok(array.set(selection, values).await?),
            ArrayHandle::Proxy(remote) => {
                remote
                    .ack(Command::ArraySet {
                        handle: remote.handle,
                        selection: selection.clone(),
                        values,
                    })
                    .await
            }
        }
    }

    pub async fn read_coordinates(&self, points: Vec<Vec<u64>>) -> PoolResult<Vec<Scalar>> {
        self.get(&Selection::points(points)).await
    }

    pub async fn read_range(&self, ranges: Vec<Range<u64>>) -> PoolResult<Vec<Scalar>> {
        self.get(&Selection::range(ranges)).await
    }

    pub async fn read_mask(&self, mask: BooleanMask) -> PoolResult<Vec<Scalar>> {
        self.get(&Selection::Mask { mask }).await
    }

    pub async fn write_coordinates(
        &self,
        points: Vec<Vec<u64>>,
        values: Vec<Scalar>,
    ) -> PoolResult<()> {
        self.set(&Selection::points(points), values).await
    }

    pub async fn write_range(
        &self,
        ranges: Vec<Range<u64>>,
        values: Vec<Scalar>,
    ) -> PoolResult<()> {
        self.set(&Selection::range(ranges), values).await
    }

    pub async fn write_mask(&self, mask: BooleanMask, values: Vec<Scalar>) -> PoolResult<()> {
        self.set(&Selection::Mask { mask }, values).await
    }

    pub async fn resize(&mut self, shape: Vec<u64>) -> PoolResult<()> {
        match self {
            ArrayHandle::Direct(array) => Ok(array.resize(shape).await?),
            ArrayHandle::Proxy(remote) => {
                remote
                    .ack(Command::ArrayResize {
                        handle: remote.handle,
                        shape,
                    })
                    .await?;
                let handle = remote.handle;
                remote.sync(Command::ArrayInfo { handle }).await
            }
        }
    }

    /// Re-reads metadata written through other handles.
    pub async fn reload(&mut self) -> PoolResult<()> {
        match self {
            ArrayHandle::Direct(array) => Ok(array.reload().await?),
            ArrayHandle::Proxy(remote) => {
                let handle = remote.handle;
                remote.sync(Command::ReloadArray { handle }).await
            }
        }
    }

    pub async fn attributes(&self) -> PoolResult<Attributes> {
        match self {
            ArrayHandle::Direct(array) => Ok(array.attributes().await?),
            ArrayHandle::Proxy(remote) => {
                let command = Command::ArrayAttributes {
                    handle: remote.handle,
                };
                match remote.worker.call(command).await? {
                    Reply::Attributes(attributes) => Ok(attributes),
                    _ => Err(PoolError::UnexpectedResponse {
                        command: "array_attributes",
                    }),
                }
            }
        }
    }

    pub async fn get_attribute(&self, name: &str) -> PoolResult<Option<serde_json::Value>> {
        Ok(self.attributes().await?.remove(name))
    }

    /// Merges `attributes` into the stored attributes.
    pub async fn set_attributes(&self, attributes: Attributes) -> PoolResult<()> {
        match self {
            ArrayHandle::Direct(array) => Ok(array.set_attributes(attributes).await?),
            ArrayHandle::Proxy(remote) => {
                remote
                    .ack(Command::ArraySetAttributes {
                        handle: remote.handle,
                        attributes,
                    })
                    .await
            }
        }
    }

    /// Points the handle at `path` with `options`. Re-opening the current path in the current
    /// mode keeps the handle as is, unless `force` is set, which reloads its metadata.
    pub async fn reopen(
        &mut self,
        path: &str,
        options: OpenOptions,
        force: bool,
    ) -> PoolResult<()> {
        let info = self.info();
        if info.path == path.trim_end_matches('/') && info.mode == options.mode {
            if force {
                self.reload().await?;
            }
            return Ok(());
        }

        match self {
            ArrayHandle::Direct(array) => {
                *array = ChunkedArray::open(array.operator().clone(), path, options).await?;
            }
            ArrayHandle::Proxy(remote) => {
                let fresh = RemoteArray::open(remote.worker.clone(), path, options).await?;
                let stale = std::mem::replace(remote, fresh);
                if let Err(e) = stale.close().await {
                    tracing::warn!(error = %e, "failed to close replaced array handle");
                }
            }
        }
        Ok(())
    }

    /// Closes the handle, releasing the worker's table entry for proxies.
    pub async fn close(self) -> PoolResult<()> {
        match self {
            ArrayHandle::Direct(_) => Ok(()),
            ArrayHandle::Proxy(remote) => remote.close().await,
        }
    }
}
