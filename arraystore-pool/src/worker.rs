//! The request loop run inside every `arraystore-worker` process.
//!
//! A worker owns one storage operator and a table of open array handles. Requests are handled
//! one at a time in arrival order.

use std::{collections::HashMap, sync::Arc};

use arraystore_array::ChunkedArray;
use arraystore_storage::{StorageOperations, StorageOperator};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    error::PoolError,
    protocol::{
        read_frame, write_framed_json, Command, HandleId, RemoteError, Reply, Request, Response,
    },
};

#[derive(Debug, Default)]
pub struct WorkerState {
    operator: Option<Arc<StorageOperator>>,
    handles: HashMap<HandleId, ChunkedArray>,
}

impl WorkerState {
    pub fn with_operator(operator: StorageOperator) -> Self {
        Self {
            operator: Some(Arc::new(operator)),
            handles: HashMap::new(),
        }
    }

    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    fn operator(&self) -> Result<Arc<StorageOperator>, RemoteError> {
        self.operator.clone().ok_or(RemoteError::NotInitialised)
    }

    fn array(&mut self, handle: HandleId) -> Result<&mut ChunkedArray, RemoteError> {
        self.handles
            .get_mut(&handle)
            .ok_or(RemoteError::HandleNotFound { handle })
    }

    /// Handle ids are random so that ids from a crashed process are never reissued.
    fn next_handle(&self) -> HandleId {
        loop {
            let id = rand::random::<u64>();
            if id != 0 && !self.handles.contains_key(&id) {
                return id;
            }
        }
    }

    pub async fn handle(&mut self, command: Command) -> Result<Reply, RemoteError> {
        let reply = match command {
            Command::Init { options } => {
                if self.operator.is_none() {
                    let operator = StorageOperator::new(options).map_err(RemoteError::Storage)?;
                    tracing::info!(scratch = %operator.scratch().path().display(), "worker initialised");
                    self.operator = Some(Arc::new(operator));
                }
                Reply::Ready
            }
            Command::Exists { paths } => Reply::Flags(self.operator()?.exists(paths).await),
            Command::Read { paths, mode } => {
                Reply::Contents(self.operator()?.read(paths, mode).await)
            }
            Command::Write { entries } => Reply::Done(self.operator()?.write(entries).await),
            Command::Remove { paths, recursive } => {
                Reply::Done(self.operator()?.remove(paths, recursive).await)
            }
            Command::MakeDirs { paths } => Reply::Done(self.operator()?.make_dirs(paths).await),
            Command::Copy { pairs } => Reply::Done(self.operator()?.copy(pairs).await),
            Command::Rename { pairs } => Reply::Done(self.operator()?.rename(pairs).await),
            Command::ListDir { path } => Reply::Names(self.operator()?.list_dir(&path).await),
            Command::GetMetadata { path } => {
                Reply::Metadata(self.operator()?.get_metadata(&path).await)
            }
            Command::SetMetadata { path, attributes } => {
                Reply::Unit(self.operator()?.set_metadata(&path, attributes).await)
            }
            Command::CreateExclusive { path, content } => {
                Reply::Unit(self.operator()?.create_exclusive(&path, content).await)
            }
            Command::OpenArray { path, options } => {
                let operator: Arc<dyn StorageOperations> = self.operator()?;
                let array = ChunkedArray::open(operator, &path, options)
                    .await
                    .map_err(RemoteError::Array)?;
                let handle = self.next_handle();
                let info = array.info();
                self.handles.insert(handle, array);
                tracing::debug!(handle, path = %info.path, "array handle opened");
                Reply::Opened { handle, info }
            }
            Command::ReloadArray { handle } => {
                let array = self.array(handle)?;
                array.reload().await.map_err(RemoteError::Array)?;
                Reply::Info(array.info())
            }
            Command::ArrayInfo { handle } => Reply::Info(self.array(handle)?.info()),
            Command::ArrayGet { handle, selection } => Reply::Values(
                self.array(handle)?
                    .get(&selection)
                    .await
                    .map_err(RemoteError::Array)?,
            ),
            Command::ArraySet {
                handle,
                selection,
                values,
            } => {
                self.array(handle)?
                    .set(&selection, values)
                    .await
                    .map_err(RemoteError::Array)?;
                Reply::Ack
            }
            Command::ArrayResize { handle, shape } => {
                self.array(handle)?
                    .resize(shape)
                    .await
                    .map_err(RemoteError::Array)?;
                Reply::Ack
            }
            Command::ArrayAttributes { handle } => Reply::Attributes(
                self.array(handle)?
                    .attributes()
                    .await
                    .map_err(RemoteError::Array)?,
            ),
            Command::ArraySetAttributes { handle, attributes } => {
                self.array(handle)?
                    .set_attributes(attributes)
                    .await
                    .map_err(RemoteError::Array)?;
                Reply::Ack
            }
            Command::CloseArray { handle } => {
                self.handles
                    .remove(&handle)
                    .ok_or(RemoteError::HandleNotFound { handle })?;
                tracing::debug!(handle, "array handle closed");
                Reply::Ack
            }
            Command::Exit => Reply::Exiting,
        };
        Ok(reply)
    }

    /// Drops every handle and removes the operator's scratch directory.
    pub fn shutdown(mut self) {
        self.handles.clear();
        if let Some(operator) = self.operator.take() {
            match Arc::try_unwrap(operator) {
                Ok(operator) => {
                    if let Err(e) = operator.close() {
                        tracing::warn!(error = %e, "failed to remove worker scratch directory");
                    }
                }
                Err(_) => tracing::warn!("storage operator still shared at shutdown"),
            }
        }
    }
}

/// Answers requests from `reader` on `writer` until `Exit` or end of input.
pub async fn serve<R, W>(
    mut reader: R,
    mut writer: W,
    state: &mut WorkerState,
) -> Result<(), PoolError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let Some(frame) = read_frame(&mut reader).await? else {
            tracing::debug!("request stream closed");
            return Ok(());
        };

        let request: Request = match serde_json::from_slice(&frame) {
            Ok(request) => request,
            Err(e) => {
                // Answer when the id is recoverable so the caller is not left waiting.
                let request_id = serde_json::from_slice::<serde_json::Value>(&frame)
                    .ok()
                    .and_then(|value| value.get("request_id").and_then(|id| id.as_u64()))
                    .ok_or(PoolError::SerdeError(e))?;
                tracing::error!(request_id, "malformed request");
                let response = Response {
                    request_id,
                    result: Err(RemoteError::InvalidRequest {
                        message: "request could not be decoded".to_string(),
                    }),
                };
                write_framed_json(&mut writer, &response).await?;
                continue;
            }
        };

        let exit = matches!(request.command, Command::Exit);
        tracing::trace!(
            request_id = request.request_id,
            command = request.command.name(),
            "handling request"
        );
        let result = state.handle(request.command).await;
        if let Err(e) = &result {
            tracing::debug!(request_id = request.request_id, error = %e, "request failed");
        }
        let response = Response {
            request_id: request.request_id,
            result,
        };
        write_framed_json(&mut writer, &response).await?;

        if exit {
            tracing::debug!("exit requested");
            return Ok(());
        }
    }
}
