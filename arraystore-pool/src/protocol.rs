//! Wire protocol between the pool and its `arraystore-worker` processes.
//!
//! Every message is a frame: `[u32 little-endian length]` followed by that many bytes of JSON.
//! The pool writes a [`Request`] to the worker's stdin and reads exactly one [`Response`] with the
//! same `request_id` from its stdout. The first request on a fresh process is always
//! [`Command::Init`].

use arraystore_array::{ArrayError, HandleInfo, OpenOptions, Scalar, Selection};
use arraystore_storage::{
    Attributes, Content, ReadMode, StorageError, StorageOptions, StorageResult,
};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::PoolError;

pub type RequestId = u64;
pub type HandleId = u64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub request_id: RequestId,
    pub command: Command,
}

/// Borrowing counterpart of [`Request`] used when sending.
#[derive(Debug, Serialize)]
pub(crate) struct OutgoingRequest<'a> {
    pub request_id: RequestId,
    pub command: &'a Command,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    /// Builds the worker's storage operator.
    Init { options: StorageOptions },
    Exists { paths: Vec<String> },
    Read { paths: Vec<String>, mode: ReadMode },
    Write { entries: IndexMap<String, Content> },
    Remove { paths: Vec<String>, recursive: bool },
    MakeDirs { paths: Vec<String> },
    Copy { pairs: Vec<(String, String)> },
    Rename { pairs: Vec<(String, String)> },
    ListDir { path: String },
    GetMetadata { path: String },
    SetMetadata { path: String, attributes: Attributes },
    CreateExclusive { path: String, content: Content },
    OpenArray { path: String, options: OpenOptions },
    ReloadArray { handle: HandleId },
    ArrayInfo { handle: HandleId },
    ArrayGet { handle: HandleId, selection: Selection },
    ArraySet {
        handle: HandleId,
        selection: Selection,
        #[serde(with = "tagged_scalars")]
        values: Vec<Scalar>,
    },
    ArrayResize { handle: HandleId, shape: Vec<u64> },
    ArrayAttributes { handle: HandleId },
    ArraySetAttributes {
        handle: HandleId,
        attributes: Attributes,
    },
    CloseArray { handle: HandleId },
    Exit,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Init { .. } => "init",
            Command::Exists { .. } => "exists",
            Command::Read { .. } => "read",
            Command::Write { .. } => "write",
            Command::Remove { .. } => "remove",
            Command::MakeDirs { .. } => "make_dirs",
            Command::Copy { .. } => "copy",
            Command::Rename { .. } => "rename",
            Command::ListDir { .. } => "list_dir",
            Command::GetMetadata { .. } => "get_metadata",
            Command::SetMetadata { .. } => "set_metadata",
            Command::CreateExclusive { .. } => "create_exclusive",
            Command::OpenArray { .. } => "open_array",
            Command::ReloadArray { .. } => "reload_array",
            Command::ArrayInfo { .. } => "array_info",
            Command::ArrayGet { .. } => "array_get",
            Command::ArraySet { .. } => "array_set",
            Command::ArrayResize { .. } => "array_resize",
            Command::ArrayAttributes { .. } => "array_attributes",
            Command::ArraySetAttributes { .. } => "array_set_attributes",
            Command::CloseArray { .. } => "close_array",
            Command::Exit => "exit",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reply", content = "value", rename_all = "snake_case")]
pub enum Reply {
    Ready,
    Exiting,
    Flags(Vec<StorageResult<bool>>),
    Contents(Vec<StorageResult<Content>>),
    Done(Vec<StorageResult<()>>),
    Names(StorageResult<Vec<String>>),
    Metadata(StorageResult<Attributes>),
    Unit(StorageResult<()>),
    Opened { handle: HandleId, info: HandleInfo },
    Info(HandleInfo),
    Values(#[serde(with = "tagged_scalars")] Vec<Scalar>),
    Attributes(Attributes),
    Ack,
}

/// Failure of a whole request, as opposed to per-path failures carried inside a [`Reply`].
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "error", content = "detail")]
pub enum RemoteError {
    #[error("{0}")]
    Array(ArrayError),
    #[error("No open array handle {handle}")]
    HandleNotFound { handle: HandleId },
    #[error("Worker storage operator could not be created: {0}")]
    Storage(StorageError),
    #[error("Worker has not received an init command")]
    NotInitialised,
    #[error("Malformed request: {message}")]
    InvalidRequest { message: String },
}

/// Element values keep their variant on the wire: `{"int": 4}` rather than a bare `4`, which would
/// read back as unsigned.
mod tagged_scalars {
    use arraystore_array::Scalar;
    use serde::{de::Error, Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    enum Tagged {
        Bool(bool),
        Int(i64),
        #[serde(rename = "uint")]
        UInt(u64),
        Float(Scalar),
    }

    pub fn serialize<S: Serializer>(values: &[Scalar], serializer: S) -> Result<S::Ok, S::Error> {
        values
            .iter()
            .map(|value| match *value {
                Scalar::Bool(v) => Tagged::Bool(v),
                Scalar::Int(v) => Tagged::Int(v),
                Scalar::UInt(v) => Tagged::UInt(v),
                float @ Scalar::Float(_) => Tagged::Float(float),
            })
            .collect::<Vec<_>>()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<Scalar>, D::Error> {
        Vec::<Tagged>::deserialize(deserializer)?
            .into_iter()
            .map(|tagged| match tagged {
                Tagged::Bool(v) => Ok(Scalar::Bool(v)),
                Tagged::Int(v) => Ok(Scalar::Int(v)),
                Tagged::UInt(v) => Ok(Scalar::UInt(v)),
                Tagged::Float(v) => v
                    .as_f64()
                    .map(Scalar::Float)
                    .ok_or_else(|| D::Error::custom(format!("{v} is not a float"))),
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub request_id: RequestId,
    pub result: Result<Reply, RemoteError>,
}

pub async fn write_framed_json<W: AsyncWrite + Unpin, T: Serialize>(
    writer: &mut W,
    value: &T,
) -> Result<(), PoolError> {
    let json = serde_json::to_vec(value).map_err(PoolError::SerdeError)?;
    let len = u32::try_from(json.len())
        .map_err(|_| PoolError::ProtocolError(format!("frame of {} bytes", json.len())))?;
    writer
        .write_all(&len.to_le_bytes())
        .await
        .map_err(PoolError::IoError)?;
    writer.write_all(&json).await.map_err(PoolError::IoError)?;
    writer.flush().await.map_err(PoolError::IoError)?;
    tracing::trace!(len = json.len(), "wrote framed json");
    Ok(())
}

/// Reads one frame. `None` when the stream ended cleanly before a new frame started.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Vec<u8>>, PoolError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(PoolError::IoError(e)),
    }
    let json_len = u32::from_le_bytes(len_buf) as usize;
    if json_len == 0 {
        return Err(PoolError::ProtocolError("zero-length json frame".to_string()));
    }
    let mut json_buf = vec![0u8; json_len];
    reader
        .read_exact(&mut json_buf)
        .await
        .map_err(PoolError::IoError)?;
    Ok(Some(json_buf))
}

pub async fn read_framed_json<R: AsyncRead + Unpin, T: serde::de::DeserializeOwned>(
    reader: &mut R,
) -> Result<T, PoolError> {
    let frame = read_frame(reader).await?.ok_or_else(|| {
        PoolError::IoError(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "worker closed its output",
        ))
    })?;
    serde_json::from_slice(&frame).map_err(PoolError::SerdeError)
}
