//! Pool side of one worker process.
//!
//! Each [`WorkerClient`] is backed by a tokio task that owns the child process and its pipes and
//! handles one request at a time. A request failing at the transport level (broken pipe,
//! undecodable frame, timeout) replaces the process; broken pipes and bad frames are retried
//! once on the fresh process. Array handles of the replaced process are lost.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use arraystore_config::CONFIG;
use arraystore_storage::StorageOptions;
use tokio::{
    io::{BufReader, BufWriter},
    process::{Child, ChildStdin, ChildStdout},
    sync::{mpsc, oneshot},
};

use crate::{
    error::{PoolError, PoolResult},
    protocol::{
        read_framed_json, write_framed_json, Command, OutgoingRequest, RemoteError, Reply,
        RequestId, Response,
    },
};

pub const WORKER_BINARY: &str = "arraystore-worker";

const EXIT_GRACE: Duration = Duration::from_secs(5);

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

fn next_request_id() -> RequestId {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// Locates the worker executable: explicit override, `PATH`, then next to the current executable.
pub fn worker_executable_path() -> PathBuf {
    if let Some(path) = CONFIG.worker_executable.clone() {
        tracing::debug!(path = ?path, "using arraystore-worker from config");
        return path;
    }

    if let Ok(path) = which::which(WORKER_BINARY) {
        tracing::debug!(path = ?path, "using arraystore-worker from PATH");
        return path;
    }

    if let Some(dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    {
        let candidate = dir.join(WORKER_BINARY);
        if candidate.exists() {
            tracing::debug!(
                path = ?candidate,
                "using arraystore-worker next to current executable"
            );
            return candidate;
        }
    }

    PathBuf::from(WORKER_BINARY)
}

/// Everything needed to (re)start a worker process.
#[derive(Debug, Clone)]
pub(crate) struct WorkerSpec {
    pub executable: PathBuf,
    pub storage: StorageOptions,
    pub request_timeout: Option<Duration>,
}

struct WorkerRequest {
    command: Command,
    responder: Option<oneshot::Sender<PoolResult<Reply>>>,
}

struct WorkerProcess {
    child: Child,
    stdin: BufWriter<ChildStdin>,
    stdout: BufReader<ChildStdout>,
}

impl WorkerProcess {
    async fn spawn(worker_id: usize, spec: &WorkerSpec) -> PoolResult<Self> {
        tracing::debug!(worker_id, executable = ?spec.executable, "spawning worker process");
        let mut child = tokio::process::Command::new(&spec.executable)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(PoolError::IoError)?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PoolError::IoError(std::io::Error::other("no stdin")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PoolError::IoError(std::io::Error::other("no stdout")))?;

        let mut process = Self {
            child,
            stdin: BufWriter::new(stdin),
            stdout: BufReader::with_capacity(1024 * 1024, stdout),
        };
        let init = Command::Init {
            options: spec.storage.clone(),
        };
        match process.exchange(&init, spec.request_timeout).await? {
            Ok(Reply::Ready) => Ok(process),
            Ok(_) => Err(PoolError::UnexpectedResponse { command: "init" }),
            Err(e) => Err(PoolError::Init(e.to_string())),
        }
    }

    async fn exchange(
        &mut self,
        command: &Command,
        timeout: Option<Duration>,
    ) -> PoolResult<Result<Reply, RemoteError>> {
        let request_id = next_request_id();
        let round_trip = async {
            write_framed_json(
                &mut self.stdin,
                &OutgoingRequest {
                    request_id,
                    command,
                },
            )
            .await?;
            let response: Response = read_framed_json(&mut self.stdout).await?;
            if response.request_id != request_id {
                return Err(PoolError::ProtocolError(format!(
                    "expected response to request {request_id}, got {}",
                    response.request_id
                )));
            }
            Ok(response.result)
        };

        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, round_trip)
                .await
                .map_err(|_| PoolError::Timeout {
                    timeout_ms: timeout.as_millis().min(u64::MAX as u128) as u64,
                })?,
            None => round_trip.await,
        }
    }

    async fn finish(mut self, worker_id: usize) {
        match tokio::time::timeout(EXIT_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => tracing::debug!(worker_id, %status, "worker exited"),
            Ok(Err(e)) => tracing::warn!(worker_id, error = %e, "failed to wait for worker"),
            Err(_) => {
                tracing::warn!(worker_id, "worker did not exit in time, killing it");
                if let Err(e) = self.child.kill().await {
                    tracing::warn!(worker_id, error = %e, "failed to kill worker");
                }
            }
        }
    }
}

/// Cloneable sender side of one worker.
#[derive(Debug, Clone)]
pub struct WorkerClient {
    worker_id: usize,
    tx: mpsc::Sender<WorkerRequest>,
    done: Arc<tokio::sync::Notify>,
}

impl std::fmt::Debug for WorkerRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRequest")
            .field("command", &self.command.name())
            .finish()
    }
}

impl WorkerClient {
    /// Starts the worker process and waits until it is initialised.
    pub(crate) async fn start(worker_id: usize, spec: WorkerSpec) -> PoolResult<Self> {
        let process = WorkerProcess::spawn(worker_id, &spec).await?;
        let (tx, rx) = mpsc::channel(1);
        let done = Arc::new(tokio::sync::Notify::new());
        tokio::spawn(run_worker(worker_id, spec, process, rx, done.clone()));
        Ok(Self {
            worker_id,
            tx,
            done,
        })
    }

    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    pub async fn call(&self, command: Command) -> PoolResult<Reply> {
        let (responder, response) = oneshot::channel();
        self.tx
            .send(WorkerRequest {
                command,
                responder: Some(responder),
            })
            .await
            .map_err(|_| PoolError::WorkerGone {
                worker_id: self.worker_id,
            })?;
        response.await.map_err(|_| PoolError::WorkerGone {
            worker_id: self.worker_id,
        })?
    }

    /// Queues `command` without waiting for its reply. Used where awaiting is impossible.
    pub fn notify(&self, command: Command) {
        let request = WorkerRequest {
            command,
            responder: None,
        };
        match self.tx.try_send(request) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(request)) => {
                let tx = self.tx.clone();
                if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                    runtime.spawn(async move {
                        let _ = tx.send(request).await;
                    });
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Asks the worker to exit and waits until its process is gone.
    pub async fn shutdown(&self) -> PoolResult<()> {
        let finished = self.done.notified();
        match self.call(Command::Exit).await {
            Err(PoolError::WorkerGone { .. }) => Ok(()),
            result => {
                finished.await;
                match result {
                    Ok(Reply::Exiting) => Ok(()),
                    Ok(_) => Err(PoolError::UnexpectedResponse { command: "exit" }),
                    Err(e) => Err(e),
                }
            }
        }
    }
}

async fn run_worker(
    worker_id: usize,
    spec: WorkerSpec,
    process: WorkerProcess,
    mut rx: mpsc::Receiver<WorkerRequest>,
    done: Arc<tokio::sync::Notify>,
) {
    let mut process = Some(process);
    while let Some(request) = rx.recv().await {
        let exit = matches!(request.command, Command::Exit);
        let result = if exit {
            exit_worker(worker_id, &mut process).await
        } else {
            dispatch(worker_id, &spec, &mut process, &request.command).await
        };
        if let Some(responder) = request.responder {
            let _ = responder.send(result);
        }
        if exit {
            break;
        }
    }
    // Any process still owned here is killed on drop.
    drop(process);
    done.notify_waiters();
    tracing::debug!(worker_id, "worker task finished");
}

async fn exit_worker(worker_id: usize, process: &mut Option<WorkerProcess>) -> PoolResult<Reply> {
    let Some(mut proc) = process.take() else {
        return Ok(Reply::Exiting);
    };
    let result = proc.exchange(&Command::Exit, Some(EXIT_GRACE)).await;
    proc.finish(worker_id).await;
    match result {
        Ok(reply) => Ok(reply?),
        // A worker that died on its own has exited as well.
        Err(e) if e.is_transport() => Ok(Reply::Exiting),
        Err(e) => Err(e),
    }
}

async fn dispatch(
    worker_id: usize,
    spec: &WorkerSpec,
    process: &mut Option<WorkerProcess>,
    command: &Command,
) -> PoolResult<Reply> {
    let mut retried = false;
    loop {
        if process.is_none() {
            *process = Some(WorkerProcess::spawn(worker_id, spec).await?);
            tracing::info!(worker_id, "worker process respawned");
        }
        let Some(proc) = process.as_mut() else {
            continue;
        };

        match proc.exchange(command, spec.request_timeout).await {
            Ok(result) => return Ok(result?),
            Err(e) if e.is_transport() => {
                tracing::warn!(
                    worker_id,
                    command = command.name(),
                    error = %e,
                    "worker unhealthy; replacing process"
                );
                // Dropping the process kills it.
                *process = None;
                if retried || matches!(e, PoolError::Timeout { .. }) {
                    return Err(e);
                }
                retried = true;
            }
            Err(e) => return Err(e),
        }
    }
}
