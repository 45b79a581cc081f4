//! Operator pool: storage operators and array handles served in-process or by
//! `arraystore-worker` processes over framed JSON on stdin/stdout.

pub mod client;
pub mod error;
pub mod handle;
pub mod pool;
pub mod protocol;
pub mod proxy;
pub mod worker;

pub use client::{worker_executable_path, WorkerClient};
pub use error::{PoolError, PoolResult};
pub use handle::{ArrayHandle, RemoteArray};
pub use pool::{OperatorPool, PoolOptions};
pub use proxy::RemoteOperator;
pub use worker::{serve, WorkerState};
