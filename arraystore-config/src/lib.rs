use std::{path::PathBuf, time::Duration};

use envconfig::Envconfig;
use lazy_static::lazy_static;

#[derive(Debug, Envconfig)]
pub struct Config {
    #[envconfig(from = "ARRAYSTORE_LOG_LEVEL", default = "info")]
    pub log_level: String,
    /// Root under which every storage operator creates its private scratch directory.
    #[envconfig(from = "ARRAYSTORE_SCRATCH_ROOT")]
    pub scratch_root: Option<PathBuf>,
    #[envconfig(from = "ARRAYSTORE_POOL_WORKERS", default = "0")]
    pub pool_workers: usize,
    /// Overrides the path of the `arraystore-worker` executable.
    #[envconfig(from = "ARRAYSTORE_WORKER")]
    pub worker_executable: Option<PathBuf>,
    //Per request timeout in ms for pool workers, 0 disables it
    #[envconfig(from = "ARRAYSTORE_WORKER_REQUEST_TIMEOUT_MS", default = "0")]
    pub worker_request_timeout_ms: u64,
    #[envconfig(from = "ARRAYSTORE_LOCK_POLL_INTERVAL_MS", default = "100")]
    pub lock_poll_interval_ms: u64,
    #[envconfig(from = "ARRAYSTORE_LOCK_CONFIRM_DELAY_MS", default = "100")]
    pub lock_confirm_delay_ms: u64,
    /// Number of paths processed concurrently per backend within one batch call.
    #[envconfig(from = "ARRAYSTORE_BATCH_CONCURRENCY", default = "32")]
    pub batch_concurrency: usize,
    #[envconfig(from = "ARRAYSTORE_HTTP_TIMEOUT_MS", default = "30000")]
    pub http_timeout_ms: u64,
}

impl Config {
    pub fn init() -> Config {
        Config::init_from_env().expect("Failed to load config")
    }

    pub fn worker_request_timeout(&self) -> Option<Duration> {
        if self.worker_request_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.worker_request_timeout_ms))
        }
    }

    pub fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock_poll_interval_ms)
    }

    pub fn lock_confirm_delay(&self) -> Duration {
        Duration::from_millis(self.lock_confirm_delay_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }
}

lazy_static! {
    pub static ref CONFIG: Config = Config::init();
    /// The directory holding per-operator scratch directories.
    pub static ref SCRATCH_ROOT: PathBuf = CONFIG
        .scratch_root
        .clone()
        .unwrap_or_else(|| std::env::temp_dir().join("arraystore"));
}
