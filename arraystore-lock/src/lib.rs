//! Advisory mutual exclusion over a storage path.
//!
//! A lock is a group at `<path>/` whose `.zattrs` sidecar records the owner's session token. The
//! sidecar is created exclusively, then re-read after a short delay to confirm ownership. No lock
//! service is involved, so any backend supporting exclusive create can be locked.

use std::{
    collections::HashSet,
    sync::Arc,
    time::{Duration, Instant},
};

use arraystore_config::CONFIG;
use arraystore_storage::{
    join_path, Content, ReadMode, StorageError, StorageOperations, ATTRIBUTES_KEY,
};
use serde::{Deserialize, Serialize};

pub mod error;

pub use error::{LockError, LockResult};

const GROUP_KEY: &str = ".zgroup";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockOptions {
    /// Sleep between attempts while the lock is held elsewhere.
    pub poll_interval: Duration,
    /// Delay between creating the record and confirming it.
    pub confirm_delay: Duration,
    /// Non-blocking acquires fail at once with [`LockError::Unavailable`].
    pub blocking: bool,
    pub timeout: Option<Duration>,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            poll_interval: CONFIG.lock_poll_interval(),
            confirm_delay: CONFIG.lock_confirm_delay(),
            blocking: true,
            timeout: None,
        }
    }
}

impl LockOptions {
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_confirm_delay(mut self, confirm_delay: Duration) -> Self {
        self.confirm_delay = confirm_delay;
        self
    }

    pub fn with_blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Contents of a lock object's attribute sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub str_uuid_lock: String,
    /// Creation time, seconds since the Unix epoch.
    pub time: i64,
}

impl LockRecord {
    pub fn new(owner: &str) -> Self {
        Self {
            str_uuid_lock: owner.to_string(),
            time: chrono::Utc::now().timestamp(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Acquisition {
    Acquired,
    AlreadyHeld,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Release {
    Released,
    NotHeld,
    /// The record is missing or names another owner. Nothing was deleted and the path is still
    /// considered held.
    OwnershipViolation,
}

/// Lock paths always end with `/`.
pub fn normalize(path: &str) -> String {
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{path}/")
    }
}

/// Spin-lock coordinator bound to one storage operator and one session identity.
#[derive(Debug)]
pub struct SpinLock {
    operator: Arc<dyn StorageOperations>,
    identity: String,
    options: LockOptions,
    held: parking_lot::Mutex<HashSet<String>>,
}

impl SpinLock {
    pub fn new(operator: Arc<dyn StorageOperations>, options: LockOptions) -> Self {
        Self {
            operator,
            identity: uuid::Uuid::new_v4().to_string(),
            options,
            held: parking_lot::Mutex::new(HashSet::new()),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn options(&self) -> &LockOptions {
        &self.options
    }

    /// Paths currently held, sorted.
    pub fn held(&self) -> Vec<String> {
        let mut held: Vec<String> = self.held.lock().iter().cloned().collect();
        held.sort();
        held
    }

    pub fn is_held(&self, path: &str) -> bool {
        self.held.lock().contains(&normalize(path))
    }

    pub async fn acquire(&self, path: &str) -> LockResult<Acquisition> {
        let path = normalize(path);
        if self.held.lock().contains(&path) {
            return Ok(Acquisition::AlreadyHeld);
        }

        let sidecar = join_path(&path, ATTRIBUTES_KEY);
        let started = Instant::now();
        loop {
            let record = LockRecord::new(&self.identity);
            let body = serde_json::to_string(&record).map_err(|e| LockError::InvalidRecord {
                path: sidecar.clone(),
                message: e.to_string(),
            })?;

            match self
                .operator
                .create_exclusive(&sidecar, Content::Text(body))
                .await
            {
                Ok(()) => {
                    tokio::time::sleep(self.options.confirm_delay).await;
                    match self.owner(&path).await {
                        Ok(owner) if owner.as_deref() == Some(self.identity.as_str()) => {
                            return Ok(self.take(&path).await);
                        }
                        Ok(_) => tracing::warn!(
                            path = %path,
                            "lock record changed owner before confirmation"
                        ),
                        Err(e) => {
                            self.abandon(&path).await;
                            return Err(e);
                        }
                    }
                }
                Err(StorageError::AlreadyExists { .. }) => {
                    // A record naming this identity is left over from an unconfirmed attempt.
                    match self.owner(&path).await {
                        Ok(Some(owner)) if owner == self.identity => {
                            tracing::info!(path = %path, "adopting own unconfirmed lock record");
                            return Ok(self.take(&path).await);
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::debug!(path = %path, error = %e, "lock owner unreadable")
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            }

            if !self.options.blocking {
                return Err(LockError::Unavailable { path });
            }
            self.check_deadline(&path, started)?;
            tokio::time::sleep(self.options.poll_interval).await;
        }
    }

    pub async fn release(&self, path: &str) -> LockResult<Release> {
        let path = normalize(path);
        if !self.held.lock().contains(&path) {
            return Ok(Release::NotHeld);
        }

        let owner = match self.owner(&path).await {
            Ok(owner) => owner,
            Err(LockError::InvalidRecord { message, .. }) => Some(format!("<invalid: {message}>")),
            Err(e) => return Err(e),
        };
        if owner.as_deref() != Some(self.identity.as_str()) {
            tracing::error!(
                path = %path,
                expected = %self.identity,
                found = ?owner,
                "LockOwnershipViolation: lock record does not name this holder, leaving it in place"
            );
            return Ok(Release::OwnershipViolation);
        }

        self.operator.remove_one(&path, true).await?;
        self.held.lock().remove(&path);
        tracing::debug!(path = %path, identity = %self.identity, "lock released");
        Ok(Release::Released)
    }

    /// Releases every held path. Stops at the first storage failure.
    pub async fn release_all(&self) -> LockResult<Vec<(String, Release)>> {
        let mut outcomes = Vec::new();
        for path in self.held() {
            let outcome = self.release(&path).await?;
            outcomes.push((path, outcome));
        }
        Ok(outcomes)
    }

    /// Whether anyone holds a lock on `path`.
    pub async fn check(&self, path: &str) -> LockResult<bool> {
        let sidecar = join_path(&normalize(path), ATTRIBUTES_KEY);
        Ok(self.operator.exists_one(&sidecar).await?)
    }

    /// Polls until nobody holds `path`. Returns at once when this coordinator holds it.
    pub async fn wait(&self, path: &str) -> LockResult<()> {
        let path = normalize(path);
        if self.held.lock().contains(&path) {
            return Ok(());
        }
        let started = Instant::now();
        while self.check(&path).await? {
            self.check_deadline(&path, started)?;
            tokio::time::sleep(self.options.poll_interval).await;
        }
        Ok(())
    }

    /// Owner recorded at `path`, `None` when there is no record.
    pub async fn owner(&self, path: &str) -> LockResult<Option<String>> {
        let sidecar = join_path(&normalize(path), ATTRIBUTES_KEY);
        let content = match self.operator.read_one(&sidecar, ReadMode::Text).await {
            Ok(content) => content,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record: LockRecord =
            serde_json::from_slice(content.as_bytes()).map_err(|e| LockError::InvalidRecord {
                path: sidecar,
                message: e.to_string(),
            })?;
        Ok(Some(record.str_uuid_lock))
    }

    async fn take(&self, path: &str) -> Acquisition {
        self.held.lock().insert(path.to_string());
        self.mark_group(path).await;
        tracing::debug!(path = %path, identity = %self.identity, "lock acquired");
        Acquisition::Acquired
    }

    /// Best-effort removal of a record this coordinator created but could not confirm.
    async fn abandon(&self, path: &str) {
        match self.owner(path).await {
            Ok(Some(owner)) if owner == self.identity => {
                if let Err(e) = self.operator.remove_one(path, true).await {
                    tracing::warn!(path = %path, error = %e, "failed to remove unconfirmed lock");
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(path = %path, error = %e, "unconfirmed lock record left in place")
            }
        }
    }

    fn check_deadline(&self, path: &str, started: Instant) -> LockResult<()> {
        match self.options.timeout {
            Some(timeout) if started.elapsed() + self.options.poll_interval > timeout => {
                Err(LockError::Timeout {
                    path: path.to_string(),
                    waited_ms: started.elapsed().as_millis() as u64,
                })
            }
            _ => Ok(()),
        }
    }

    async fn mark_group(&self, path: &str) {
        let marker = join_path(path, GROUP_KEY);
        if let Err(e) = self
            .operator
            .write_one(&marker, Content::from(r#"{"zarr_format": 2}"#))
            .await
        {
            tracing::warn!(path = %marker, error = %e, "failed to write lock group marker");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use arraystore_storage::{Attributes, StorageOperator, StorageOptions, StorageResult};
    use indexmap::IndexMap;

    /// Fails the next `failures` reads with `Unavailable`, delegating everything else.
    #[derive(Debug)]
    struct FlakyReads {
        inner: Arc<dyn StorageOperations>,
        failures: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl StorageOperations for FlakyReads {
        async fn exists(&self, paths: Vec<String>) -> Vec<StorageResult<bool>> {
            self.inner.exists(paths).await
        }

        async fn read(&self, paths: Vec<String>, mode: ReadMode) -> Vec<StorageResult<Content>> {
            let failing = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return paths
                    .iter()
                    .map(|p| Err(StorageError::unavailable(p, "transient")))
                    .collect();
            }
            self.inner.read(paths, mode).await
        }

        async fn write(&self, entries: IndexMap<String, Content>) -> Vec<StorageResult<()>> {
            self.inner.write(entries).await
        }

        async fn remove(&self, paths: Vec<String>, recursive: bool) -> Vec<StorageResult<()>> {
            self.inner.remove(paths, recursive).await
        }

        async fn make_dirs(&self, paths: Vec<String>) -> Vec<StorageResult<()>> {
            self.inner.make_dirs(paths).await
        }

        async fn copy(&self, pairs: Vec<(String, String)>) -> Vec<StorageResult<()>> {
            self.inner.copy(pairs).await
        }

        async fn rename(&self, pairs: Vec<(String, String)>) -> Vec<StorageResult<()>> {
            self.inner.rename(pairs).await
        }

        async fn list_dir(&self, path: &str) -> StorageResult<Vec<String>> {
            self.inner.list_dir(path).await
        }

        async fn get_metadata(&self, path: &str) -> StorageResult<Attributes> {
            self.inner.get_metadata(path).await
        }

        async fn set_metadata(&self, path: &str, attributes: Attributes) -> StorageResult<()> {
            self.inner.set_metadata(path, attributes).await
        }

        async fn create_exclusive(&self, path: &str, content: Content) -> StorageResult<()> {
            self.inner.create_exclusive(path, content).await
        }
    }

    fn flaky(root: &tempfile::TempDir, failures: usize) -> Arc<FlakyReads> {
        Arc::new(FlakyReads {
            inner: operator(root),
            failures: AtomicUsize::new(failures),
        })
    }

    fn operator(root: &tempfile::TempDir) -> Arc<dyn StorageOperations> {
        let operator = StorageOperator::new(
            StorageOptions::default().with_scratch_root(root.path().join("scratch")),
        )
        .unwrap();
        operator.register_object_store(
            "bucket",
            Arc::new(object_store::memory::InMemory::new()),
        );
        Arc::new(operator)
    }

    fn fast() -> LockOptions {
        LockOptions::default()
            .with_poll_interval(Duration::from_millis(10))
            .with_confirm_delay(Duration::from_millis(10))
    }

    fn lock_path(root: &tempfile::TempDir) -> String {
        root.path().join("resource").to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn acquire_is_idempotent_and_release_twice_is_noop() {
        let root = tempfile::tempdir().unwrap();
        let lock = SpinLock::new(operator(&root), fast());
        let path = lock_path(&root);

        assert_eq!(lock.acquire(&path).await.unwrap(), Acquisition::Acquired);
        assert_eq!(lock.acquire(&path).await.unwrap(), Acquisition::AlreadyHeld);
        assert_eq!(
            lock.acquire(&format!("{path}/")).await.unwrap(),
            Acquisition::AlreadyHeld
        );
        assert!(lock.check(&path).await.unwrap());
        assert_eq!(
            lock.owner(&path).await.unwrap().as_deref(),
            Some(lock.identity())
        );
        assert_eq!(lock.held(), vec![normalize(&path)]);

        assert_eq!(lock.release(&path).await.unwrap(), Release::Released);
        assert_eq!(lock.release(&path).await.unwrap(), Release::NotHeld);
        assert!(!lock.check(&path).await.unwrap());
        assert!(lock.held().is_empty());
    }

    #[tokio::test]
    async fn non_blocking_acquire_fails_while_held_elsewhere() {
        let root = tempfile::tempdir().unwrap();
        let operator = operator(&root);
        let owner = SpinLock::new(operator.clone(), fast());
        let other = SpinLock::new(operator, fast().with_blocking(false));

        for path in [lock_path(&root), "s3://bucket/locks/resource".to_string()] {
            owner.acquire(&path).await.unwrap();
            assert_eq!(
                other.acquire(&path).await,
                Err(LockError::Unavailable {
                    path: normalize(&path)
                })
            );
            assert_eq!(other.release(&path).await.unwrap(), Release::NotHeld);
            owner.release(&path).await.unwrap();
            assert_eq!(other.acquire(&path).await.unwrap(), Acquisition::Acquired);
            other.release(&path).await.unwrap();
        }
    }

    #[tokio::test]
    async fn blocking_acquire_waits_for_release() {
        let root = tempfile::tempdir().unwrap();
        let operator = operator(&root);
        let owner = SpinLock::new(operator.clone(), fast());
        let other = Arc::new(SpinLock::new(operator, fast()));
        let path = lock_path(&root);

        owner.acquire(&path).await.unwrap();
        let waiter = tokio::spawn({
            let other = other.clone();
            let path = path.clone();
            async move { other.acquire(&path).await }
        });

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!waiter.is_finished());

        owner.release(&path).await.unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), Acquisition::Acquired);
        assert_eq!(
            owner.owner(&path).await.unwrap().as_deref(),
            Some(other.identity())
        );
    }

    #[tokio::test]
    async fn exactly_one_concurrent_contender_wins() {
        let root = tempfile::tempdir().unwrap();
        let operator = operator(&root);
        let path = lock_path(&root);

        let contenders: Vec<_> = (0..8)
            .map(|_| {
                let lock = SpinLock::new(operator.clone(), fast().with_blocking(false));
                let path = path.clone();
                tokio::spawn(async move { lock.acquire(&path).await })
            })
            .collect();

        let mut winners = 0;
        for contender in contenders {
            match contender.await.unwrap() {
                Ok(Acquisition::Acquired) => winners += 1,
                Err(LockError::Unavailable { .. }) => {}
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn foreign_record_is_never_deleted() {
        let root = tempfile::tempdir().unwrap();
        let operator = operator(&root);
        let lock = SpinLock::new(operator.clone(), fast());
        let path = lock_path(&root);

        lock.acquire(&path).await.unwrap();
        let forged = serde_json::to_string(&LockRecord::new("someone-else")).unwrap();
        operator
            .write_one(&join_path(&normalize(&path), ATTRIBUTES_KEY), Content::Text(forged))
            .await
            .unwrap();

        assert_eq!(
            lock.release(&path).await.unwrap(),
            Release::OwnershipViolation
        );
        assert!(lock.is_held(&path));
        assert!(lock.check(&path).await.unwrap());
        assert_eq!(
            lock.owner(&path).await.unwrap().as_deref(),
            Some("someone-else")
        );
    }

    #[tokio::test]
    async fn timeout_bounds_blocking_acquire_and_wait() {
        let root = tempfile::tempdir().unwrap();
        let operator = operator(&root);
        let owner = SpinLock::new(operator.clone(), fast());
        let other = SpinLock::new(
            operator,
            fast().with_timeout(Some(Duration::from_millis(60))),
        );
        let path = lock_path(&root);

        owner.acquire(&path).await.unwrap();
        assert!(matches!(
            other.acquire(&path).await,
            Err(LockError::Timeout { .. })
        ));
        assert!(matches!(
            other.wait(&path).await,
            Err(LockError::Timeout { .. })
        ));

        // The holder never waits on itself.
        owner.wait(&path).await.unwrap();
        owner.release(&path).await.unwrap();
        other.wait(&path).await.unwrap();
    }

    #[tokio::test]
    async fn release_all_drops_every_path() {
        let root = tempfile::tempdir().unwrap();
        let lock = SpinLock::new(operator(&root), fast());
        let a = root.path().join("a").to_string_lossy().into_owned();
        let b = "s3://bucket/b".to_string();

        lock.acquire(&a).await.unwrap();
        lock.acquire(&b).await.unwrap();
        let outcomes = lock.release_all().await.unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|(_, r)| *r == Release::Released));
        assert!(!lock.check(&a).await.unwrap());
        assert!(!lock.check(&b).await.unwrap());
    }

    #[tokio::test]
    async fn failed_confirmation_removes_own_record() {
        let root = tempfile::tempdir().unwrap();
        let storage = flaky(&root, 1);
        let lock = SpinLock::new(storage.clone(), fast().with_blocking(false));
        let path = lock_path(&root);

        assert!(matches!(
            lock.acquire(&path).await,
            Err(LockError::Storage(StorageError::Unavailable { .. }))
        ));
        assert!(lock.held().is_empty());
        assert!(!lock.check(&path).await.unwrap());

        assert_eq!(lock.acquire(&path).await.unwrap(), Acquisition::Acquired);
        assert_eq!(lock.release(&path).await.unwrap(), Release::Released);
    }

    #[tokio::test]
    async fn leftover_own_record_is_adopted() {
        let root = tempfile::tempdir().unwrap();
        // Both the confirmation read and the cleanup read fail, so the record stays behind.
        let storage = flaky(&root, 2);
        let lock = SpinLock::new(
            storage.clone(),
            fast().with_timeout(Some(Duration::from_millis(200))),
        );
        let other = SpinLock::new(storage, fast().with_blocking(false));
        let path = lock_path(&root);

        assert!(lock.acquire(&path).await.is_err());
        assert!(!lock.is_held(&path));
        assert_eq!(
            lock.owner(&path).await.unwrap().as_deref(),
            Some(lock.identity())
        );

        assert!(matches!(
            other.acquire(&path).await,
            Err(LockError::Unavailable { .. })
        ));
        assert_eq!(lock.acquire(&path).await.unwrap(), Acquisition::Acquired);
        assert!(lock.is_held(&path));
        assert_eq!(lock.release(&path).await.unwrap(), Release::Released);
        assert!(!lock.check(&path).await.unwrap());
    }
}
