//! Mutual exclusion between passes.
//!
//! Only one tick may run passes at a time. [`LocalLock`] serializes ticks
//! within one process; [`FileLock`] extends that to every process on the
//! machine sharing the same lock file.

use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fs2::FileExt;
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep, timeout};
use tracing::debug;

use crate::error::{MirrorError, MirrorResult};

const LOCK_FILE: &str = "sync.lock";
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Held for the duration of a tick; the lock is released on drop.
pub struct PassGuard {
    _inner: Box<dyn Send + Sync>,
}

impl PassGuard {
    fn new(inner: impl Send + Sync + 'static) -> Self {
        PassGuard {
            _inner: Box::new(inner),
        }
    }
}

impl std::fmt::Debug for PassGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PassGuard")
    }
}

#[async_trait]
pub trait PassLock: Send + Sync {
    /// Wait up to `wait` for the lock; `LockTimeout` when it stays taken.
    async fn acquire(&self, wait: Duration) -> MirrorResult<PassGuard>;
}

#[derive(Debug, Clone, Default)]
pub struct LocalLock {
    mutex: Arc<Mutex<()>>,
}

impl LocalLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PassLock for LocalLock {
    async fn acquire(&self, wait: Duration) -> MirrorResult<PassGuard> {
        let guard = timeout(wait, self.mutex.clone().lock_owned())
            .await
            .map_err(|_| MirrorError::LockTimeout(wait))?;
        Ok(PassGuard::new(guard))
    }
}

/// Advisory exclusive lock on a file.
#[derive(Debug, Clone)]
pub struct FileLock {
    path: PathBuf,
}

impl FileLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileLock { path: path.into() }
    }

    /// `calmirror/sync.lock` under the runtime directory, or the cache
    /// directory where there is none.
    pub fn default_path() -> MirrorResult<PathBuf> {
        let runtime_dir = dirs::runtime_dir()
            .or_else(dirs::cache_dir)
            .ok_or_else(|| MirrorError::Config("Could not determine runtime directory".into()))?;
        Ok(runtime_dir.join("calmirror").join(LOCK_FILE))
    }

    fn open(&self) -> MirrorResult<File> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        Ok(OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.path)?)
    }
}

#[async_trait]
impl PassLock for FileLock {
    async fn acquire(&self, wait: Duration) -> MirrorResult<PassGuard> {
        let file = self.open()?;
        let deadline = Instant::now() + wait;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(PassGuard::new(file)),
                Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(MirrorError::LockTimeout(wait));
                    }
                    debug!(path = %self.path.display(), "Sync lock is held, waiting");
                    sleep(POLL_INTERVAL.min(deadline - now)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
