use crate::error::{HomeError, Result};
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime};

/// Tuning knobs for [`DirLock::acquire_with`]. The defaults are the
/// production values; tests shrink them.
#[derive(Clone, Copy, Debug)]
pub struct DirLockOptions {
    /// A sentinel older than this is considered abandoned and stolen.
    pub stale_after: Duration,
    /// Total time to spend trying before giving up.
    pub budget: Duration,
}

impl Default for DirLockOptions {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(5),
            budget: Duration::from_secs(5),
        }
    }
}

const BACKOFF_START: Duration = Duration::from_millis(50);
const BACKOFF_FACTOR: f64 = 1.5;
const BACKOFF_CAP: Duration = Duration::from_millis(500);

/// Cross-process lock backed by an atomically-created sentinel directory.
///
/// `mkdir` either creates the directory or fails with `AlreadyExists`, on
/// every platform and filesystem we care about, which makes it a reliable
/// mutual-exclusion primitive between independent processes. A crashed
/// holder leaves the sentinel behind; acquirers steal it once it is older
/// than `stale_after`.
#[derive(Debug)]
pub struct DirLock {
    path: PathBuf,
    held: bool,
}

impl DirLock {
    pub async fn acquire(path: PathBuf) -> Result<Self> {
        Self::acquire_with(path, DirLockOptions::default()).await
    }

    pub async fn acquire_with(path: PathBuf, options: DirLockOptions) -> Result<Self> {
        let deadline = Instant::now() + options.budget;
        let mut backoff = BACKOFF_START;

        loop {
            match std::fs::create_dir(&path) {
                Ok(()) => return Ok(Self { path, held: true }),
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    if sentinel_age(&path).is_some_and(|age| age > options.stale_after) {
                        log::warn!(
                            "stealing stale lock at {} (holder presumed dead)",
                            path.display()
                        );
                        let _ = std::fs::remove_dir(&path);
                        // Re-race the mkdir immediately; another process may
                        // have removed the sentinel first.
                        continue;
                    }
                }
                Err(err) => return Err(err.into()),
            }

            if Instant::now() >= deadline {
                return Err(HomeError::LockTimeout(path));
            }
            tokio::time::sleep(backoff).await;
            backoff = Duration::from_secs_f64(
                (backoff.as_secs_f64() * BACKOFF_FACTOR).min(BACKOFF_CAP.as_secs_f64()),
            );
        }
    }

    /// Release eagerly instead of waiting for Drop.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.held {
            self.held = false;
            if let Err(err) = std::fs::remove_dir(&self.path) {
                log::warn!("failed to release lock {}: {err}", self.path.display());
            }
        }
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        self.release_inner();
    }
}

fn sentinel_age(path: &std::path::Path) -> Option<Duration> {
    let meta = std::fs::metadata(path).ok()?;
    let stamp = meta.modified().or_else(|_| meta.created()).ok()?;
    SystemTime::now().duration_since(stamp).ok()
}
