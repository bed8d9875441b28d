use crate::error::{HomeError, Result};
use once_cell::sync::Lazy;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const ENV_GRIMOIRE_HOME: &str = "GRIMOIRE_HOME";
pub const EMBEDDINGS_FILE_NAME: &str = "embeddings.msgpack";
pub const ENV_FILE_NAME: &str = ".env";
pub const ENV_LOCK_DIR_NAME: &str = ".env.lock";

const GRIMOIRE_DIR_NAME: &str = ".grimoire";

static CACHED_HOME: Lazy<Mutex<Option<PathBuf>>> = Lazy::new(|| Mutex::new(None));

/// Handle to the grimoire directory and the well-known paths inside it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GrimoireHome {
    dir: PathBuf,
}

impl GrimoireHome {
    /// Resolve the grimoire directory: `GRIMOIRE_HOME` wins, then
    /// `~/.grimoire`. The result is cached process-wide; tests that mutate
    /// the env var call [`reset_cached_home`] first.
    pub fn resolve() -> Result<Self> {
        let mut cached = CACHED_HOME.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(dir) = cached.as_ref() {
            return Ok(Self { dir: dir.clone() });
        }
        let dir = resolve_uncached()?;
        *cached = Some(dir.clone());
        Ok(Self { dir })
    }

    /// Use an explicit directory, bypassing env resolution and the cache.
    pub fn at(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Create the directory if needed. On POSIX, permissions are tightened
    /// to owner-only because the directory holds `.env` secrets.
    pub fn ensure_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&self.dir)?.permissions();
            perms.set_mode(0o700);
            std::fs::set_permissions(&self.dir, perms)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn embeddings_path(&self) -> PathBuf {
        self.dir.join(EMBEDDINGS_FILE_NAME)
    }

    #[must_use]
    pub fn env_path(&self) -> PathBuf {
        self.dir.join(ENV_FILE_NAME)
    }

    #[must_use]
    pub fn env_lock_path(&self) -> PathBuf {
        self.dir.join(ENV_LOCK_DIR_NAME)
    }
}

fn resolve_uncached() -> Result<PathBuf> {
    if let Ok(value) = std::env::var(ENV_GRIMOIRE_HOME) {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            return Ok(absolutize(PathBuf::from(trimmed)));
        }
    }
    dirs::home_dir()
        .map(|home| home.join(GRIMOIRE_DIR_NAME))
        .ok_or(HomeError::NoHomeDir)
}

fn absolutize(path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        return path;
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path,
    }
}

/// Drop the cached directory so the next [`GrimoireHome::resolve`] re-reads
/// the environment.
pub fn reset_cached_home() {
    let mut cached = CACHED_HOME.lock().unwrap_or_else(|e| e.into_inner());
    *cached = None;
}
