use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, HomeError>;

#[derive(Error, Debug)]
pub enum HomeError {
    #[error("no home directory available and GRIMOIRE_HOME is not set")]
    NoHomeDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid env key '{0}' (expected [A-Z_][A-Z0-9_]*)")]
    InvalidKey(String),

    #[error("timed out acquiring lock at {}", .0.display())]
    LockTimeout(PathBuf),

    #[error("unresolved placeholder '${{{0}}}'")]
    UnresolvedPlaceholder(String),
}
