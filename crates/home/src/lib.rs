//! # Grimoire Home
//!
//! Locates the grimoire directory (spell definitions, embedding cache,
//! shared `.env` secrets) and provides the cross-process `.env` store.
//!
//! Resolution order for the directory, first hit wins:
//!
//! 1. the `GRIMOIRE_HOME` environment variable (tests point it at a tempdir);
//! 2. `~/.grimoire`.
//!
//! The `.env` file is shared between the gateway and the spell-authoring
//! tooling, which may run as an independent process. Writes are serialised
//! by a sentinel-directory lock, so concurrent writers from distinct
//! processes remain safe.

mod env_file;
mod error;
mod lock;
mod paths;

pub use env_file::{
    is_valid_env_key, namespaced_key, placeholder_name, resolve_placeholders, EnvFile, EnvStore,
};
pub use error::{HomeError, Result};
pub use lock::{DirLock, DirLockOptions};
pub use paths::{
    reset_cached_home, GrimoireHome, EMBEDDINGS_FILE_NAME, ENV_FILE_NAME, ENV_GRIMOIRE_HOME,
    ENV_LOCK_DIR_NAME,
};
