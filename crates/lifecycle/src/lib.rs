//! # Grimoire Lifecycle
//!
//! Owns every live backend: spawns/connects child MCP servers (stdio
//! child process, streamable HTTP, or SSE), tracks conversational turns,
//! retires backends idle past the threshold, and reaps orphan child PIDs
//! left behind by a crashed previous gateway.
//!
//! The connection map is the single source of truth for what is active;
//! everything else (the gateway's tool surface, the persisted PID map)
//! derives from it.

mod auth;
mod client;
mod error;
mod manager;
mod process;

pub use auth::{build_auth_provider, AuthProvider, StaticAuthProvider, TokenSource};
pub use client::{BackendEvent, SpawnedBackend};
pub use error::{LifecycleError, Result};
pub use manager::{
    LifecycleManager, SpellLifecycle, DEFAULT_CALL_TIMEOUT, DEFAULT_IDLE_THRESHOLD,
    HTTP_SPAWN_TIMEOUT, STDIO_SPAWN_TIMEOUT,
};
pub use process::process_alive;
