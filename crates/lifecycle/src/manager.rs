use crate::auth::{build_auth_provider, TokenSource};
use crate::client::{self, BackendClientHandler, BackendEvent, SpawnedBackend};
use crate::error::{LifecycleError, Result};
use crate::process::{process_alive, terminate_pid};
use async_trait::async_trait;
use grimoire_embedding_store::EmbeddingStore;
use grimoire_home::{resolve_placeholders, EnvFile, EnvStore};
use grimoire_spellbook::{ServerConfig, Spell};
use rmcp::model::{CallToolRequestParam, CallToolResult, JsonObject, Tool};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

/// Idle turns tolerated before a backend is retired.
pub const DEFAULT_IDLE_THRESHOLD: u64 = 5;

/// Spawn budgets. stdio gets longer because `npx`-style commands may
/// install packages on first run.
pub const STDIO_SPAWN_TIMEOUT: Duration = Duration::from_secs(30);
pub const HTTP_SPAWN_TIMEOUT: Duration = Duration::from_secs(15);

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// One live backend. Owned exclusively by the manager; everything outside
/// interacts through the manager's operations.
struct ActiveConnection {
    client: rmcp::service::RunningService<rmcp::service::RoleClient, BackendClientHandler>,
    tools: Vec<Tool>,
    tool_names: HashSet<String>,
    pid: Option<u32>,
}

/// Seam between the gateway and backend management; tests substitute it.
#[async_trait]
pub trait SpellLifecycle: Send + Sync {
    /// Activate a spell (idempotent) and return its tool descriptors.
    async fn spawn(&self, spell: &Spell) -> Result<Vec<Tool>>;

    async fn is_active(&self, name: &str) -> bool;
    async fn active_spells(&self) -> Vec<String>;

    /// Tool descriptors of every active backend, activation order not
    /// guaranteed.
    async fn active_tools(&self) -> Vec<Tool>;

    /// Which active spell exposes `tool`, if any.
    async fn find_tool_owner(&self, tool: &str) -> Option<String>;

    /// Forward a tool call to the owning backend.
    async fn call_tool(
        &self,
        spell: &str,
        tool: &str,
        args: Option<JsonObject>,
        timeout: Option<Duration>,
    ) -> Result<CallToolResult>;

    async fn mark_used(&self, name: &str);

    /// Advance the turn counter; returns the new value.
    async fn increment_turn(&self) -> u64;

    /// Retire every backend idle for more than `threshold` turns; returns
    /// the names killed.
    async fn cleanup_inactive(&self, threshold: u64) -> Vec<String>;

    /// Re-fetch one backend's tool list after a `tools/list_changed`.
    async fn refresh_tools(&self, spell: &str) -> Result<()>;

    async fn kill_all(&self);
}

pub struct LifecycleManager {
    connections: Mutex<HashMap<String, ActiveConnection>>,
    store: EmbeddingStore,
    env_store: EnvStore,
    events_tx: mpsc::UnboundedSender<BackendEvent>,
    /// Tool names the gateway itself owns; no backend may shadow them.
    reserved_tools: HashSet<String>,
    token_source: Option<Arc<dyn TokenSource>>,
}

enum InsertOutcome {
    Inserted { pid: Option<u32> },
    /// Another spawn of the same spell won; its tools are the answer and
    /// the losing backend must be torn down.
    Raced {
        backend: SpawnedBackend,
        existing: Vec<Tool>,
    },
    Collision {
        backend: SpawnedBackend,
        tool: String,
    },
}

impl LifecycleManager {
    /// Returns the manager plus the receiver for backend-originated
    /// events (the gateway drains it to emit upstream notifications).
    pub fn new(
        store: EmbeddingStore,
        env_store: EnvStore,
        reserved_tools: HashSet<String>,
        token_source: Option<Arc<dyn TokenSource>>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<BackendEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            connections: Mutex::new(HashMap::new()),
            store,
            env_store,
            events_tx,
            reserved_tools,
            token_source,
        });
        (manager, events_rx)
    }

    /// Startup pass over persisted lifecycle state: probe each recorded
    /// child PID and kill survivors (orphans of a crashed previous
    /// gateway), then clear the PID map. The turn counter and last-used
    /// map stay as loaded. Returns the PIDs that had to be reaped.
    pub async fn load_from_storage(&self) -> Vec<u32> {
        let meta = self.store.lifecycle();
        let mut reaped = Vec::new();
        for (name, pid) in &meta.active_pids {
            #[allow(clippy::cast_possible_wrap)]
            let pid_i = *pid as i32;
            if process_alive(pid_i) {
                log::warn!("reaping orphan backend '{name}' (pid {pid}) from a previous run");
                terminate_pid(pid_i).await;
                reaped.push(*pid);
            } else {
                log::debug!("recorded pid {pid} for '{name}' is already gone");
            }
        }
        self.store.update_lifecycle(|meta| meta.active_pids.clear());
        log::info!(
            "lifecycle state restored: turn {}, {} spell(s) previously tracked",
            meta.turn_counter,
            meta.last_used_turn.len()
        );
        reaped
    }

    async fn connect_backend(&self, spell: &Spell) -> Result<(SpawnedBackend, Vec<Tool>)> {
        let handler = BackendClientHandler::new(spell.name.clone(), self.events_tx.clone());
        let env_file = self
            .env_store
            .load()
            .await
            .map_err(|err| LifecycleError::SpawnFailed {
                spell: spell.name.clone(),
                detail: format!("env store unreadable: {err}"),
            })?;

        let backend = match &spell.server {
            ServerConfig::Stdio { command, args, env } => {
                let resolved = resolve_spawn_env(&spell.name, env, &env_file)?;
                client::connect_stdio(&spell.name, command, args, &resolved, handler).await?
            }
            ServerConfig::Http { url, auth, headers } => {
                let provider = build_auth_provider(
                    &spell.name,
                    auth.as_ref(),
                    headers,
                    &env_file,
                    self.token_source.clone(),
                )?;
                client::connect_http(&spell.name, url, &provider, handler).await?
            }
            ServerConfig::Sse { url, auth, headers } => {
                let provider = build_auth_provider(
                    &spell.name,
                    auth.as_ref(),
                    headers,
                    &env_file,
                    self.token_source.clone(),
                )?;
                client::connect_sse(&spell.name, url, &provider, handler).await?
            }
        };

        let tools = backend
            .service
            .peer()
            .list_all_tools()
            .await
            .map_err(|err| LifecycleError::SpawnFailed {
                spell: spell.name.clone(),
                detail: format!("tools/list failed: {err}"),
            })?;
        Ok((backend, tools))
    }

    /// Insert the freshly-connected backend unless it lost a race or one
    /// of its tool names is already exposed. Pure map work; no awaits
    /// inside the critical section.
    async fn try_insert(
        &self,
        spell_name: &str,
        backend: SpawnedBackend,
        tools: &[Tool],
    ) -> InsertOutcome {
        let mut connections = self.connections.lock().await;
        if let Some(existing) = connections.get(spell_name) {
            return InsertOutcome::Raced {
                backend,
                existing: existing.tools.clone(),
            };
        }

        let mut exposed: HashSet<String> = self.reserved_tools.clone();
        for conn in connections.values() {
            exposed.extend(conn.tool_names.iter().cloned());
        }
        let mut tool_names = HashSet::new();
        for tool in tools {
            let name = tool.name.to_string();
            if exposed.contains(&name) || !tool_names.insert(name.clone()) {
                return InsertOutcome::Collision {
                    backend,
                    tool: name,
                };
            }
        }

        let pid = backend.pid;
        connections.insert(
            spell_name.to_string(),
            ActiveConnection {
                client: backend.service,
                tools: tools.to_vec(),
                tool_names,
                pid,
            },
        );
        InsertOutcome::Inserted { pid }
    }

    async fn discard_backend(&self, backend: SpawnedBackend) {
        let pid = backend.pid;
        let _ = backend.service.cancel().await;
        if let Some(pid) = pid {
            #[allow(clippy::cast_possible_wrap)]
            let pid = pid as i32;
            if process_alive(pid) {
                terminate_pid(pid).await;
            }
        }
    }

    /// Tear one connection down: close the client, make sure a stdio
    /// child is really gone, drop its PID from the metadata.
    async fn shutdown_connection(&self, name: &str, conn: ActiveConnection) {
        let pid = conn.pid;
        let _ = conn.client.cancel().await;
        if let Some(pid) = pid {
            #[allow(clippy::cast_possible_wrap)]
            let pid = pid as i32;
            if process_alive(pid) {
                terminate_pid(pid).await;
            }
        }
        self.store.update_lifecycle(|meta| {
            meta.active_pids.remove(name);
        });
    }

    /// Drop a backend that failed mid-call so the next activation starts
    /// fresh.
    async fn retire_failed(&self, name: &str) {
        let removed = {
            let mut connections = self.connections.lock().await;
            connections.remove(name)
        };
        if let Some(conn) = removed {
            log::warn!("backend '{name}' failed; retiring its connection");
            self.shutdown_connection(name, conn).await;
            let _ = self.events_tx.send(BackendEvent::ToolsChanged {
                spell: name.to_string(),
            });
        }
    }
}

#[async_trait]
impl SpellLifecycle for LifecycleManager {
    async fn spawn(&self, spell: &Spell) -> Result<Vec<Tool>> {
        {
            let connections = self.connections.lock().await;
            if let Some(existing) = connections.get(&spell.name) {
                log::debug!("spell '{}' already active", spell.name);
                return Ok(existing.tools.clone());
            }
        }

        let budget = if spell.server.is_stdio() {
            STDIO_SPAWN_TIMEOUT
        } else {
            HTTP_SPAWN_TIMEOUT
        };
        log::info!(
            "activating spell '{}' over {} (budget {}s)",
            spell.name,
            spell.server.transport_name(),
            budget.as_secs()
        );

        let (backend, tools) = match tokio::time::timeout(budget, self.connect_backend(spell)).await
        {
            Ok(connected) => connected?,
            Err(_) => {
                return Err(LifecycleError::Timeout {
                    spell: spell.name.clone(),
                    phase: "spawn",
                    seconds: budget.as_secs(),
                })
            }
        };

        match self.try_insert(&spell.name, backend, &tools).await {
            InsertOutcome::Inserted { pid } => {
                self.store.update_lifecycle(|meta| {
                    if let Some(pid) = pid {
                        meta.active_pids.insert(spell.name.clone(), pid);
                    }
                    let turn = meta.turn_counter;
                    meta.last_used_turn.insert(spell.name.clone(), turn);
                });
                log::info!(
                    "spell '{}' active with {} tool(s)",
                    spell.name,
                    tools.len()
                );
                Ok(tools)
            }
            InsertOutcome::Raced { backend, existing } => {
                self.discard_backend(backend).await;
                Ok(existing)
            }
            InsertOutcome::Collision { backend, tool } => {
                self.discard_backend(backend).await;
                Err(LifecycleError::ToolCollision {
                    spell: spell.name.clone(),
                    tool,
                })
            }
        }
    }

    async fn is_active(&self, name: &str) -> bool {
        self.connections.lock().await.contains_key(name)
    }

    async fn active_spells(&self) -> Vec<String> {
        let mut names: Vec<String> = self.connections.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    async fn active_tools(&self) -> Vec<Tool> {
        let connections = self.connections.lock().await;
        let mut names: Vec<&String> = connections.keys().collect();
        names.sort();
        names
            .into_iter()
            .flat_map(|name| connections[name].tools.clone())
            .collect()
    }

    async fn find_tool_owner(&self, tool: &str) -> Option<String> {
        let connections = self.connections.lock().await;
        connections
            .iter()
            .find(|(_, conn)| conn.tool_names.contains(tool))
            .map(|(name, _)| name.clone())
    }

    async fn call_tool(
        &self,
        spell: &str,
        tool: &str,
        args: Option<JsonObject>,
        timeout: Option<Duration>,
    ) -> Result<CallToolResult> {
        let peer = {
            let connections = self.connections.lock().await;
            connections
                .get(spell)
                .map(|conn| conn.client.peer().clone())
        }
        .ok_or_else(|| LifecycleError::NotActive(spell.to_string()))?;

        let budget = timeout.unwrap_or(DEFAULT_CALL_TIMEOUT);
        let call = peer.call_tool(CallToolRequestParam {
            name: tool.to_string().into(),
            arguments: args,
        });
        match tokio::time::timeout(budget, call).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(err)) => {
                // A transport-level failure, not a tool-reported error;
                // the connection is no longer trustworthy.
                self.retire_failed(spell).await;
                Err(LifecycleError::Backend {
                    spell: spell.to_string(),
                    detail: err.to_string(),
                })
            }
            // On timeout the backend stays available; only this call dies.
            Err(_) => Err(LifecycleError::Timeout {
                spell: spell.to_string(),
                phase: "tool call",
                seconds: budget.as_secs(),
            }),
        }
    }

    async fn mark_used(&self, name: &str) {
        self.store.update_lifecycle(|meta| {
            let turn = meta.turn_counter;
            meta.last_used_turn.insert(name.to_string(), turn);
        });
    }

    async fn increment_turn(&self) -> u64 {
        self.store.update_lifecycle(|meta| {
            meta.turn_counter += 1;
            meta.turn_counter
        })
    }

    async fn cleanup_inactive(&self, threshold: u64) -> Vec<String> {
        let meta = self.store.lifecycle();
        let mut victims = Vec::new();
        {
            let mut connections = self.connections.lock().await;
            let idle: Vec<String> = connections
                .keys()
                .filter(|name| {
                    is_idle(
                        meta.turn_counter,
                        meta.last_used_turn.get(*name).copied(),
                        threshold,
                    )
                })
                .cloned()
                .collect();
            for name in idle {
                if let Some(conn) = connections.remove(&name) {
                    victims.push((name, conn));
                }
            }
        }

        let mut killed = Vec::new();
        for (name, conn) in victims {
            log::info!(
                "retiring '{name}': idle past {threshold} turn(s) at turn {}",
                meta.turn_counter
            );
            self.shutdown_connection(&name, conn).await;
            killed.push(name);
        }
        killed
    }

    async fn refresh_tools(&self, spell: &str) -> Result<()> {
        let peer = {
            let connections = self.connections.lock().await;
            connections
                .get(spell)
                .map(|conn| conn.client.peer().clone())
        }
        .ok_or_else(|| LifecycleError::NotActive(spell.to_string()))?;

        match peer.list_all_tools().await {
            Ok(tools) => {
                let mut connections = self.connections.lock().await;
                if let Some(conn) = connections.get_mut(spell) {
                    conn.tool_names = tools.iter().map(|t| t.name.to_string()).collect();
                    conn.tools = tools;
                }
                Ok(())
            }
            Err(err) => {
                self.retire_failed(spell).await;
                Err(LifecycleError::Backend {
                    spell: spell.to_string(),
                    detail: format!("tools/list refresh failed: {err}"),
                })
            }
        }
    }

    async fn kill_all(&self) {
        let drained: Vec<(String, ActiveConnection)> = {
            let mut connections = self.connections.lock().await;
            connections.drain().collect()
        };
        for (name, conn) in drained {
            log::info!("shutting down backend '{name}'");
            self.shutdown_connection(&name, conn).await;
        }
    }
}

/// Exactly `threshold` idle turns is tolerated; one more is not.
fn is_idle(turn: u64, last_used: Option<u64>, threshold: u64) -> bool {
    turn.saturating_sub(last_used.unwrap_or(0)) > threshold
}

fn resolve_spawn_env(
    spell: &str,
    env: &std::collections::BTreeMap<String, String>,
    env_file: &EnvFile,
) -> Result<HashMap<String, String>> {
    let mut resolved = HashMap::new();
    for (key, value) in env {
        let value =
            resolve_placeholders(value, env_file).map_err(|err| LifecycleError::SpawnFailed {
                spell: spell.to_string(),
                detail: format!("env '{key}': {err}"),
            })?;
        resolved.insert(key.clone(), value);
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn idleness_boundary_is_strict() {
        // Exactly `threshold` turns idle survives; threshold + 1 dies.
        assert!(!is_idle(10, Some(5), 5));
        assert!(is_idle(11, Some(5), 5));
        assert!(!is_idle(5, Some(5), 5));
        assert!(is_idle(6, None, 5));
    }

    /// The worked cleanup example: postgres, stripe and cap-js spawned
    /// over turns 1–8, last used at 3, 7 and 8.
    #[test]
    fn turn_cleanup_schedule() {
        let mut last_used = HashMap::new();
        last_used.insert("postgres".to_string(), 3u64);
        last_used.insert("stripe".to_string(), 7u64);
        last_used.insert("cap-js".to_string(), 8u64);

        let idle_at = |turn: u64, last_used: &HashMap<String, u64>| -> Vec<String> {
            let mut idle: Vec<String> = last_used
                .iter()
                .filter(|(_, used)| turn.saturating_sub(**used) > 5)
                .map(|(name, _)| name.clone())
                .collect();
            idle.sort();
            idle
        };

        // Turn 9: only postgres (9 - 3 = 6 > 5).
        assert_eq!(idle_at(9, &last_used), vec!["postgres".to_string()]);

        // postgres killed; cap-js used again at turn 10.
        last_used.remove("postgres");
        last_used.insert("cap-js".to_string(), 10);

        // Turn 14: stripe (14 - 7 = 7 > 5); cap-js survives (14 - 10 = 4).
        assert_eq!(idle_at(14, &last_used), vec!["stripe".to_string()]);
    }

    #[test]
    fn spawn_env_resolution_reports_the_variable() {
        let mut env = std::collections::BTreeMap::new();
        env.insert(
            "API_PASSWORD".to_string(),
            "${PM__MISSING_PASSWORD}".to_string(),
        );
        let err = resolve_spawn_env("project-manager", &env, &EnvFile::default())
            .expect_err("unresolved placeholder must fail the spawn");
        let msg = err.to_string();
        assert!(msg.contains("PM__MISSING_PASSWORD"), "got: {msg}");
        assert!(msg.contains("project-manager"));
    }

    #[test]
    fn spawn_env_mixes_literals_and_placeholders() {
        let mut file = EnvFile::default();
        file.set("PM__API_PASSWORD", "hunter2").expect("set");

        let mut env = std::collections::BTreeMap::new();
        env.insert("MODE".to_string(), "production".to_string());
        env.insert(
            "API_PASSWORD".to_string(),
            "${PM__API_PASSWORD}".to_string(),
        );

        let resolved = resolve_spawn_env("project-manager", &env, &file).expect("resolve");
        assert_eq!(resolved.get("MODE").map(String::as_str), Some("production"));
        assert_eq!(
            resolved.get("API_PASSWORD").map(String::as_str),
            Some("hunter2")
        );
    }
}
