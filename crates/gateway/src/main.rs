//! Grimoire MCP gateway.
//!
//! Speaks MCP over stdio to the agent and acts as an MCP client to the
//! spell backends it activates. Logging goes to stderr only; stdout
//! belongs to the protocol.
//!
//! Environment:
//! - `GRIMOIRE_HOME`: spell directory override (default `~/.grimoire`)
//! - `GRIMOIRE_DEBUG=1` / `GRIMOIRE_TRACE=1`: log verbosity
//! - `GRIMOIRE_EMBEDDING_MODE`: `hash` (default) or `none`

mod responses;
mod server;

use anyhow::{bail, Context, Result};
use grimoire_embedding_store::EmbeddingStore;
use grimoire_home::{EnvStore, GrimoireHome};
use grimoire_lifecycle::{BackendEvent, LifecycleManager, SpellLifecycle};
use grimoire_resolver::{EmbeddingService, HashEmbedder, HybridResolver, IntentResolver, NullEmbedder};
use grimoire_spellbook::SpellDiscovery;
use rmcp::transport::stdio;
use rmcp::ServiceExt;
use server::GrimoireGateway;
use std::sync::Arc;
use tokio::sync::mpsc;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("Fatal error: {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    init_logging();

    let home = GrimoireHome::resolve().context("resolve grimoire home")?;
    home.ensure_dir()
        .with_context(|| format!("create grimoire dir {}", home.dir().display()))?;
    log::info!("grimoire home: {}", home.dir().display());

    let store = EmbeddingStore::load(home.embeddings_path())
        .await
        .context("load embedding store")?;
    let env_store = EnvStore::new(home.clone());

    let (lifecycle, backend_events) = LifecycleManager::new(
        store.clone(),
        env_store,
        GrimoireGateway::reserved_tool_names(),
        None,
    );
    let reaped = lifecycle.load_from_storage().await;
    if !reaped.is_empty() {
        log::info!("reaped {} orphan backend(s) from a previous run", reaped.len());
    }

    let discovery =
        SpellDiscovery::start(home.dir().to_path_buf()).context("start spell discovery")?;
    let embedder = embedder_from_env()?;
    let resolver = HybridResolver::new(discovery.clone(), store.clone(), embedder);
    resolver.index_spells().await;

    let gateway = GrimoireGateway::new(
        resolver as Arc<dyn IntentResolver>,
        lifecycle.clone() as Arc<dyn SpellLifecycle>,
        discovery.clone(),
    );

    log::info!("starting grimoire gateway ({} spell(s) discovered)", discovery.len());
    let server = gateway
        .clone()
        .serve(stdio())
        .await
        .context("serve MCP over stdio")?;
    gateway.set_notifier(server.peer().clone());

    spawn_backend_event_pump(gateway.clone(), lifecycle.clone(), backend_events);

    tokio::select! {
        quit = server.waiting() => {
            match quit {
                Ok(reason) => log::info!("upstream connection closed: {reason:?}"),
                Err(err) => log::warn!("server task failed: {err}"),
            }
        }
        () = shutdown_signal() => {
            log::info!("shutdown signal received");
        }
    }

    lifecycle.kill_all().await;
    store.flush().await.context("flush embedding store")?;
    log::info!("grimoire gateway stopped");
    Ok(())
}

/// Drain backend-originated events: refresh the changed backend's tool
/// list, then mirror the change upstream.
fn spawn_backend_event_pump(
    gateway: GrimoireGateway,
    lifecycle: Arc<LifecycleManager>,
    mut events: mpsc::UnboundedReceiver<BackendEvent>,
) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                BackendEvent::ToolsChanged { spell } => {
                    if let Err(err) = lifecycle.refresh_tools(&spell).await {
                        log::warn!("tool refresh for '{spell}' failed: {err}");
                    }
                    gateway.notify_tools_changed().await;
                }
            }
        }
    });
}

fn embedder_from_env() -> Result<Arc<dyn EmbeddingService>> {
    let mode = std::env::var("GRIMOIRE_EMBEDDING_MODE").unwrap_or_else(|_| "hash".to_string());
    match mode.to_ascii_lowercase().as_str() {
        "hash" => Ok(Arc::new(HashEmbedder::new())),
        "none" => Ok(Arc::new(NullEmbedder)),
        other => bail!("unsupported GRIMOIRE_EMBEDDING_MODE '{other}' (expected 'hash' or 'none')"),
    }
}

fn init_logging() {
    let default_level = if env_flag("GRIMOIRE_TRACE") {
        "trace"
    } else if env_flag("GRIMOIRE_DEBUG") {
        "debug"
    } else {
        "info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .target(env_logger::Target::Stderr)
        .init();
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(err) => {
                log::warn!("cannot install SIGTERM handler: {err}");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
