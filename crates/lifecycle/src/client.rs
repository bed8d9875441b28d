use crate::auth::AuthProvider;
use crate::error::{LifecycleError, Result};
use rmcp::handler::client::ClientHandler;
use rmcp::model::{ClientCapabilities, ClientInfo, Implementation};
use rmcp::service::{serve_client, NotificationContext, RoleClient, RunningService};
use rmcp::transport::sse_client::{SseClientConfig, SseClientTransport};
use rmcp::transport::streamable_http_client::{
    StreamableHttpClientTransport, StreamableHttpClientTransportConfig,
};
use rmcp::transport::TokioChildProcess;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

/// Raised by a backend outside the request/response cycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackendEvent {
    /// The backend sent `notifications/tools/list_changed`.
    ToolsChanged { spell: String },
}

/// A connected backend plus the child PID when there is one.
pub struct SpawnedBackend {
    pub service: RunningService<RoleClient, BackendClientHandler>,
    pub pid: Option<u32>,
}

/// Client-side handler for one backend connection. Its only job beyond
/// the handshake is forwarding `tools/list_changed` into the manager's
/// event channel.
#[derive(Clone)]
pub struct BackendClientHandler {
    spell: String,
    events: mpsc::UnboundedSender<BackendEvent>,
}

impl BackendClientHandler {
    pub fn new(spell: String, events: mpsc::UnboundedSender<BackendEvent>) -> Self {
        Self { spell, events }
    }
}

impl ClientHandler for BackendClientHandler {
    fn on_tool_list_changed(
        &self,
        _context: NotificationContext<RoleClient>,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        let spell = self.spell.clone();
        let events = self.events.clone();
        async move {
            log::debug!("backend '{spell}' reported a tool list change");
            let _ = events.send(BackendEvent::ToolsChanged { spell });
        }
    }

    fn get_info(&self) -> ClientInfo {
        ClientInfo {
            protocol_version: Default::default(),
            capabilities: ClientCapabilities::default(),
            client_info: Implementation::from_build_env(),
        }
    }
}

/// Start a stdio backend: spawn the child with the resolved environment,
/// pipe its stderr into our logs, and run the MCP handshake over its
/// stdin/stdout.
pub async fn connect_stdio(
    spell: &str,
    command: &str,
    args: &[String],
    env: &HashMap<String, String>,
    handler: BackendClientHandler,
) -> Result<SpawnedBackend> {
    let mut cmd = Command::new(command);
    cmd.args(args);
    for (key, value) in env {
        cmd.env(key, value);
    }

    let (transport, stderr) = TokioChildProcess::builder(cmd)
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| LifecycleError::SpawnFailed {
            spell: spell.to_string(),
            detail: format!("failed to start '{command}': {err}"),
        })?;
    let pid = transport.id();

    if let Some(stderr) = stderr {
        let spell_name = spell.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                log::debug!("[{spell_name}] {line}");
            }
        });
    }

    let service = serve_client(handler, transport)
        .await
        .map_err(|err| LifecycleError::SpawnFailed {
            spell: spell.to_string(),
            detail: format!("initialize failed: {err}"),
        })?;

    Ok(SpawnedBackend { service, pid })
}

/// Connect to a streamable-HTTP backend with auth headers applied to
/// every request.
pub async fn connect_http(
    spell: &str,
    url: &str,
    provider: &Arc<dyn AuthProvider>,
    handler: BackendClientHandler,
) -> Result<SpawnedBackend> {
    let client = http_client(spell, provider).await?;
    let config = StreamableHttpClientTransportConfig::with_uri(url.to_string());
    let transport = StreamableHttpClientTransport::with_client(client, config);

    let service = serve_client(handler, transport)
        .await
        .map_err(|err| LifecycleError::SpawnFailed {
            spell: spell.to_string(),
            detail: format!("initialize failed: {err}"),
        })?;

    Ok(SpawnedBackend { service, pid: None })
}

/// Connect to an SSE backend: GET establishes the event stream, requests
/// go out as POSTs against the session endpoint.
pub async fn connect_sse(
    spell: &str,
    url: &str,
    provider: &Arc<dyn AuthProvider>,
    handler: BackendClientHandler,
) -> Result<SpawnedBackend> {
    let client = http_client(spell, provider).await?;
    let config = SseClientConfig {
        sse_endpoint: url.to_string().into(),
        ..Default::default()
    };
    let transport = SseClientTransport::start_with_client(client, config)
        .await
        .map_err(|err| LifecycleError::SpawnFailed {
            spell: spell.to_string(),
            detail: format!("sse stream failed: {err}"),
        })?;

    let service = serve_client(handler, transport)
        .await
        .map_err(|err| LifecycleError::SpawnFailed {
            spell: spell.to_string(),
            detail: format!("initialize failed: {err}"),
        })?;

    Ok(SpawnedBackend { service, pid: None })
}

async fn http_client(spell: &str, provider: &Arc<dyn AuthProvider>) -> Result<reqwest::Client> {
    let headers = provider.headers().await?;
    if headers.is_empty() {
        return Ok(reqwest::Client::new());
    }
    reqwest::Client::builder()
        .default_headers(headers)
        .build()
        .map_err(|err| LifecycleError::SpawnFailed {
            spell: spell.to_string(),
            detail: format!("http client build failed: {err}"),
        })
}
