//! Minimal MCP backend used by the gateway's integration tests as a
//! stand-in spell server. Tool names come from `SPELL_STUB_TOOLS`
//! (comma-separated); every call answers with a small JSON payload.

use anyhow::Result;
use rmcp::model::{
    CallToolRequestParam, CallToolResult, Content, Implementation, ListToolsResult,
    PaginatedRequestParam, ServerCapabilities, ServerInfo, Tool, ToolsCapability,
};
use rmcp::service::{RequestContext, RoleServer};
use rmcp::transport::stdio;
use rmcp::{ErrorData as McpError, ServerHandler, ServiceExt};
use std::borrow::Cow;
use std::sync::Arc;

#[derive(Clone)]
struct SpellStub {
    tools: Vec<String>,
}

impl SpellStub {
    fn from_env() -> Self {
        let tools = std::env::var("SPELL_STUB_TOOLS")
            .unwrap_or_else(|_| "echo".to_string())
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect();
        Self { tools }
    }
}

impl ServerHandler for SpellStub {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some("Test spell backend; every tool echoes its arguments.".into()),
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability {
                    list_changed: Some(false),
                }),
                ..Default::default()
            },
            server_info: Implementation::from_build_env(),
            ..Default::default()
        }
    }

    async fn list_tools(
        &self,
        _params: Option<PaginatedRequestParam>,
        _ctx: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        let tools = self
            .tools
            .iter()
            .map(|name| {
                Tool::new(
                    Cow::Owned(name.clone()),
                    Cow::Owned(format!("Stub tool '{name}'")),
                    Arc::new(empty_object_schema()),
                )
            })
            .collect();
        Ok(ListToolsResult {
            tools,
            ..Default::default()
        })
    }

    async fn call_tool(
        &self,
        params: CallToolRequestParam,
        _ctx: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        if !self.tools.iter().any(|name| name == params.name.as_ref()) {
            return Err(McpError::invalid_params(
                format!("unknown tool: {}", params.name),
                None,
            ));
        }
        let reply = serde_json::json!({
            "tool": params.name,
            "echo": params.arguments.unwrap_or_default(),
        });
        Ok(CallToolResult::success(vec![Content::text(
            reply.to_string(),
        )]))
    }
}

fn empty_object_schema() -> serde_json::Map<String, serde_json::Value> {
    let mut schema = serde_json::Map::new();
    schema.insert("type".to_string(), serde_json::json!("object"));
    schema.insert("properties".to_string(), serde_json::json!({}));
    schema
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .target(env_logger::Target::Stderr)
        .init();

    let server = SpellStub::from_env().serve(stdio()).await?;
    server.waiting().await?;
    Ok(())
}
