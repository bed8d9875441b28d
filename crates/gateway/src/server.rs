//! The outward-facing MCP server.
//!
//! The tool surface is dynamic (two always-present meta-tools plus the
//! descriptors of every active backend), so this is a hand-written
//! [`ServerHandler`] rather than a macro-routed one.

use crate::responses::{
    ActivateSpellRequest, ActivateSpellResponse, ActivatedSpell, MatchSummary,
    ResolveIntentRequest, ResolveIntentResponse, ToolSummary, ACTIVATE_SPELL_TOOL,
    MAX_AVAILABLE_SPELLS, RESOLVE_INTENT_TOOL,
};
use grimoire_lifecycle::{LifecycleError, SpellLifecycle, DEFAULT_IDLE_THRESHOLD};
use grimoire_resolver::{IntentResolver, Resolution};
use grimoire_spellbook::{is_valid_spell_name, SpellDiscovery};
use rmcp::model::{
    CallToolRequestParam, CallToolResult, Content, Implementation, JsonObject, ListToolsResult,
    PaginatedRequestParam, ServerCapabilities, ServerInfo, Tool, ToolsCapability,
};
use rmcp::service::{Peer, RequestContext, RoleServer};
use rmcp::{ErrorData as McpError, ServerHandler};
use std::borrow::Cow;
use std::sync::{Arc, Mutex};

const INSTRUCTIONS: &str = "Grimoire is a gateway to a library of MCP spell servers. \
Describe what you want to do with resolve_intent; a confident match activates the \
right spell automatically and its tools appear in tools/list. Use activate_spell to \
pick a spell by name. Idle spells are retired after a few turns.";

#[derive(Clone)]
pub struct GrimoireGateway {
    resolver: Arc<dyn IntentResolver>,
    lifecycle: Arc<dyn SpellLifecycle>,
    discovery: SpellDiscovery,
    /// Upstream peer for notifications raised outside a request (child
    /// tool-list changes, crash retirements). Set once serving starts.
    notifier: Arc<Mutex<Option<Peer<RoleServer>>>>,
}

impl GrimoireGateway {
    pub fn new(
        resolver: Arc<dyn IntentResolver>,
        lifecycle: Arc<dyn SpellLifecycle>,
        discovery: SpellDiscovery,
    ) -> Self {
        Self {
            resolver,
            lifecycle,
            discovery,
            notifier: Arc::new(Mutex::new(None)),
        }
    }

    /// Tool names no backend may shadow.
    #[must_use]
    pub fn reserved_tool_names() -> std::collections::HashSet<String> {
        [RESOLVE_INTENT_TOOL, ACTIVATE_SPELL_TOOL]
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    pub fn set_notifier(&self, peer: Peer<RoleServer>) {
        let mut notifier = self.notifier.lock().unwrap_or_else(|e| e.into_inner());
        *notifier = Some(peer);
    }

    /// Emit one upstream `tools/list_changed`, after the transition it
    /// describes is already visible to `tools/list`.
    pub async fn notify_tools_changed(&self) {
        let peer = {
            let notifier = self.notifier.lock().unwrap_or_else(|e| e.into_inner());
            notifier.clone()
        };
        if let Some(peer) = peer {
            if let Err(err) = peer.notify_tool_list_changed().await {
                log::warn!("failed to notify tools/list_changed: {err}");
            }
        }
    }

    fn available_spells(&self) -> Vec<String> {
        let mut names = self.discovery.names();
        names.truncate(MAX_AVAILABLE_SPELLS);
        names
    }

    fn json_result(value: &impl serde::Serialize) -> Result<CallToolResult, McpError> {
        Ok(CallToolResult::success(vec![Content::text(
            serde_json::to_string_pretty(value).unwrap_or_default(),
        )]))
    }

    async fn handle_resolve_intent(
        &self,
        args: Option<JsonObject>,
    ) -> Result<CallToolResult, McpError> {
        let Some(args) = args else {
            return Self::json_result(&ResolveIntentResponse::not_found(
                None,
                "args must be an object",
                self.available_spells(),
            ));
        };
        let query = match args.get("query") {
            Some(serde_json::Value::String(query)) => query.clone(),
            _ => {
                return Self::json_result(&ResolveIntentResponse::not_found(
                    None,
                    "query must be a string",
                    self.available_spells(),
                ));
            }
        };

        match self.resolver.resolve(&query).await {
            Resolution::Activated { spell } => {
                let tools = self.activate(&spell.name).await?;
                let tool_names = tools.iter().map(|t| t.name.to_string()).collect();
                Self::json_result(&ResolveIntentResponse::activated(
                    query,
                    MatchSummary::from(spell),
                    tool_names,
                ))
            }
            Resolution::MultipleMatches { matches } => {
                Self::json_result(&ResolveIntentResponse::multiple_matches(
                    query,
                    matches.into_iter().map(MatchSummary::from).collect(),
                ))
            }
            Resolution::WeakMatches { matches } => {
                Self::json_result(&ResolveIntentResponse::weak_matches(
                    query,
                    matches.into_iter().map(MatchSummary::from).collect(),
                ))
            }
            Resolution::NotFound { message } => Self::json_result(
                &ResolveIntentResponse::not_found(Some(query), message, self.available_spells()),
            ),
        }
    }

    async fn handle_activate_spell(
        &self,
        args: Option<JsonObject>,
    ) -> Result<CallToolResult, McpError> {
        let args =
            args.ok_or_else(|| McpError::invalid_params("args must be an object", None))?;
        let name = match args.get("name") {
            Some(serde_json::Value::String(name)) if !name.trim().is_empty() => name.clone(),
            _ => {
                return Err(McpError::invalid_params(
                    "name must be a non-empty string",
                    None,
                ))
            }
        };
        if !is_valid_spell_name(&name) {
            return Err(McpError::invalid_params(
                format!("invalid spell name '{name}'"),
                None,
            ));
        }
        let spell = self
            .discovery
            .get(&name)
            .ok_or_else(|| McpError::invalid_params(format!("unknown spell '{name}'"), None))?;

        let tools = self.activate(&name).await?;
        Self::json_result(&ActivateSpellResponse {
            spell: ActivatedSpell {
                name: spell.name,
                version: spell.version,
                description: spell.description,
                steering: spell.steering,
            },
            tools: tools
                .into_iter()
                .map(|tool| ToolSummary {
                    name: tool.name.to_string(),
                    description: tool.description.map(|d| d.to_string()),
                })
                .collect(),
        })
    }

    /// Shared activation path: spawn, announce the new tool surface, then
    /// give idle backends their cleanup turn.
    async fn activate(&self, name: &str) -> Result<Vec<Tool>, McpError> {
        let spell = self.discovery.get(name).ok_or_else(|| {
            McpError::invalid_params(format!("unknown spell '{name}'"), None)
        })?;

        let tools = self
            .lifecycle
            .spawn(&spell)
            .await
            .map_err(lifecycle_error_to_mcp)?;
        self.notify_tools_changed().await;

        let killed = self.lifecycle.cleanup_inactive(DEFAULT_IDLE_THRESHOLD).await;
        if !killed.is_empty() {
            log::info!("cleanup retired: {}", killed.join(", "));
            self.notify_tools_changed().await;
        }
        Ok(tools)
    }

    async fn handle_proxy_call(
        &self,
        tool: &str,
        args: Option<JsonObject>,
    ) -> Result<CallToolResult, McpError> {
        let Some(owner) = self.lifecycle.find_tool_owner(tool).await else {
            return Err(McpError::invalid_params(
                format!("unknown tool: {tool}"),
                None,
            ));
        };
        self.lifecycle.mark_used(&owner).await;

        match self.lifecycle.call_tool(&owner, tool, args, None).await {
            Ok(result) => Ok(result),
            Err(err) => {
                if matches!(err, LifecycleError::Backend { .. }) {
                    // The backend was retired; the tool surface shrank.
                    self.notify_tools_changed().await;
                }
                Err(lifecycle_error_to_mcp(err))
            }
        }
    }
}

impl ServerHandler for GrimoireGateway {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(INSTRUCTIONS.into()),
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability {
                    list_changed: Some(true),
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
        let mut tools = meta_tools();
        tools.extend(self.lifecycle.active_tools().await);
        Ok(ListToolsResult {
            tools,
            ..Default::default()
        })
    }

    async fn call_tool(
        &self,
        params: CallToolRequestParam,
        ctx: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        // Keep the stored notifier current; the peer of an in-flight call
        // is always the live upstream connection.
        self.set_notifier(ctx.peer.clone());

        // One upstream tools/call is one turn, whatever the tool is.
        let turn = self.lifecycle.increment_turn().await;
        log::debug!("turn {turn}: tools/call '{}'", params.name);

        match params.name.as_ref() {
            RESOLVE_INTENT_TOOL => self.handle_resolve_intent(params.arguments).await,
            ACTIVATE_SPELL_TOOL => self.handle_activate_spell(params.arguments).await,
            other => self.handle_proxy_call(other, params.arguments).await,
        }
    }
}

fn meta_tools() -> Vec<Tool> {
    vec![
        tool_descriptor::<ResolveIntentRequest>(
            RESOLVE_INTENT_TOOL,
            "Resolve a natural-language intent to the best matching spell. A confident \
             match is activated immediately and its tools become available; otherwise \
             ranked alternatives are returned.",
        ),
        tool_descriptor::<ActivateSpellRequest>(
            ACTIVATE_SPELL_TOOL,
            "Activate a spell by exact name and expose its tools.",
        ),
    ]
}

fn tool_descriptor<T: schemars::JsonSchema>(name: &'static str, description: &'static str) -> Tool {
    let schema = serde_json::to_value(schemars::schema_for!(T))
        .ok()
        .and_then(|value| value.as_object().cloned())
        .unwrap_or_default();
    Tool::new(
        Cow::Borrowed(name),
        Cow::Borrowed(description),
        Arc::new(schema),
    )
}

fn lifecycle_error_to_mcp(err: LifecycleError) -> McpError {
    match &err {
        LifecycleError::NotActive(_) => McpError::invalid_params(err.to_string(), None),
        _ => McpError::internal_error(redact(&err.to_string()), None),
    }
}

/// Upstream error hygiene: spell name and failure class yes, absolute
/// paths under the user's home no.
fn redact(detail: &str) -> String {
    match std::env::var("HOME") {
        Ok(home) if !home.trim().is_empty() => detail.replace(home.as_str(), "~"),
        _ => detail.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_tools_have_schemas_and_stable_names() {
        let tools = meta_tools();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].name, RESOLVE_INTENT_TOOL);
        assert_eq!(tools[1].name, ACTIVATE_SPELL_TOOL);
        for tool in &tools {
            assert!(
                !tool.input_schema.is_empty(),
                "tool '{}' is missing an input schema",
                tool.name
            );
        }
    }

    #[test]
    fn reserved_names_cover_both_meta_tools() {
        let reserved = GrimoireGateway::reserved_tool_names();
        assert!(reserved.contains(RESOLVE_INTENT_TOOL));
        assert!(reserved.contains(ACTIVATE_SPELL_TOOL));
        assert_eq!(reserved.len(), 2);
    }

    #[test]
    fn redaction_hides_home_paths() {
        std::env::set_var("HOME", "/home/tester");
        let redacted = redact("spawn failed: /home/tester/.grimoire/x.spell.yaml missing");
        assert!(!redacted.contains("/home/tester"), "got: {redacted}");
        assert!(redacted.contains("~/.grimoire"));
    }
}
