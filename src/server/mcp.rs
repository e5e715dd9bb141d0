use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use rmcp::{
    ErrorData as McpError, RoleServer, ServerHandler,
    handler::server::{router::tool::ToolRouter, tool::ToolCallContext, wrapper::Parameters},
    model::{
        CallToolRequestParam, CallToolResult, Content, GetPromptRequestParam, GetPromptResult,
        ListPromptsResult, ListResourcesResult, ListToolsResult, PaginatedRequestParam, Prompt,
        AnnotateAble, PromptArgument, RawResource, ReadResourceRequestParam, ReadResourceResult,
        Resource, ServerCapabilities, ServerInfo, Tool,
    },
    schemars::JsonSchema,
    service::{NotificationContext, Peer, RequestContext},
    tool, tool_router,
};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::events::{EventBus, GatewayEvent};
use crate::gateway::{AggregatedTool, Gateway};
use crate::naming::{annotate_description, compact_description};
use crate::request_log::{LogStart, RequestKind, RequestLog};

const SEARCH_DEFAULT_LIMIT: usize = 20;

/// Live downstream peers, keyed by an opaque session number. `listChanged`
/// notifications fan out over this registry; a peer that fails to accept a
/// send is pruned.
#[derive(Clone, Default)]
pub struct DownstreamRegistry {
    peers: Arc<Mutex<HashMap<u64, Peer<RoleServer>>>>,
    next_id: Arc<AtomicU64>,
}

impl DownstreamRegistry {
    pub fn register(&self, peer: Peer<RoleServer>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut peers) = self.peers.lock() {
            peers.insert(id, peer);
        }
        id
    }

    fn snapshot(&self) -> Vec<(u64, Peer<RoleServer>)> {
        self.peers
            .lock()
            .map(|peers| peers.iter().map(|(id, peer)| (*id, peer.clone())).collect())
            .unwrap_or_default()
    }

    fn remove(&self, id: u64) {
        if let Ok(mut peers) = self.peers.lock() {
            peers.remove(&id);
        }
    }

    /// Best-effort: a per-session send failure is logged and the session is
    /// dropped from the registry without affecting the others.
    pub async fn broadcast_list_changed(&self) {
        for (id, peer) in self.snapshot() {
            let mut failed = peer.notify_tool_list_changed().await.is_err();
            if !failed {
                failed |= peer.notify_resource_list_changed().await.is_err();
            }
            if !failed {
                failed |= peer.notify_prompt_list_changed().await.is_err();
            }
            if failed {
                debug!(downstream_session = id, "dropping unreachable downstream session");
                self.remove(id);
            }
        }
    }
}

/// Forwards upstream topology changes to every open downstream session as
/// `listChanged` notifications. The gateway finishes its own state
/// transition before publishing, so a notified client re-listing tools
/// always observes the new snapshot.
pub fn spawn_list_changed_relay(
    events: &EventBus,
    registry: DownstreamRegistry,
    shutdown: CancellationToken,
) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = rx.recv() => match event {
                    Ok(GatewayEvent::ServerConnected { .. })
                    | Ok(GatewayEvent::ServerDisconnected { .. }) => {
                        registry.broadcast_list_changed().await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "list-changed relay lagged; renotifying");
                        registry.broadcast_list_changed().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    });
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
struct SearchToolsRequest {
    /// Whitespace-separated words; every word must match.
    query: String,
    /// Restrict to servers whose prefix contains this substring.
    #[serde(default)]
    server: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
struct ServerToolsRequest {
    /// Substring of the server prefix to inspect.
    server: String,
}

/// The downstream-facing MCP server. One instance per downstream session;
/// every instance shares the gateway, the request log, and the downstream
/// registry.
#[derive(Clone)]
pub struct ProxyMcpServer {
    gateway: Gateway,
    request_log: RequestLog,
    downstream: DownstreamRegistry,
    session_key: Arc<Mutex<Option<u64>>>,
    tool_router: ToolRouter<Self>,
}

impl ProxyMcpServer {
    pub fn new(gateway: Gateway, request_log: RequestLog, downstream: DownstreamRegistry) -> Self {
        Self {
            gateway,
            request_log,
            downstream,
            session_key: Arc::new(Mutex::new(None)),
            tool_router: Self::tool_router(),
        }
    }

    fn downstream_session_id(&self) -> Option<String> {
        self.session_key
            .lock()
            .ok()
            .and_then(|key| key.map(|key| key.to_string()))
    }
}

#[tool_router(router = tool_router)]
impl ProxyMcpServer {
    #[tool(
        name = "gateway__list_servers",
        description = "List every configured upstream server with its connection status and capability counts"
    )]
    async fn gateway_list_servers(&self) -> Result<CallToolResult, McpError> {
        let statuses = self.gateway.get_all_server_statuses().await;
        let (total, connected) = self.gateway.connected_count().await;

        let rows: Vec<Value> = statuses
            .iter()
            .map(|view| {
                json!({
                    "name": view.name,
                    "prefix": view.prefix,
                    "status": view.session.status.as_str(),
                    "transport": view.transport.as_str(),
                    "tools": view.session.tools.len(),
                    "resources": view.session.resources.len(),
                    "prompts": view.session.prompts.len(),
                })
            })
            .collect();

        let body = format!(
            "{connected} of {total} server(s) connected\n{}",
            serde_json::to_string_pretty(&rows).map_err(|err| McpError::internal_error(err.to_string(), None))?
        );
        Ok(CallToolResult::success(vec![Content::text(body)]))
    }

    #[tool(
        name = "gateway__search_tools",
        description = "Search aggregated upstream tools by words in their names and descriptions; returns full descriptions and input schemas"
    )]
    async fn gateway_search_tools(
        &self,
        Parameters(params): Parameters<SearchToolsRequest>,
    ) -> Result<CallToolResult, McpError> {
        let limit = params.limit.unwrap_or(SEARCH_DEFAULT_LIMIT);
        let tools = self.gateway.get_all_tools().await;

        let hits: Vec<Value> = tools
            .iter()
            .filter(|tool| {
                params
                    .server
                    .as_deref()
                    .is_none_or(|server| tool.prefix.contains(&server.to_lowercase()))
            })
            .filter(|tool| search_matches(&params.query, tool))
            .take(limit)
            .map(tool_detail)
            .collect();

        let body = serde_json::to_string_pretty(&hits)
            .map_err(|err| McpError::internal_error(err.to_string(), None))?;
        Ok(CallToolResult::success(vec![Content::text(body)]))
    }

    #[tool(
        name = "gateway__get_server_tools",
        description = "Return every tool of the servers whose prefix contains the given substring, grouped by server"
    )]
    async fn gateway_get_server_tools(
        &self,
        Parameters(params): Parameters<ServerToolsRequest>,
    ) -> Result<CallToolResult, McpError> {
        let needle = params.server.to_lowercase();
        let tools = self.gateway.get_all_tools().await;

        let mut by_server: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        for tool in tools.iter().filter(|tool| tool.prefix.contains(&needle)) {
            by_server
                .entry(tool.server_name.clone())
                .or_default()
                .push(tool_detail(tool));
        }
        if by_server.is_empty() {
            return Err(McpError::invalid_params(
                format!("no server prefix contains '{}'", params.server),
                None,
            ));
        }

        let body = serde_json::to_string_pretty(&by_server).map_err(|err| err.to_string())?;
        Ok(CallToolResult::success(vec![Content::text(body)]))
    }
}

impl ServerHandler for ProxyMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "gatehouse aggregates many MCP servers behind one endpoint.\n\
                 Upstream tools and prompts appear under '<server>__<name>' with \
                 shortened descriptions; resources keep their original URIs.\n\
                 Use gateway__list_servers for an overview, gateway__search_tools \
                 to find tools with full descriptions and schemas, and \
                 gateway__get_server_tools to inspect one server in depth."
                    .into(),
            ),
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .enable_prompts()
                .enable_resources()
                .build(),
            ..Default::default()
        }
    }

    async fn on_initialized(&self, context: NotificationContext<RoleServer>) {
        let key = self.downstream.register(context.peer.clone());
        if let Ok(mut slot) = self.session_key.lock() {
            *slot = Some(key);
        }
        debug!(downstream_session = key, "downstream session initialized");
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        // Meta-tools first with full descriptions, then upstream tools
        // grouped by server with compacted, provenance-tagged descriptions.
        let mut tools = self.tool_router.list_all();
        for aggregated in self.gateway.get_all_tools().await {
            tools.push(to_listed_tool(&aggregated));
        }

        Ok(ListToolsResult {
            next_cursor: None,
            tools,
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        if self.tool_router.has_route(request.name.as_ref()) {
            // Meta-tools are internal and bypass the request log.
            return self
                .tool_router
                .call(ToolCallContext::new(self, request, context))
                .await;
        }

        let prefixed = request.name.clone().into_owned();
        let Some((server_id, original)) = self.gateway.resolve_tool(&prefixed).await else {
            return Ok(CallToolResult::error(vec![Content::text(format!(
                "unknown tool '{prefixed}'"
            ))]));
        };

        let server_name = self
            .gateway
            .get_server_status(&server_id)
            .await
            .map(|view| view.name)
            .unwrap_or_else(|_| server_id.clone());

        let log_id = self.request_log.start(LogStart {
            kind: RequestKind::Tool,
            method: prefixed.clone(),
            original_method: Some(original.clone()),
            server_id: server_id.clone(),
            server_name,
            arguments: request
                .arguments
                .clone()
                .map(Value::Object)
                .unwrap_or(Value::Null),
            downstream_session_id: self.downstream_session_id(),
        });

        match self
            .gateway
            .call_tool(&server_id, &original, request.arguments, context.ct.clone())
            .await
        {
            Ok(result) => {
                self.request_log.complete(
                    &log_id,
                    serde_json::to_value(&result.content).unwrap_or(Value::Null),
                    result.is_error.unwrap_or(false),
                );
                Ok(result)
            }
            Err(err) => {
                let message = err.to_string();
                self.request_log.fail(&log_id, &message);
                Ok(CallToolResult::error(vec![Content::text(message)]))
            }
        }
    }

    async fn list_resources(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListResourcesResult, McpError> {
        let resources = self
            .gateway
            .get_all_resources()
            .await
            .iter()
            .map(to_listed_resource)
            .collect();

        Ok(ListResourcesResult {
            next_cursor: None,
            resources,
        })
    }

    async fn read_resource(
        &self,
        request: ReadResourceRequestParam,
        context: RequestContext<RoleServer>,
    ) -> Result<ReadResourceResult, McpError> {
        let uri = request.uri.clone();
        let Some(server_id) = self.gateway.resolve_resource(&uri).await else {
            return Err(McpError::invalid_params(
                format!("unknown resource uri '{uri}'"),
                None,
            ));
        };

        let server_name = self
            .gateway
            .get_server_status(&server_id)
            .await
            .map(|view| view.name)
            .unwrap_or_else(|_| server_id.clone());

        let log_id = self.request_log.start(LogStart {
            kind: RequestKind::Resource,
            method: uri.clone(),
            original_method: None,
            server_id: server_id.clone(),
            server_name,
            arguments: Value::Null,
            downstream_session_id: self.downstream_session_id(),
        });

        match self
            .gateway
            .read_resource(&server_id, &uri, context.ct.clone())
            .await
        {
            Ok(result) => {
                self.request_log.complete(
                    &log_id,
                    serde_json::to_value(&result.contents).unwrap_or(Value::Null),
                    false,
                );
                Ok(result)
            }
            Err(err) => {
                let message = err.to_string();
                self.request_log.fail(&log_id, &message);
                Err(McpError::internal_error(message, None))
            }
        }
    }

    async fn list_prompts(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListPromptsResult, McpError> {
        let prompts = self
            .gateway
            .get_all_prompts()
            .await
            .iter()
            .map(|aggregated| {
                let description = aggregated
                    .prompt
                    .description
                    .as_deref()
                    .map(|description| {
                        compact_description(&annotate_description(
                            &aggregated.server_name,
                            description,
                        ))
                    });
                Prompt::new(
                    &aggregated.prefixed_name,
                    description.as_deref(),
                    to_prompt_arguments(&aggregated.prompt.arguments),
                )
            })
            .collect();

        Ok(ListPromptsResult {
            next_cursor: None,
            prompts,
        })
    }

    async fn get_prompt(
        &self,
        request: GetPromptRequestParam,
        context: RequestContext<RoleServer>,
    ) -> Result<GetPromptResult, McpError> {
        let prefixed = request.name.clone();
        let Some((server_id, original)) = self.gateway.resolve_prompt(&prefixed).await else {
            return Err(McpError::invalid_params(
                format!("unknown prompt '{prefixed}'"),
                None,
            ));
        };

        let server_name = self
            .gateway
            .get_server_status(&server_id)
            .await
            .map(|view| view.name)
            .unwrap_or_else(|_| server_id.clone());

        let log_id = self.request_log.start(LogStart {
            kind: RequestKind::Prompt,
            method: prefixed.clone(),
            original_method: Some(original.clone()),
            server_id: server_id.clone(),
            server_name,
            arguments: request
                .arguments
                .clone()
                .map(Value::Object)
                .unwrap_or(Value::Null),
            downstream_session_id: self.downstream_session_id(),
        });

        match self
            .gateway
            .get_prompt(&server_id, &original, request.arguments, context.ct.clone())
            .await
        {
            Ok(result) => {
                self.request_log.complete(
                    &log_id,
                    serde_json::to_value(&result.messages).unwrap_or(Value::Null),
                    false,
                );
                Ok(result)
            }
            Err(err) => {
                let message = err.to_string();
                self.request_log.fail(&log_id, &message);
                Err(McpError::internal_error(message, None))
            }
        }
    }
}

/// Match policy: split the query on whitespace; a tool matches iff every
/// word is a substring of the lowercased `original + prefixed + description`
/// concatenation.
fn search_matches(query: &str, tool: &AggregatedTool) -> bool {
    let haystack = format!(
        "{} {} {}",
        tool.tool.name,
        tool.prefixed_name,
        tool.tool.description.as_deref().unwrap_or_default()
    )
    .to_lowercase();
    query
        .split_whitespace()
        .all(|word| haystack.contains(&word.to_lowercase()))
}

fn tool_detail(tool: &AggregatedTool) -> Value {
    json!({
        "name": tool.tool.name,
        "prefixedName": tool.prefixed_name,
        "server": tool.server_name,
        "description": tool.tool.description,
        "inputSchema": tool.tool.input_schema,
    })
}

/// Listings carry compacted descriptions; the meta-tools are the on-demand
/// channel for full descriptions and schemas.
fn to_listed_tool(aggregated: &AggregatedTool) -> Tool {
    let description = compact_description(&annotate_description(
        &aggregated.server_name,
        aggregated.tool.description.as_deref().unwrap_or_default(),
    ));
    let schema = match &aggregated.tool.input_schema {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    };
    Tool::new(
        aggregated.prefixed_name.clone(),
        description.trim_end().to_string(),
        Arc::new(schema),
    )
}

fn to_listed_resource(aggregated: &crate::gateway::AggregatedResource) -> Resource {
    let mut raw = RawResource::new(
        aggregated.resource.uri.clone(),
        aggregated.resource.name.clone(),
    );
    raw.description = Some(
        annotate_description(
            &aggregated.server_name,
            aggregated.resource.description.as_deref().unwrap_or_default(),
        )
        .trim_end()
        .to_string(),
    );
    raw.mime_type = aggregated.resource.mime_type.clone();
    raw.no_annotation()
}

fn to_prompt_arguments(
    arguments: &[crate::upstream::PromptArgumentInfo],
) -> Option<Vec<PromptArgument>> {
    if arguments.is_empty() {
        return None;
    }
    // Round-trip through JSON so optional fields the SDK grows later keep
    // their defaults.
    serde_json::to_value(arguments)
        .ok()
        .and_then(|value| serde_json::from_value(value).ok())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{search_matches, to_listed_tool, tool_detail};
    use crate::gateway::AggregatedTool;
    use crate::upstream::ToolInfo;

    fn aggregated(name: &str, description: Option<&str>) -> AggregatedTool {
        AggregatedTool {
            server_id: "srv1".to_string(),
            server_name: "github".to_string(),
            prefix: "github".to_string(),
            prefixed_name: format!("github__{name}"),
            tool: ToolInfo {
                name: name.to_string(),
                description: description.map(str::to_string),
                input_schema: Some(json!({"type": "object"})),
            },
        }
    }

    #[test]
    fn search_requires_every_word() {
        let tool = aggregated("search_issues", Some("Search GitHub issues by label"));
        assert!(search_matches("search issues", &tool));
        assert!(search_matches("GITHUB label", &tool));
        assert!(!search_matches("search pull", &tool));
    }

    #[test]
    fn search_matches_prefixed_name() {
        let tool = aggregated("search_issues", None);
        assert!(search_matches("github__search", &tool));
    }

    #[test]
    fn listed_tool_is_prefixed_and_compacted() {
        let long_description = "word ".repeat(60);
        let tool = aggregated("search_issues", Some(&long_description));
        let listed = to_listed_tool(&tool);

        assert_eq!(listed.name.as_ref(), "github__search_issues");
        let description = listed.description.as_deref().unwrap_or_default();
        assert!(description.starts_with("[github] "));
        assert!(description.chars().count() <= 121);
        assert!(description.ends_with('…'));
    }

    #[test]
    fn short_descriptions_survive_unclipped() {
        let tool = aggregated("search_issues", Some("Search issues"));
        let listed = to_listed_tool(&tool);
        assert_eq!(
            listed.description.as_deref(),
            Some("[github] Search issues")
        );
    }

    #[test]
    fn detail_keeps_full_description_and_schema() {
        let long_description = "word ".repeat(60);
        let tool = aggregated("search_issues", Some(&long_description));
        let detail = tool_detail(&tool);
        assert_eq!(
            detail["description"].as_str().map(str::len),
            Some(long_description.len())
        );
        assert_eq!(detail["inputSchema"]["type"], "object");
    }
}
