use std::sync::Arc;

use anyhow::{Context, Result};
use rmcp::{
    ErrorData as McpError, RoleServer, ServerHandler, ServiceExt,
    model::{
        AnnotateAble, CallToolRequestParam, CallToolResult, Content, GetPromptRequestParam,
        GetPromptResult,
        ListPromptsResult, ListResourcesResult, ListToolsResult, PaginatedRequestParam, Prompt,
        PromptMessage, PromptMessageRole, ReadResourceRequestParam, ReadResourceResult,
        ResourceContents, ServerCapabilities, ServerInfo, Tool,
    },
    service::RequestContext,
};
use serde_json::{Map, Value, json};

const TOOL_ECHO: &str = "echo";
const TOOL_ADD: &str = "add";
const PROMPT_GREET: &str = "greet";
const RESOURCE_GREETING_URI: &str = "memo://greeting";

/// Minimal stdio MCP server used as an upstream by the integration tests.
pub async fn run() -> Result<()> {
    let service = FixtureServer
        .serve(rmcp::transport::stdio())
        .await
        .context("failed to start fixture MCP server")?;

    let _ = service
        .waiting()
        .await
        .context("fixture server wait failed")?;

    Ok(())
}

#[derive(Debug, Clone, Copy)]
struct FixtureServer;

impl FixtureServer {
    fn echo_tool() -> Tool {
        Tool::new(
            TOOL_ECHO,
            "Echo the given text back as tool output",
            Arc::new(object_schema(json!({
                "text": {"type": "string"}
            }))),
        )
    }

    fn add_tool() -> Tool {
        Tool::new(
            TOOL_ADD,
            "Add two numbers and return the sum",
            Arc::new(object_schema(json!({
                "a": {"type": "number"},
                "b": {"type": "number"}
            }))),
        )
    }

    fn get_tool(&self, name: &str) -> Option<Tool> {
        match name {
            TOOL_ECHO => Some(Self::echo_tool()),
            TOOL_ADD => Some(Self::add_tool()),
            _ => None,
        }
    }
}

fn object_schema(properties: Value) -> Map<String, Value> {
    let mut schema = Map::new();
    schema.insert("type".to_string(), Value::String("object".to_string()));
    schema.insert("properties".to_string(), properties);
    schema
}

fn number_argument(arguments: Option<&Map<String, Value>>, key: &str) -> Result<f64, McpError> {
    arguments
        .and_then(|map| map.get(key))
        .and_then(Value::as_f64)
        .ok_or_else(|| McpError::invalid_params(format!("'{key}' must be a number"), None))
}

impl ServerHandler for FixtureServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some("fixture MCP server for gatehouse tests".into()),
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .enable_prompts()
                .enable_resources()
                .build(),
            ..Default::default()
        }
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        Ok(ListToolsResult {
            next_cursor: None,
            tools: vec![Self::echo_tool(), Self::add_tool()],
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        match request.name.as_ref() {
            TOOL_ECHO => {
                let text = request
                    .arguments
                    .as_ref()
                    .and_then(|map| map.get("text"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                Ok(CallToolResult::success(vec![Content::text(text)]))
            }
            TOOL_ADD => {
                let a = number_argument(request.arguments.as_ref(), "a")?;
                let b = number_argument(request.arguments.as_ref(), "b")?;
                Ok(CallToolResult::success(vec![Content::text(
                    (a + b).to_string(),
                )]))
            }
            _ => Err(McpError::invalid_params(
                format!("unknown fixture tool '{}'", request.name),
                None,
            )),
        }
    }

    async fn list_prompts(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListPromptsResult, McpError> {
        Ok(ListPromptsResult {
            next_cursor: None,
            prompts: vec![Prompt::new(
                PROMPT_GREET,
                Some("Greet someone by name"),
                None,
            )],
        })
    }

    async fn get_prompt(
        &self,
        request: GetPromptRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<GetPromptResult, McpError> {
        match request.name.as_str() {
            PROMPT_GREET => {
                let name = request
                    .arguments
                    .as_ref()
                    .and_then(|map| map.get("name"))
                    .and_then(Value::as_str)
                    .unwrap_or("world")
                    .to_string();
                Ok(GetPromptResult {
                    description: Some("fixture greeting prompt".to_string()),
                    messages: vec![PromptMessage::new_text(
                        PromptMessageRole::User,
                        format!("Say hello to {name}"),
                    )],
                })
            }
            _ => Err(McpError::invalid_params(
                format!("unknown fixture prompt '{}'", request.name),
                None,
            )),
        }
    }

    async fn list_resources(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListResourcesResult, McpError> {
        Ok(ListResourcesResult {
            next_cursor: None,
            resources: vec![
                rmcp::model::RawResource::new(RESOURCE_GREETING_URI, "greeting").no_annotation(),
            ],
        })
    }

    async fn read_resource(
        &self,
        request: ReadResourceRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<ReadResourceResult, McpError> {
        match request.uri.as_str() {
            RESOURCE_GREETING_URI => Ok(ReadResourceResult {
                contents: vec![ResourceContents::text(
                    "hello from the fixture server",
                    RESOURCE_GREETING_URI,
                )],
            }),
            _ => Err(McpError::invalid_params(
                format!("unknown fixture resource uri '{}'", request.uri),
                None,
            )),
        }
    }
}
