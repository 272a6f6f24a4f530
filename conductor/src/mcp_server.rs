//! In-process MCP tool servers addressed by `acp:` URLs.
//!
//! A [`ToolServer`] is a named set of tools the conductor exposes to the
//! agent through the MCP bridge. Servers are registered before the
//! pipeline starts; each is minted an `acp:<uuid>` address to be placed
//! in `session/new.mcpServers`. [`ToolServer::handle_method`] speaks the
//! server side of MCP: `initialize`, `tools/list`, `tools/call`.

use std::collections::HashMap;
use std::future::Future;
use std::rc::Rc;

use futures::FutureExt as _;
use futures::future::LocalBoxFuture;
use pacp::frame::{ErrorObject, INVALID_PARAMS};
use pacp::mcp::{self, MCP_PROTOCOL_VERSION, ServerInfo, ToolInfo};
use serde_json::{Value, json};

/// Ambient information handed to tool handlers on each invocation.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Agent-assigned session id, when the call came through a bridge
    /// connection that has one.
    pub session_id: Option<String>,
    pub connection_id: String,
}

/// An async tool implementation. Any
/// `Fn(Value, ToolContext) -> impl Future<Output = anyhow::Result<Value>>`
/// closure qualifies.
pub trait ToolHandler: 'static {
    fn invoke(&self, input: Value, cx: ToolContext) -> LocalBoxFuture<'static, anyhow::Result<Value>>;
}

impl<F, Fut> ToolHandler for F
where
    F: Fn(Value, ToolContext) -> Fut + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + 'static,
{
    fn invoke(&self, input: Value, cx: ToolContext) -> LocalBoxFuture<'static, anyhow::Result<Value>> {
        (self)(input, cx).boxed_local()
    }
}

/// One callable tool: its wire description plus the handler.
pub struct ToolDef {
    info: ToolInfo,
    handler: Box<dyn ToolHandler>,
}

impl ToolDef {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        handler: impl ToolHandler,
    ) -> Self {
        Self {
            info: ToolInfo {
                name: name.into(),
                description: description.into(),
                input_schema,
                output_schema: None,
            },
            handler: Box::new(handler),
        }
    }

    pub fn with_output_schema(mut self, schema: Value) -> Self {
        self.info.output_schema = Some(schema);
        self
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }
}

/// An in-process MCP server. Immutable once registered.
pub struct ToolServer {
    acp_url: String,
    info: ServerInfo,
    instructions: Option<String>,
    tools: Vec<ToolDef>,
}

impl ToolServer {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            acp_url: mcp::mint_acp_url(),
            info: ServerInfo {
                name: name.into(),
                version: version.into(),
            },
            instructions: None,
            tools: Vec::new(),
        }
    }

    /// The `acp:` address to reference from `session/new.mcpServers`.
    pub fn acp_url(&self) -> &str {
        &self.acp_url
    }

    pub fn server_info(&self) -> ServerInfo {
        self.info.clone()
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn with_tool(mut self, tool: ToolDef) -> Self {
        self.tools.push(tool);
        self
    }

    /// Wire descriptions of every tool, in registration order.
    pub fn tool_infos(&self) -> Vec<ToolInfo> {
        self.tools.iter().map(|tool| tool.info.clone()).collect()
    }

    fn find_tool(&self, name: &str) -> Option<&ToolDef> {
        self.tools.iter().find(|tool| tool.info.name == name)
    }

    /// Dispatches one MCP method and returns the raw MCP result.
    pub async fn handle_method(
        &self,
        method: &str,
        params: Option<Value>,
        cx: ToolContext,
    ) -> Result<Value, ErrorObject> {
        tracing::debug!(server = %self.info.name, method, "dispatching MCP method");
        match method {
            "initialize" => {
                let mut result = json!({
                    "protocolVersion": MCP_PROTOCOL_VERSION,
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": self.info.name, "version": self.info.version},
                });
                if let Some(instructions) = &self.instructions {
                    result["instructions"] = json!(instructions);
                }
                Ok(result)
            }
            "notifications/initialized" => Ok(Value::Null),
            "tools/list" => Ok(json!({"tools": self.tool_infos()})),
            "tools/call" => self.call_tool(params, cx).await,
            other => Err(ErrorObject::method_not_found(other)),
        }
    }

    async fn call_tool(&self, params: Option<Value>, cx: ToolContext) -> Result<Value, ErrorObject> {
        let params = params.unwrap_or_else(|| json!({}));
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| ErrorObject::invalid_params("tools/call requires a tool name"))?;
        let tool = self
            .find_tool(name)
            .ok_or_else(|| ErrorObject::new(INVALID_PARAMS, format!("Unknown tool: {name}")))?;
        let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

        match tool.handler.invoke(arguments, cx).await {
            Ok(output) => {
                let text = serde_json::to_string(&output)
                    .map_err(|err| ErrorObject::internal_error(err.to_string()))?;
                Ok(json!({"content": [{"type": "text", "text": text}]}))
            }
            Err(err) => Err(ErrorObject::internal_error(err.to_string())),
        }
    }
}

impl std::fmt::Debug for ToolServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolServer")
            .field("acp_url", &self.acp_url)
            .field("name", &self.info.name)
            .field("tools", &self.tools.iter().map(|t| t.name()).collect::<Vec<_>>())
            .finish()
    }
}

/// Registry of tool servers, keyed by their `acp:` URL.
#[derive(Default)]
pub(crate) struct ToolServerRegistry {
    by_url: HashMap<String, Rc<ToolServer>>,
}

impl ToolServerRegistry {
    pub fn register(&mut self, server: ToolServer) -> String {
        let url = server.acp_url().to_string();
        tracing::info!(acp_url = %url, server = %server.info.name, "registered tool server");
        self.by_url.insert(url.clone(), Rc::new(server));
        url
    }

    pub fn unregister(&mut self, url: &str) -> bool {
        self.by_url.remove(url).is_some()
    }

    pub fn get(&self, url: &str) -> Option<Rc<ToolServer>> {
        self.by_url.get(url).cloned()
    }
}
