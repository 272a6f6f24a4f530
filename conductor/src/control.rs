//! The MCP-over-control-channel handler.
//!
//! Services the reserved `_mcp/connect`, `_mcp/message`, and
//! `_mcp/disconnect` methods against the tool-server registry. These
//! frames are consumed by the conductor itself — whichever hop they
//! arrive from, they are never forwarded. The bridge reaches the same
//! handler through synthesized control calls on the message queue.

use std::collections::HashMap;
use std::rc::Rc;

use pacp::frame::ErrorObject;
use pacp::mcp::{McpConnectParams, McpConnectResult, McpDisconnectParams, McpMessageParams};
use serde_json::json;
use uuid::Uuid;

use crate::mcp_server::{ToolContext, ToolServer, ToolServerRegistry};

pub(crate) struct McpControlHandler {
    registry: ToolServerRegistry,
    connections: HashMap<String, McpConnection>,
}

struct McpConnection {
    server: Rc<ToolServer>,
    session_id: Option<String>,
}

impl McpControlHandler {
    pub fn new(registry: ToolServerRegistry) -> Self {
        Self {
            registry,
            connections: HashMap::new(),
        }
    }

    pub fn connect(
        &mut self,
        params: McpConnectParams,
        session_id: Option<String>,
    ) -> Result<McpConnectResult, ErrorObject> {
        let server = self.registry.get(&params.url).ok_or_else(|| {
            ErrorObject::invalid_params(format!(
                "No MCP server registered for URL: {}",
                params.url
            ))
        })?;

        let connection_id = params
            .connection_id
            .unwrap_or_else(|| format!("mcp-connection:{}", Uuid::new_v4()));
        tracing::info!(connection_id, acp_url = %params.url, "MCP connection opened");

        let result = McpConnectResult {
            connection_id: connection_id.clone(),
            server_info: server.server_info(),
            capabilities: json!({"tools": {}}),
            tools: server.tool_infos(),
        };
        self.connections
            .insert(connection_id, McpConnection { server, session_id });
        Ok(result)
    }

    /// Resolves an `mcp/message` to the server and context it targets.
    /// The caller awaits the actual dispatch off the routing loop so a
    /// slow tool cannot stall the pipeline.
    pub fn route_message(
        &self,
        params: &McpMessageParams,
    ) -> Result<(Rc<ToolServer>, ToolContext), ErrorObject> {
        let connection = self.connections.get(&params.connection_id).ok_or_else(|| {
            ErrorObject::invalid_request(format!(
                "Unknown connection: {}",
                params.connection_id
            ))
        })?;
        Ok((
            connection.server.clone(),
            ToolContext {
                session_id: connection.session_id.clone(),
                connection_id: params.connection_id.clone(),
            },
        ))
    }

    pub fn disconnect(&mut self, params: &McpDisconnectParams) -> bool {
        let removed = self.connections.remove(&params.connection_id).is_some();
        if removed {
            tracing::info!(connection_id = %params.connection_id, "MCP connection closed");
        }
        removed
    }

    pub fn clear_connections(&mut self) {
        self.connections.clear();
    }
}
