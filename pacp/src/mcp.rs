//! The `_mcp/*` extension methods: MCP tunneled over the control channel.
//!
//! Tool servers registered with the conductor are addressed by
//! `acp:<uuid>` URLs. The conductor services three reserved methods on
//! its control channel to reach them; these frames are consumed, never
//! forwarded. Per the ACP extension convention the wire methods carry a
//! leading underscore; the bare `mcp/*` spelling is rejected as
//! malformed rather than accepted silently.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const MCP_CONNECT: &str = "_mcp/connect";
pub const MCP_MESSAGE: &str = "_mcp/message";
pub const MCP_DISCONNECT: &str = "_mcp/disconnect";

/// MCP protocol revision reported by tunneled tool servers.
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

/// URL scheme identifying a tool server reachable over the control
/// channel rather than a real network endpoint.
pub const ACP_URL_SCHEME: &str = "acp:";

pub fn is_acp_url(url: &str) -> bool {
    url.starts_with(ACP_URL_SCHEME)
}

/// Mints a fresh `acp:<uuid>` tool server address.
pub fn mint_acp_url() -> String {
    format!("{ACP_URL_SCHEME}{}", uuid::Uuid::new_v4())
}

/// Anything in the reserved control namespace, known method or not.
/// Frames in this namespace are consumed by the conductor; they are
/// never forwarded to a proxy or the agent.
pub fn is_control_namespace(method: &str) -> bool {
    method.starts_with("_mcp/") || method.starts_with("mcp/")
}

/// Control-channel methods the conductor services itself.
pub fn is_control_method(method: &str) -> bool {
    matches!(method, MCP_CONNECT | MCP_MESSAGE | MCP_DISCONNECT)
}

/// The underscore-less spelling of the control methods. Reserved, but
/// answered with an invalid-request error instead of being dispatched.
pub fn is_bare_control_method(method: &str) -> bool {
    matches!(method, "mcp/connect" | "mcp/message" | "mcp/disconnect")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpConnectParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    /// Historically spelled `acp_url`; both spellings are accepted.
    #[serde(alias = "acp_url", alias = "acpUrl")]
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpConnectResult {
    pub connection_id: String,
    pub server_info: ServerInfo,
    pub capabilities: Value,
    pub tools: Vec<ToolInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpMessageParams {
    pub connection_id: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpDisconnectParams {
    pub connection_id: String,
}

/// Wire description of one tool, as listed by `tools/list` and in the
/// `mcp/connect` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
}
