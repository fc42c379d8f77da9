//! MCP JSON-RPC 2.0 message types, adapted from the teacher's
//! `mcp::transport` (protocol version 2024-11-05, stdio transport only —
//! this engine exposes its command surface as an MCP tool server rather
//! than consuming upstream MCP servers the way the teacher's client does).

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpMessage {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<McpError>,
}

impl McpResponse {
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Value, error: McpError) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl McpError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

pub const MCP_PARSE_ERROR: i32 = -32700;
pub const MCP_INVALID_REQUEST: i32 = -32600;
pub const MCP_METHOD_NOT_FOUND: i32 = -32601;
pub const MCP_INVALID_PARAMS: i32 = -32602;
pub const MCP_INTERNAL_ERROR: i32 = -32603;
/// Domain error surfaced from a command handler (`EngineError`), layered
/// under the JSON-RPC reserved range the same way the teacher reserves
/// `-32002` for its own domain errors.
pub const MCP_COMMAND_FAILED: i32 = -32001;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerInfo {
    pub name: String,
    pub version: String,
}

pub fn handle_initialize(id: Value) -> McpResponse {
    McpResponse::ok(
        id,
        serde_json::json!({
            "protocolVersion": "2024-11-05",
            "capabilities": { "tools": { "listChanged": false } },
            "serverInfo": McpServerInfo {
                name: "questload".into(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        }),
    )
}

pub fn handle_ping(id: Value) -> McpResponse {
    McpResponse::ok(id, serde_json::json!({}))
}
