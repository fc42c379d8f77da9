//! MCP shell — stdio JSON-RPC 2.0 tool server. One MCP tool per registered
//! command; `tools/call` dispatches through the same `CommandRegistry` the
//! CLI and HTTP shells use. Modeled on the teacher's
//! `mcp::transport`/`mcp::dispatch` split (`spec.md` §6).

pub mod transport;

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use transport::{
    handle_initialize, handle_ping, McpError, McpMessage, McpResponse, MCP_COMMAND_FAILED,
    MCP_INVALID_PARAMS, MCP_METHOD_NOT_FOUND, MCP_PARSE_ERROR,
};

use crate::command::CommandRegistry;
use crate::EngineContext;

/// One MCP `tools/list` entry, derived from a `CommandSpec`.
fn tool_descriptor(spec: &crate::command::CommandSpec) -> Value {
    json!({
        "name": spec.protocol_name,
        "description": spec.description,
        "inputSchema": crate::command::schema::json_schema_for(&spec.params),
    })
}

async fn handle_message(ctx: &Arc<EngineContext>, registry: &CommandRegistry, msg: McpMessage) -> Option<McpResponse> {
    let id = msg.id.clone();
    match msg.method.as_str() {
        "initialize" => id.map(handle_initialize),
        "initialized" | "notifications/initialized" => {
            tracing::debug!("MCP client initialized");
            None
        }
        "ping" => id.map(handle_ping),
        "tools/list" => {
            let id = id?;
            let tools: Vec<Value> = registry.list().iter().map(tool_descriptor).collect();
            Some(McpResponse::ok(id, json!({ "tools": tools })))
        }
        "tools/call" => {
            let id = id?;
            Some(handle_tools_call(ctx, registry, id, msg.params).await)
        }
        other => id.map(|id| McpResponse::error(id, McpError::new(MCP_METHOD_NOT_FOUND, format!("unknown method '{other}'")))),
    }
}

async fn handle_tools_call(
    ctx: &Arc<EngineContext>,
    registry: &CommandRegistry,
    id: Value,
    params: Option<Value>,
) -> McpResponse {
    let Some(params) = params else {
        return McpResponse::error(id, McpError::new(MCP_INVALID_PARAMS, "missing params"));
    };
    let Some(tool_name) = params.get("name").and_then(|v| v.as_str()) else {
        return McpResponse::error(id, McpError::new(MCP_INVALID_PARAMS, "missing 'name'"));
    };
    let Some(spec) = registry.list().iter().find(|c| c.protocol_name == tool_name) else {
        return McpResponse::error(id, McpError::new(MCP_METHOD_NOT_FOUND, format!("unknown tool '{tool_name}'")));
    };
    let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
    let result = registry.dispatch(ctx.clone(), spec.name, arguments).await;
    if result.success {
        McpResponse::ok(
            id,
            json!({ "content": [{ "type": "text", "text": serde_json::to_string(&result.data).unwrap_or_default() }] }),
        )
    } else {
        McpResponse::error(
            id,
            McpError::new(MCP_COMMAND_FAILED, result.error.unwrap_or_else(|| "command failed".to_string()))
                .with_data(json!({ "tool": tool_name })),
        )
    }
}

/// Run the MCP tool server over stdio: newline-delimited JSON-RPC messages
/// in on stdin, responses out on stdout. Runs until stdin closes.
pub async fn run_stdio(ctx: Arc<EngineContext>, registry: CommandRegistry) -> anyhow::Result<()> {
    let stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(stdin).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<McpMessage>(&line) {
            Ok(msg) => handle_message(&ctx, &registry, msg).await,
            Err(e) => Some(McpResponse::error(Value::Null, McpError::new(MCP_PARSE_ERROR, e.to_string()))),
        };
        if let Some(response) = response {
            let mut serialized = serde_json::to_string(&response)?;
            serialized.push('\n');
            stdout.write_all(serialized.as_bytes()).await?;
            stdout.flush().await?;
        }
    }
    Ok(())
}
