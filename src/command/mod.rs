//! Command Layer (C9).
//!
//! A registry of typed commands — the uniform surface the CLI, HTTP, and MCP
//! shells all convert their native input into and dispatch through. Each
//! `CommandSpec` carries a parameter schema (`spec.md` §9) and an async
//! handler closure over `EngineContext`; the registry is the single place
//! that catches `EngineError` and flattens it into a `CommandResult`, so no
//! shell re-derives its own error taxonomy (`spec.md` §7).

mod handlers;
pub mod schema;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::error::EngineError;
use crate::EngineContext;

pub use schema::{ParamSpec, ParamType};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub type CommandHandler =
    Arc<dyn Fn(Arc<EngineContext>, Value) -> BoxFuture<'static, crate::error::EngineResult<Value>> + Send + Sync>;

/// Result of dispatching a command — the only shape the CLI/HTTP/MCP shells
/// render, whatever their native output format is.
#[derive(Debug, Clone, Serialize)]
pub struct CommandResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "agentName")]
    pub agent_name: Option<String>,
}

impl CommandResult {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            error: None,
            agent_name: None,
        }
    }

    pub fn failure(error: &EngineError) -> Self {
        Self {
            success: false,
            data: None,
            message: None,
            error: Some(error.to_string()),
            agent_name: None,
        }
    }
}

/// Declares a single command: its internal/CLI/protocol names, parameter
/// schema, and handler. `cli_name` and `protocol_name` are usually identical
/// to `name` (snake_case) — kept distinct because the CLI and MCP shells are
/// free to diverge from the internal registry key without the spec's
/// command table changing.
pub struct CommandSpec {
    pub name: &'static str,
    pub cli_name: &'static str,
    pub protocol_name: &'static str,
    pub description: &'static str,
    pub params: Vec<ParamSpec>,
    pub handler: CommandHandler,
}

pub struct CommandRegistry {
    commands: Vec<CommandSpec>,
    by_name: HashMap<&'static str, usize>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        let commands = handlers::all_commands();
        let by_name = commands
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name, i))
            .collect();
        Self { commands, by_name }
    }

    pub fn get(&self, name: &str) -> Option<&CommandSpec> {
        self.by_name.get(name).map(|&i| &self.commands[i])
    }

    pub fn list(&self) -> &[CommandSpec] {
        &self.commands
    }

    /// Dispatch a command by internal name, converting any `EngineError`
    /// raised by the handler into a `CommandResult{success: false, ..}`
    /// instead of propagating it — this is the one place in the whole
    /// engine that does that conversion.
    pub async fn dispatch(&self, ctx: Arc<EngineContext>, name: &str, args: Value) -> CommandResult {
        let Some(spec) = self.get(name) else {
            return CommandResult {
                success: false,
                data: None,
                message: None,
                error: Some(format!("unknown command '{name}'")),
                agent_name: None,
            };
        };
        match (spec.handler)(ctx, args).await {
            Ok(data) => {
                let agent_name = data
                    .get("agentName")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string());
                let mut result = CommandResult::ok(data);
                result.agent_name = agent_name;
                result
            }
            Err(e) => CommandResult::failure(&e),
        }
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}
