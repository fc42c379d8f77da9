//! Human-readable rendering of a `CommandResult` for terminal use; `--json`
//! bypasses this entirely in favor of raw `serde_json`.

use crate::command::CommandResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Human,
    Json,
}

pub fn print_human(command_name: &str, result: &CommandResult) {
    if !result.success {
        eprintln!(
            "error: {}",
            result.error.as_deref().unwrap_or("command failed")
        );
        return;
    }

    if let Some(agent_name) = &result.agent_name {
        println!("agent: {agent_name}");
    }
    if let Some(message) = &result.message {
        println!("{message}");
    }

    match &result.data {
        None => println!("ok"),
        Some(data) => match data {
            serde_json::Value::Null => println!("ok"),
            serde_json::Value::Array(items) => {
                println!("{} result(s)", items.len());
                for item in items {
                    println!("- {}", summarize(item));
                }
            }
            serde_json::Value::Object(_) => println!("{}", summarize(data)),
            other => println!("{other}"),
        },
    }
    let _ = command_name;
}

/// A compact one-line summary of an object, preferring the fields most
/// commands key their records by.
fn summarize(value: &serde_json::Value) -> String {
    let Some(obj) = value.as_object() else {
        return value.to_string();
    };
    for key in ["id", "taskId", "projectId", "name", "status"] {
        if let Some(v) = obj.get(key) {
            if let Some(s) = v.as_str() {
                return format!("{key}={s}");
            }
        }
    }
    serde_json::to_string(value).unwrap_or_default()
}
