//! Converts parsed `clap::ArgMatches` into the JSON `CommandArgs` blob the
//! command registry expects, resolving the `@path`/`@-` file/stdin
//! indirection `spec.md` §6 defines for string-typed CLI inputs.

use std::io::Read;

use clap::ArgMatches;
use serde_json::{Map, Value};

use crate::command::{CommandSpec, ParamType};

pub fn collect(spec: &CommandSpec, matches: &ArgMatches) -> Result<Value, String> {
    let mut map = Map::new();
    for param in &spec.params {
        match param.param_type {
            ParamType::Boolean => {
                if matches.get_flag(param.name) {
                    map.insert(param.name.to_string(), Value::Bool(true));
                } else if let Some(default) = &param.default {
                    map.insert(param.name.to_string(), default.clone());
                }
            }
            ParamType::Number => {
                if let Some(raw) = matches.get_one::<String>(param.name) {
                    let n: f64 = raw
                        .parse()
                        .map_err(|_| format!("'{}' must be a number, got '{raw}'", param.name))?;
                    map.insert(param.name.to_string(), json_number(n));
                } else if let Some(default) = &param.default {
                    map.insert(param.name.to_string(), default.clone());
                }
            }
            ParamType::String => {
                if let Some(raw) = matches.get_one::<String>(param.name) {
                    let resolved = resolve_indirection(raw)?;
                    map.insert(param.name.to_string(), Value::String(resolved));
                } else if let Some(default) = &param.default {
                    map.insert(param.name.to_string(), default.clone());
                }
            }
            ParamType::Array => {
                if let Some(raw) = matches.get_one::<String>(param.name) {
                    let resolved = resolve_indirection(raw)?;
                    let parsed: Value = serde_json::from_str(&resolved)
                        .map_err(|e| format!("'{}' must be valid JSON: {e}", param.name))?;
                    map.insert(param.name.to_string(), parsed);
                } else if let Some(default) = &param.default {
                    map.insert(param.name.to_string(), default.clone());
                }
            }
        }
    }
    Ok(Value::Object(map))
}

fn json_number(n: f64) -> Value {
    if n.fract() == 0.0 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

/// `@-` reads stdin to EOF; `@<path>` reads the named file; anything else
/// passes through unchanged.
fn resolve_indirection(raw: &str) -> Result<String, String> {
    if raw == "@-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .map_err(|e| format!("failed to read stdin: {e}"))?;
        return Ok(buf);
    }
    if let Some(path) = raw.strip_prefix('@') {
        return std::fs::read_to_string(path).map_err(|e| format!("failed to read '{path}': {e}"));
    }
    Ok(raw.to_string())
}
