//! Parameter schema shared by every command — drives CLI arg parsing, MCP
//! `tools/list` JSON-schema generation, and HTTP body validation, so the
//! schema is declared exactly once per command (`spec.md` §4.9, §6).

use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    String,
    Number,
    Boolean,
    Array,
}

impl ParamType {
    fn json_schema_type(self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Number => "number",
            ParamType::Boolean => "boolean",
            ParamType::Array => "array",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub name: &'static str,
    pub param_type: ParamType,
    pub required: bool,
    /// Positional on the CLI (in declaration order) rather than a flag.
    pub positional: bool,
    pub default: Option<Value>,
    pub choices: Option<&'static [&'static str]>,
    /// Short flag alias for the CLI (e.g. `-t` for `--type`).
    pub alias: Option<&'static str>,
    pub description: &'static str,
}

impl ParamSpec {
    pub fn new(name: &'static str, param_type: ParamType, description: &'static str) -> Self {
        Self {
            name,
            param_type,
            required: false,
            positional: false,
            default: None,
            choices: None,
            alias: None,
            description,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn positional(mut self) -> Self {
        self.positional = true;
        self
    }

    pub fn default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn choices(mut self, choices: &'static [&'static str]) -> Self {
        self.choices = Some(choices);
        self
    }

    pub fn alias(mut self, alias: &'static str) -> Self {
        self.alias = Some(alias);
        self
    }

    /// This parameter's entry inside a JSON-schema `properties` object, for
    /// the MCP shell's `tools/list`.
    pub fn json_schema_property(&self) -> Value {
        let mut prop = json!({ "type": self.param_type.json_schema_type() });
        if let Some(choices) = self.choices {
            prop["enum"] = json!(choices);
        }
        if let Some(default) = &self.default {
            prop["default"] = default.clone();
        }
        prop["description"] = json!(self.description);
        prop
    }
}

/// Build a JSON-schema `inputSchema` object (MCP tool convention) from a
/// command's full parameter list.
pub fn json_schema_for(params: &[ParamSpec]) -> Value {
    let mut properties = serde_json::Map::new();
    let mut required = Vec::new();
    for p in params {
        properties.insert(p.name.to_string(), p.json_schema_property());
        if p.required {
            required.push(p.name);
        }
    }
    json!({
        "type": "object",
        "properties": Value::Object(properties),
        "required": required,
    })
}
