//! OpenAPI 3.1 spec generator, adapted from the teacher's `rest/openapi.rs` —
//! derived from the command registry instead of hand-written per endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use super::RestState;
use crate::command::schema::json_schema_for;

pub async fn openapi_spec(State(state): State<Arc<RestState>>) -> Json<Value> {
    let mut paths = serde_json::Map::new();
    for spec in state.registry.list() {
        paths.insert(
            format!("/api/v1/command/{}", spec.protocol_name),
            json!({
                "post": {
                    "summary": spec.description,
                    "operationId": spec.protocol_name,
                    "security": [{ "BearerAuth": [] }],
                    "requestBody": {
                        "required": true,
                        "content": { "application/json": { "schema": json_schema_for(&spec.params) } },
                    },
                    "responses": {
                        "200": { "description": "CommandResult" },
                    },
                }
            }),
        );
    }

    Json(json!({
        "openapi": "3.1.0",
        "info": {
            "title": "questload API",
            "version": "1.0.0",
            "description": "Lease-based task dispatch and orchestration engine.",
        },
        "security": [{ "BearerAuth": [] }],
        "components": {
            "securitySchemes": {
                "BearerAuth": {
                    "type": "http",
                    "scheme": "bearer",
                    "description": "API token from QUESTLOAD_API_TOKEN or config.toml's api_token field.",
                }
            },
        },
        "paths": Value::Object(paths),
    }))
}
