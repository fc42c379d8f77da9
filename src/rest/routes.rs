//! Generic command dispatch route — `POST /api/v1/command/:name` is the one
//! HTTP entry point every command goes through, keyed by `protocol_name`.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use super::RestState;

pub async fn health(State(state): State<Arc<RestState>>) -> (StatusCode, Json<Value>) {
    match state.ctx.storage.health_check().await {
        Ok(status) => (StatusCode::OK, Json(json!(status))),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "healthy": false, "message": e.to_string() })),
        ),
    }
}

pub async fn dispatch_command(
    State(state): State<Arc<RestState>>,
    Path(name): Path<String>,
    body: Option<Json<Value>>,
) -> (StatusCode, Json<Value>) {
    let Some(spec) = state.registry.list().iter().find(|c| c.protocol_name == name) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "success": false, "error": format!("unknown command '{name}'") })),
        );
    };
    let args = body.map(|Json(v)| v).unwrap_or_else(|| json!({}));
    let result = state.registry.dispatch(state.ctx.clone(), spec.name, args).await;
    let status = if result.success { StatusCode::OK } else { StatusCode::BAD_REQUEST };
    (status, Json(serde_json::to_value(&result).unwrap_or(Value::Null)))
}
