//! Session CRUD for the HTTP shell. Purely this shell's concern — the engine
//! core has no notion of sessions (`spec.md` §4.1).

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use super::RestState;
use crate::model::new_id;
use crate::storage::Session;

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub agent_name: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
}

pub async fn create_session(
    State(state): State<Arc<RestState>>,
    Json(req): Json<CreateSessionRequest>,
) -> (StatusCode, Json<Value>) {
    let now = Utc::now();
    let session = Session {
        id: new_id(),
        agent_name: req.agent_name,
        data: req.data.unwrap_or(json!({})),
        created_at: now,
        expires_at: now + state.session_ttl,
    };
    match state.ctx.storage.create_session(session).await {
        Ok(session) => (StatusCode::CREATED, Json(json!(session))),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": e.to_string() }))),
    }
}

pub async fn get_session(State(state): State<Arc<RestState>>, Path(id): Path<String>) -> (StatusCode, Json<Value>) {
    match state.ctx.storage.get_session(&id).await {
        Ok(Some(session)) => (StatusCode::OK, Json(json!(session))),
        Ok(None) => (StatusCode::NOT_FOUND, Json(json!({ "error": "session not found" }))),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": e.to_string() }))),
    }
}

pub async fn delete_session(State(state): State<Arc<RestState>>, Path(id): Path<String>) -> StatusCode {
    match state.ctx.storage.delete_session(&id).await {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(_) => StatusCode::NOT_FOUND,
    }
}
