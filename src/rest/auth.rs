//! Bearer token auth middleware, adapted from the teacher's `rest/auth.rs`.
//!
//! Token comes from `EngineConfig::api_token` (env `QUESTLOAD_API_TOKEN` or
//! `config.toml`'s `api_token` field). Header: `Authorization: Bearer <token>`.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;

use super::RestState;

pub async fn require_api_auth(State(state): State<Arc<RestState>>, req: Request, next: Next) -> Response {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    let Some(expected) = state.api_token.as_deref() else {
        // No token configured — auth disabled.
        return next.run(req).await;
    };

    match token {
        Some(t) if t == expected => next.run(req).await,
        _ => (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid or missing API token" })),
        )
            .into_response(),
    }
}
