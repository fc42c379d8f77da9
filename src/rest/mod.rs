//! HTTP shell — one route per command, grouped under `/api/v1`, the same
//! shape as the teacher's `rest/` module (`auth`, `openapi`, one router
//! assembled from handler modules). Sessions and bearer auth are entirely
//! this shell's concern; the engine itself has no notion of either
//! (`spec.md` §4.1).

mod auth;
mod openapi;
mod routes;
mod session;

use std::sync::Arc;
use std::time::Duration;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::command::CommandRegistry;
use crate::config::EngineConfig;
use crate::EngineContext;

/// Shared state for every HTTP handler.
pub struct RestState {
    pub ctx: Arc<EngineContext>,
    pub registry: CommandRegistry,
    pub api_token: Option<String>,
    pub session_ttl: chrono::Duration,
}

impl RestState {
    pub fn new(ctx: Arc<EngineContext>, config: &EngineConfig) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            registry: CommandRegistry::new(),
            api_token: config.api_token.clone(),
            session_ttl: chrono::Duration::minutes(config.session_ttl_minutes),
        })
    }
}

/// Build the full axum router: health + openapi are unauthenticated, session
/// management and every command route sit behind `auth::require_api_auth`.
pub fn router(state: Arc<RestState>) -> Router {
    let authenticated = Router::new()
        .route("/sessions", post(session::create_session))
        .route("/sessions/:id", get(session::get_session).delete(session::delete_session))
        .route("/command/:name", post(routes::dispatch_command))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_api_auth));

    Router::new()
        .route("/health", get(routes::health))
        .route("/openapi.json", get(openapi::openapi_spec))
        .nest("/api/v1", authenticated)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the HTTP shell until the process is asked to shut down.
pub async fn serve(state: Arc<RestState>, port: u16) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(%port, "HTTP shell listening");
    axum::serve(listener, app).await?;
    Ok(())
}

pub const EXPIRED_SESSION_SWEEP: Duration = Duration::from_secs(300);

/// Background loop that periodically purges expired sessions — the HTTP
/// shell's own housekeeping, parallel to the reaper's lease sweep.
pub async fn run_session_sweeper(state: Arc<RestState>) {
    let mut ticker = tokio::time::interval(EXPIRED_SESSION_SWEEP);
    loop {
        ticker.tick().await;
        match state.ctx.storage.cleanup_expired_sessions().await {
            Ok(n) if n > 0 => tracing::debug!(count = n, "swept expired sessions"),
            Ok(_) => {}
            Err(e) => tracing::warn!(err = %e, "session sweep failed"),
        }
    }
}
