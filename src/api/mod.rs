//! HTTP surface: axum routers per module, merged into one application with
//! tracing, CORS, and optional bearer authorization.

pub mod analyze;
pub mod health;
pub mod issues;
pub mod rules;
pub mod settings;
pub mod tasks;
pub mod webhooks;

use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the application router with all routes and middleware.
pub fn build_app(state: AppState) -> Router {
    // Uploads may carry whole log bundles; the archive quota is the
    // request-size ceiling
    let body_limit = state.boot_config.limits.max_total_bytes.min(usize::MAX as u64) as usize;

    Router::new()
        .merge(analyze::router())
        .merge(tasks::router())
        .merge(issues::router())
        .merge(rules::router())
        .merge(settings::router())
        .merge(webhooks::router())
        .merge(health::router())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_bearer,
        ))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Optional bearer authorization. When a token is configured, every route
/// except the health probes and inbound webhooks (which carry their own
/// signature) must present it.
async fn require_bearer(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(expected) = state
        .boot_config
        .server
        .bearer_token
        .as_deref()
        .filter(|t| !t.is_empty())
    else {
        return Ok(next.run(request).await);
    };

    let path = request.uri().path();
    if path.starts_with("/health") || path.starts_with("/webhooks/") {
        return Ok(next.run(request).await);
    }

    let authorized = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|token| token == expected)
        .unwrap_or(false);

    if authorized {
        Ok(next.run(request).await)
    } else {
        Err(StatusCode::UNAUTHORIZED)
    }
}
