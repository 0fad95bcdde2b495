//! services/api/src/web/middleware.rs
//!
//! Identity middleware for protecting routes.

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use tracing::warn;

use crate::web::state::AppState;
use couple_chat_core::Identity;

/// Middleware that resolves the identity cookie into an `Identity`.
///
/// If valid, inserts the identity into request extensions for handlers to use.
/// If invalid or missing, returns 401 Unauthorized.
pub async fn require_identity(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    // 1. Resolve the identity cookie
    let identity = identify(&state, req.headers()).await?;

    // 2. Insert the identity into request extensions
    req.extensions_mut().insert(identity);

    // 3. Continue to the handler
    Ok(next.run(req).await)
}

async fn identify(state: &AppState, headers: &HeaderMap) -> Result<Identity, StatusCode> {
    // Missing cookie is rejected before the resolver is consulted.
    let token = cookie_value(headers, &state.config.identity_cookie).ok_or(StatusCode::UNAUTHORIZED)?;
    state.identities.resolve_identity(token).await.map_err(|e| {
        warn!("Rejected identity cookie: {}", e);
        StatusCode::UNAUTHORIZED
    })
}

fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .find_map(|pair| {
            let (key, value) = pair.trim().split_once('=')?;
            (key == name).then_some(value)
        })
}
