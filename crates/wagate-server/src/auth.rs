//! Request authentication.
//!
//! Management routes take `Authorization: Bearer <token>` when an admin
//! token is configured. Send routes take the instance's own key in the
//! `apikey` header.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use tracing::debug;

use wagate_engine::Instance;

use crate::error::ApiError;
use crate::server::AppState;

pub const API_KEY_HEADER: &str = "apikey";

pub(crate) async fn require_admin(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if let Some(token) = &state.admin_token {
        let presented = request
            .headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or(ApiError::Unauthorized("missing bearer token"))?;
        if !token.matches(presented.trim()) {
            debug!(path = %request.uri().path(), "admin token rejected");
            return Err(ApiError::Unauthorized("invalid admin token"));
        }
    }
    Ok(next.run(request).await)
}

/// Resolves `name` and checks the `apikey` header against its key.
pub(crate) fn authorize_instance(
    state: &AppState,
    name: &str,
    headers: &HeaderMap,
) -> Result<Arc<Instance>, ApiError> {
    let presented = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::Unauthorized("missing apikey header"))?;
    let instance = state.manager.get(name)?;
    if !instance.verify_api_key(presented) {
        debug!(instance = %name, "api key rejected");
        return Err(ApiError::Unauthorized("invalid apikey"));
    }
    Ok(instance)
}
