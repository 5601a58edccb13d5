use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use serde::{Deserialize, Serialize};
use studio_core::domain::user::Role;
use tracing::{debug, warn};

use crate::AppState;
use crate::application::ApiError;

/// Session payload stored in the cache under [`session_key`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthenticatedUser {
    pub user_id: String,
    pub role: Role,
}

/// The bearer token the current request was authenticated with.
#[derive(Clone, Debug)]
pub struct SessionToken(pub String);

pub fn session_key(token: &str) -> String {
    format!("session:{token}")
}

fn bearer_token(req: &Request) -> Option<&str> {
    req.headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Rejects requests without a live session token.
pub async fn require_session(
    State(app_state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = match bearer_token(&req) {
        Some(token) => token.to_string(),
        None => {
            debug!("Missing or malformed Authorization header");
            return Err(ApiError::Unauthenticated);
        }
    };

    let cached = match app_state.cache.get(&session_key(&token)).await {
        Ok(Some(bytes)) => bytes,
        Ok(None) => {
            warn!("Bearer token not found in session cache");
            return Err(ApiError::Unauthenticated);
        }
        Err(e) => {
            // Cannot confirm the session, so treat it as absent.
            warn!("Cache error during session lookup: {}", e);
            return Err(ApiError::Unauthenticated);
        }
    };

    let session = serde_json::from_slice::<AuthenticatedUser>(&cached).map_err(|e| {
        warn!("Failed to deserialize cached session: {}", e);
        ApiError::Unauthenticated
    })?;

    debug!(user_id = %session.user_id, "Session authenticated");
    req.extensions_mut().insert(session);
    req.extensions_mut().insert(SessionToken(token));
    Ok(next.run(req).await)
}
