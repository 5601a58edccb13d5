use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use studio_core::domain::user::User;
use studio_core::tenancy::{TenantId, TenantScope};
use tracing::{debug, warn};

use super::auth::AuthenticatedUser;
use crate::AppState;
use crate::application::ApiError;

/// The caller and the tenant database every handler in the request works in.
#[derive(Clone, Debug)]
pub struct TenantContext {
    /// Fresh copy from the directory, not the cached session.
    pub principal: User,
    pub scope: TenantScope,
}

/// Resolves the caller's tenant and attaches a [`TenantContext`].
/// Must run after [`super::require_session`].
pub async fn resolve_tenant(
    State(app_state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let session = req
        .extensions()
        .get::<AuthenticatedUser>()
        .cloned()
        .ok_or(ApiError::Unauthenticated)?;

    let directory = app_state.registry.main().await?;
    let principal = match directory.get_user(&session.user_id).await? {
        Some(user) => user,
        None => {
            warn!(user_id = %session.user_id, "Session belongs to a deleted account");
            return Err(ApiError::Unauthenticated);
        }
    };

    let tenant = TenantId::for_principal(&principal)?;
    let scope = app_state.registry.scope(tenant).await?;
    debug!(user_id = %principal.id, tenant = %scope.tenant, "Tenant resolved");

    req.extensions_mut()
        .insert(TenantContext { principal, scope });
    Ok(next.run(req).await)
}
