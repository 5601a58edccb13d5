use axum::{
    Extension, Json,
    extract::{Path, State},
};
use serde::Deserialize;
use studio_core::{
    CommandHandler,
    domain::account::{AccountDeletion, AccountService, DeleteAccount, DeletionReport},
    domain::user::User,
};
use tracing::{info, warn};

use crate::AppState;
use crate::application::{ApiResult, JsonBody};
use crate::application::middleware::{SessionToken, TenantContext, session_key};

#[derive(Deserialize)]
pub struct ProfileBody {
    pub name: String,
}

#[derive(Deserialize)]
pub struct SelectAdminBody {
    pub admin_id: String,
}

pub async fn handle_update_profile(
    Extension(ctx): Extension<TenantContext>,
    JsonBody(body): JsonBody<ProfileBody>,
) -> ApiResult<Json<User>> {
    let user = AccountService::new(ctx.scope.clone())
        .update_profile(&ctx.principal, &body.name)
        .await?;
    Ok(Json(user))
}

/// Moves a user into an admin's tenant. Takes effect from the next request.
pub async fn handle_select_admin(
    Extension(ctx): Extension<TenantContext>,
    JsonBody(body): JsonBody<SelectAdminBody>,
) -> ApiResult<Json<User>> {
    let user = AccountService::new(ctx.scope.clone())
        .select_admin(&ctx.principal, &body.admin_id)
        .await?;
    Ok(Json(user))
}

pub async fn handle_deactivate_user(
    Extension(ctx): Extension<TenantContext>,
    Path(user_id): Path<String>,
) -> ApiResult<Json<User>> {
    let user = AccountService::new(ctx.scope.clone())
        .deactivate(&ctx.principal, &user_id)
        .await?;
    Ok(Json(user))
}

/// Runs the deletion cascade, then drops the caller's session.
pub async fn handle_delete_account(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Extension(token): Extension<SessionToken>,
) -> ApiResult<Json<DeletionReport>> {
    let report = AccountDeletion::new(state.registry.clone())
        .handle(DeleteAccount {
            actor: ctx.principal.clone(),
        })
        .await?;
    if let Err(e) = state.cache.delete(&session_key(&token.0)).await {
        // The account is gone; a stale session fails tenant resolution anyway.
        warn!(user_id = %ctx.principal.id, "Failed to drop session: {}", e);
    }
    info!(user_id = %ctx.principal.id, "Account deleted");
    Ok(Json(report))
}
