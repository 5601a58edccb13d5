use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use serde::Serialize;
use studio_core::{
    CommandHandler,
    domain::class::{ClassDirectory, ClassDraft, CreateClass, DeleteClass, UpdateClass},
};

use crate::AppState;
use crate::application::{ApiResult, JsonBody};
use crate::application::authz::{Requirement, authorize};
use crate::application::middleware::TenantContext;

#[derive(Serialize)]
pub struct DeliveryResponse {
    pub notified: usize,
}

fn directory(state: &AppState, ctx: &TenantContext) -> ClassDirectory {
    ClassDirectory::new(ctx.scope.clone(), state.notifier())
}

pub async fn handle_create_class(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    JsonBody(draft): JsonBody<ClassDraft>,
) -> ApiResult<impl IntoResponse> {
    authorize(&ctx.principal, Requirement::AdminOnly)?;
    let class = directory(&state, &ctx)
        .handle(CreateClass {
            actor: ctx.principal.clone(),
            draft,
            now: Utc::now(),
        })
        .await?;
    Ok((StatusCode::CREATED, Json(class)))
}

pub async fn handle_update_class(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Path(class_id): Path<String>,
    JsonBody(draft): JsonBody<ClassDraft>,
) -> ApiResult<impl IntoResponse> {
    authorize(&ctx.principal, Requirement::AdminOnly)?;
    let class = directory(&state, &ctx)
        .handle(UpdateClass {
            actor: ctx.principal.clone(),
            class_id,
            draft,
            now: Utc::now(),
        })
        .await?;
    Ok(Json(class))
}

/// Soft delete: the class stays readable by id but leaves the listings.
pub async fn handle_delete_class(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Path(class_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    authorize(&ctx.principal, Requirement::AdminOnly)?;
    let class = directory(&state, &ctx)
        .handle(DeleteClass {
            actor: ctx.principal.clone(),
            class_id,
            now: Utc::now(),
        })
        .await?;
    Ok(Json(class))
}

pub async fn handle_send_meeting_link(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Path(class_id): Path<String>,
) -> ApiResult<Json<DeliveryResponse>> {
    authorize(&ctx.principal, Requirement::AdminOnly)?;
    let notified = directory(&state, &ctx)
        .send_meeting_link(&ctx.principal, &class_id, Utc::now())
        .await?;
    Ok(Json(DeliveryResponse { notified }))
}
