use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use serde::Deserialize;
use studio_core::{
    CommandHandler,
    domain::class::PackageType,
    domain::request::{ClassRequest, DecideRequest, Decision, RequestClass},
};

use crate::AppState;
use crate::application::{ApiResult, JsonBody};
use crate::application::authz::{Requirement, authorize};
use crate::application::middleware::TenantContext;

#[derive(Deserialize)]
pub struct EnrollmentRequestBody {
    pub package_type: PackageType,
}

pub async fn handle_request_class(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Path(class_id): Path<String>,
    JsonBody(body): JsonBody<EnrollmentRequestBody>,
) -> ApiResult<impl IntoResponse> {
    authorize(&ctx.principal, Requirement::UserOnly)?;
    let request = state
        .enrollment(&ctx)
        .handle(RequestClass {
            actor: ctx.principal.clone(),
            class_id,
            package: body.package_type,
            now: Utc::now(),
        })
        .await?;
    Ok((StatusCode::CREATED, Json(request)))
}

async fn decide(
    state: AppState,
    ctx: TenantContext,
    request_id: String,
    decision: Decision,
) -> ApiResult<Json<ClassRequest>> {
    authorize(&ctx.principal, Requirement::AdminOnly)?;
    let request = state
        .enrollment(&ctx)
        .handle(DecideRequest {
            actor: ctx.principal.clone(),
            request_id,
            decision,
            now: Utc::now(),
        })
        .await?;
    Ok(Json(request))
}

pub async fn handle_accept_request(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Path(request_id): Path<String>,
) -> ApiResult<Json<ClassRequest>> {
    decide(state, ctx, request_id, Decision::Accept).await
}

/// Rejecting also refunds the payment linked to the request, if any.
pub async fn handle_reject_request(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Path(request_id): Path<String>,
) -> ApiResult<Json<ClassRequest>> {
    decide(state, ctx, request_id, Decision::Reject).await
}
