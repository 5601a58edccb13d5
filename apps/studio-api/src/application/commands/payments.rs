use axum::{
    Extension, Json,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use serde::Deserialize;
use studio_core::{
    CommandHandler,
    domain::class::PackageType,
    domain::payment::{PaymentIssuer, ProcessPayment},
};

use crate::AppState;
use crate::application::{ApiResult, JsonBody};
use crate::application::authz::{Requirement, authorize};
use crate::application::middleware::TenantContext;

#[derive(Deserialize)]
pub struct PaymentBody {
    pub class_id: String,
    pub package_type: PackageType,
    pub payment_method: String,
}

pub async fn handle_process_payment(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    JsonBody(body): JsonBody<PaymentBody>,
) -> ApiResult<impl IntoResponse> {
    authorize(&ctx.principal, Requirement::UserOnly)?;
    let payment = PaymentIssuer::new(ctx.scope.clone(), state.receipts.clone())
        .handle(ProcessPayment {
            actor: ctx.principal.clone(),
            class_id: body.class_id,
            package: body.package_type,
            payment_method: body.payment_method,
            now: Utc::now(),
        })
        .await?;
    Ok((StatusCode::CREATED, Json(payment)))
}
