//! Read-only endpoints. Every query runs inside the caller's tenant.

use axum::{
    Extension, Json,
    extract::{Path, State},
};
use chrono::Utc;
use studio_core::domain::{
    account::AccountService,
    attendance::{Attendance, AttendanceLedger, AttendanceStats},
    class::{Class, ClassDirectory},
    notification::{self, Notification},
    payment::{Payment, PaymentIssuer},
    request::RequestView,
    user::User,
};

use crate::AppState;
use crate::application::ApiResult;
use crate::application::authz::{Requirement, authorize};
use crate::application::middleware::TenantContext;

pub async fn handle_list_admins(
    Extension(ctx): Extension<TenantContext>,
) -> ApiResult<Json<Vec<User>>> {
    let admins = AccountService::new(ctx.scope.clone()).list_admins().await?;
    Ok(Json(admins))
}

pub async fn handle_profile(Extension(ctx): Extension<TenantContext>) -> ApiResult<Json<User>> {
    let user = AccountService::new(ctx.scope.clone())
        .profile(&ctx.principal)
        .await?;
    Ok(Json(user))
}

pub async fn handle_list_classes(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
) -> ApiResult<Json<Vec<Class>>> {
    let classes = ClassDirectory::new(ctx.scope.clone(), state.notifier())
        .list_active()
        .await?;
    Ok(Json(classes))
}

pub async fn handle_enrolled_classes(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
) -> ApiResult<Json<Vec<Class>>> {
    authorize(&ctx.principal, Requirement::UserOnly)?;
    let classes = ClassDirectory::new(ctx.scope.clone(), state.notifier())
        .enrolled_in(&ctx.principal.id)
        .await?;
    Ok(Json(classes))
}

pub async fn handle_class_students(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Path(class_id): Path<String>,
) -> ApiResult<Json<Vec<User>>> {
    authorize(&ctx.principal, Requirement::AdminOnly)?;
    let students = ClassDirectory::new(ctx.scope.clone(), state.notifier())
        .students(&ctx.principal, &class_id)
        .await?;
    Ok(Json(students))
}

/// Pending requests of the tenant. Overdue ones carry `expired: true` until
/// the sweep rejects them.
pub async fn handle_pending_requests(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
) -> ApiResult<Json<Vec<RequestView>>> {
    authorize(&ctx.principal, Requirement::AdminOnly)?;
    let requests = state.enrollment(&ctx).list_pending(Utc::now()).await?;
    Ok(Json(requests))
}

pub async fn handle_my_requests(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
) -> ApiResult<Json<Vec<RequestView>>> {
    authorize(&ctx.principal, Requirement::UserOnly)?;
    let requests = state
        .enrollment(&ctx)
        .list_for_user(&ctx.principal.id, Utc::now())
        .await?;
    Ok(Json(requests))
}

pub async fn handle_list_notifications(
    Extension(ctx): Extension<TenantContext>,
) -> ApiResult<Json<Vec<Notification>>> {
    let inbox = notification::list_for_recipient(ctx.scope.db.as_ref(), &ctx.principal.id).await?;
    Ok(Json(inbox))
}

pub async fn handle_class_attendance(
    Extension(ctx): Extension<TenantContext>,
    Path(class_id): Path<String>,
) -> ApiResult<Json<Vec<Attendance>>> {
    authorize(&ctx.principal, Requirement::AdminOnly)?;
    let records = AttendanceLedger::new(ctx.scope.clone())
        .for_class(&class_id)
        .await?;
    Ok(Json(records))
}

pub async fn handle_user_attendance(
    Extension(ctx): Extension<TenantContext>,
    Path(user_id): Path<String>,
) -> ApiResult<Json<Vec<Attendance>>> {
    authorize(&ctx.principal, Requirement::AdminOnly)?;
    let records = AttendanceLedger::new(ctx.scope.clone())
        .for_user(&user_id)
        .await?;
    Ok(Json(records))
}

pub async fn handle_my_attendance(
    Extension(ctx): Extension<TenantContext>,
) -> ApiResult<Json<Vec<Attendance>>> {
    authorize(&ctx.principal, Requirement::UserOnly)?;
    let records = AttendanceLedger::new(ctx.scope.clone())
        .for_user(&ctx.principal.id)
        .await?;
    Ok(Json(records))
}

pub async fn handle_attendance_stats(
    Extension(ctx): Extension<TenantContext>,
    Path(user_id): Path<String>,
) -> ApiResult<Json<AttendanceStats>> {
    authorize(&ctx.principal, Requirement::AdminOnly)?;
    let stats = AttendanceLedger::new(ctx.scope.clone())
        .stats(&user_id)
        .await?;
    Ok(Json(stats))
}

pub async fn handle_list_payments(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
) -> ApiResult<Json<Vec<Payment>>> {
    let payments = PaymentIssuer::new(ctx.scope.clone(), state.receipts.clone())
        .list_own(&ctx.principal)
        .await?;
    Ok(Json(payments))
}

pub async fn handle_receipt(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Path(payment_id): Path<String>,
) -> ApiResult<Json<Payment>> {
    authorize(&ctx.principal, Requirement::UserOnly)?;
    let payment = PaymentIssuer::new(ctx.scope.clone(), state.receipts.clone())
        .receipt(&ctx.principal, &payment_id)
        .await?;
    Ok(Json(payment))
}
