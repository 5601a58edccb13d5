use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use studio_core::{
    CommandHandler,
    domain::attendance::{Attendance, AttendanceLedger, AttendanceStatus, MarkAttendance},
};

use crate::application::{ApiResult, JsonBody};
use crate::application::authz::{Requirement, authorize};
use crate::application::middleware::TenantContext;

#[derive(Deserialize)]
pub struct MarkAttendanceBody {
    pub user_id: String,
    pub class_id: String,
    /// Defaults to now. Only its UTC calendar day matters for uniqueness.
    #[serde(default)]
    pub date: Option<DateTime<Utc>>,
    pub status: AttendanceStatus,
}

/// Marking the same user, class and day again overwrites the earlier record.
pub async fn handle_mark_attendance(
    Extension(ctx): Extension<TenantContext>,
    JsonBody(body): JsonBody<MarkAttendanceBody>,
) -> ApiResult<Json<Attendance>> {
    authorize(&ctx.principal, Requirement::AdminOnly)?;
    let now = Utc::now();
    let record = AttendanceLedger::new(ctx.scope.clone())
        .handle(MarkAttendance {
            actor: ctx.principal.clone(),
            user_id: body.user_id,
            class_id: body.class_id,
            date: body.date.unwrap_or(now),
            status: body.status,
            now,
        })
        .await?;
    Ok(Json(record))
}
