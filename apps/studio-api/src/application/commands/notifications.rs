use axum::{
    Extension, Json,
    extract::Path,
};
use studio_core::domain::notification::{self, Notification};

use crate::application::ApiResult;
use crate::application::middleware::TenantContext;

pub async fn handle_mark_read(
    Extension(ctx): Extension<TenantContext>,
    Path(notification_id): Path<String>,
) -> ApiResult<Json<Notification>> {
    let updated =
        notification::mark_read(ctx.scope.db.as_ref(), &ctx.principal.id, &notification_id)
            .await?;
    Ok(Json(updated))
}
