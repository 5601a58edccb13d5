use axum::{
    Router,
    middleware,
    routing::{delete, get, post, put},
};
use std::sync::Arc;
use studio_core::{
    Cache, EventPublisher,
    domain::{notification::Notifier, payment::ReceiptIssuer, request::EnrollmentWorkflow},
    tenancy::ConnectionRegistry,
};
use tower_http::cors::{Any, CorsLayer};

pub mod application;
pub mod config;

use application::{
    commands::{
        account::{
            handle_deactivate_user, handle_delete_account, handle_select_admin,
            handle_update_profile,
        },
        attendance::handle_mark_attendance,
        auth::{handle_login, handle_logout, handle_register},
        classes::{
            handle_create_class, handle_delete_class, handle_send_meeting_link,
            handle_update_class,
        },
        enrollment::{handle_accept_request, handle_reject_request, handle_request_class},
        notifications::handle_mark_read,
        payments::handle_process_payment,
    },
    middleware::{TenantContext, require_session, resolve_tenant},
    query::{
        handle_attendance_stats, handle_class_attendance, handle_class_students,
        handle_enrolled_classes, handle_list_admins, handle_list_classes,
        handle_list_notifications, handle_list_payments, handle_my_attendance,
        handle_my_requests, handle_pending_requests, handle_profile, handle_receipt,
        handle_user_attendance,
    },
};
pub use application::{ApiError, map_core_error};
pub use config::AppConfig;

// Holds shared dependencies
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub cache: Arc<dyn Cache>,
    pub event_bus: Arc<dyn EventPublisher>,
    pub receipts: Arc<ReceiptIssuer>,
    pub config: Arc<AppConfig>,
}

impl AppState {
    pub fn notifier(&self) -> Notifier {
        Notifier::new(self.event_bus.clone())
    }

    pub fn enrollment(&self, ctx: &TenantContext) -> EnrollmentWorkflow {
        EnrollmentWorkflow::new(
            ctx.scope.clone(),
            self.notifier(),
            self.config.auto_reject_after(),
        )
    }
}

pub fn create_app(app_state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/auth/register", post(handle_register))
        .route("/auth/login", post(handle_login));

    let protected_routes = Router::new()
        .route("/auth/logout", post(handle_logout))
        .route("/admins", get(handle_list_admins))
        .route(
            "/users/me",
            get(handle_profile)
                .put(handle_update_profile)
                .delete(handle_delete_account),
        )
        .route("/users/me/admin", put(handle_select_admin))
        .route("/users/{user_id}/deactivate", put(handle_deactivate_user))
        .route("/classes", get(handle_list_classes).post(handle_create_class))
        .route("/classes/requests", get(handle_pending_requests))
        .route("/classes/my-requests", get(handle_my_requests))
        .route("/classes/enrolled", get(handle_enrolled_classes))
        .route(
            "/classes/{class_id}",
            put(handle_update_class).delete(handle_delete_class),
        )
        .route("/classes/{class_id}/students", get(handle_class_students))
        .route("/classes/{class_id}/meeting-link", post(handle_send_meeting_link))
        .route("/classes/{class_id}/request", post(handle_request_class))
        .route("/notifications", get(handle_list_notifications))
        .route(
            "/notifications/accept-request/{request_id}",
            post(handle_accept_request),
        )
        .route(
            "/notifications/reject-request/{request_id}",
            post(handle_reject_request),
        )
        .route("/notifications/{notification_id}/read", put(handle_mark_read))
        .route("/attendance", post(handle_mark_attendance))
        .route("/attendance/me", get(handle_my_attendance))
        .route("/attendance/class/{class_id}", get(handle_class_attendance))
        .route("/attendance/user/{user_id}", get(handle_user_attendance))
        .route("/attendance/stats/{user_id}", get(handle_attendance_stats))
        .route("/payments", get(handle_list_payments).post(handle_process_payment))
        .route("/payments/receipt/{payment_id}", get(handle_receipt))
        // Layers run bottom-up: session check first, then tenant resolution.
        .route_layer(middleware::from_fn_with_state(
            app_state.clone(),
            resolve_tenant,
        ))
        .route_layer(middleware::from_fn_with_state(
            app_state.clone(),
            require_session,
        ));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .nest("/api", public_routes.merge(protected_routes))
        .layer(cors)
        .with_state(app_state)
}
