use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{error::Error as StdError, fmt::Debug, future::Future, sync::Arc};

// Declare modules
pub mod adapters;
pub mod config;
pub mod domain;
pub mod tenancy;

use domain::{
    attendance::{Attendance, AttendanceFilter},
    class::Class,
    notification::Notification,
    payment::Payment,
    request::{ClassRequest, RequestFilter, RequestStatus},
    user::{User, UserFilter},
};

// Common error type for the core library
#[derive(thiserror::Error, Debug)]
pub enum CoreError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Infrastructure error: {0}")]
    Infrastructure(#[from] Box<dyn StdError + Send + Sync>),
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Wraps a driver error coming out of an adapter.
    pub fn infrastructure<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        CoreError::Infrastructure(Box::new(err))
    }
}

// Marker trait for commands
pub trait Command: Send + Sync + 'static {}

// Port for handling commands. Unlike queries, commands mutate tenant state.
pub trait CommandHandler<C: Command>: Send + Sync {
    type Output: Send;

    fn handle(&self, command: C) -> impl Future<Output = Result<Self::Output, CoreError>> + Send;
}

// --- Document store ports ---
// One logical database per tenant implements all of these. The "main" database
// additionally holds the user directory.

#[async_trait]
pub trait UserRepository: Send + Sync {
    /// Fails with `Conflict` when the email is already registered.
    async fn insert_user(&self, user: User) -> Result<User, CoreError>;
    async fn get_user(&self, user_id: &str) -> Result<Option<User>, CoreError>;
    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, CoreError>;
    async fn list_users(&self, filter: &UserFilter) -> Result<Vec<User>, CoreError>;
    async fn update_user(&self, user: &User) -> Result<(), CoreError>;
    /// Returns false when there was nothing to delete.
    async fn delete_user(&self, user_id: &str) -> Result<bool, CoreError>;
}

#[async_trait]
pub trait ClassRepository: Send + Sync {
    async fn insert_class(&self, class: Class) -> Result<Class, CoreError>;
    async fn get_class(&self, class_id: &str) -> Result<Option<Class>, CoreError>;
    async fn list_classes(&self, active_only: bool) -> Result<Vec<Class>, CoreError>;
    async fn update_class(&self, class: &Class) -> Result<(), CoreError>;
    /// Set-union insert. Returns true only when the user was not enrolled before.
    async fn add_enrolled(&self, class_id: &str, user_id: &str) -> Result<bool, CoreError>;
    /// Removes the user from every enrollment list, returning the number of classes touched.
    async fn remove_enrolled_everywhere(&self, user_id: &str) -> Result<u64, CoreError>;
}

#[async_trait]
pub trait RequestRepository: Send + Sync {
    /// Inserts a pending request. Fails with `Conflict` when the (user, class) pair
    /// already has a pending request.
    async fn insert_pending(&self, request: ClassRequest) -> Result<ClassRequest, CoreError>;
    async fn get_request(&self, request_id: &str) -> Result<Option<ClassRequest>, CoreError>;
    async fn list_requests(&self, filter: &RequestFilter) -> Result<Vec<ClassRequest>, CoreError>;
    /// Compare-and-set on status. Returns the updated request, or None when the
    /// request is missing or no longer in `from`.
    async fn transition_request(
        &self,
        request_id: &str,
        from: RequestStatus,
        to: RequestStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<ClassRequest>, CoreError>;
    async fn link_payment(&self, request_id: &str, payment_id: &str) -> Result<(), CoreError>;
    async fn delete_requests_for_user(&self, user_id: &str) -> Result<u64, CoreError>;
}

#[async_trait]
pub trait AttendanceRepository: Send + Sync {
    /// Upsert keyed by (user, class, day). An existing record keeps its id.
    async fn upsert_attendance(&self, record: Attendance) -> Result<Attendance, CoreError>;
    /// Newest first.
    async fn list_attendance(&self, filter: &AttendanceFilter)
    -> Result<Vec<Attendance>, CoreError>;
    async fn delete_attendance_for_user(&self, user_id: &str) -> Result<u64, CoreError>;
}

#[async_trait]
pub trait PaymentRepository: Send + Sync {
    async fn insert_payment(&self, payment: Payment) -> Result<Payment, CoreError>;
    async fn get_payment(&self, payment_id: &str) -> Result<Option<Payment>, CoreError>;
    async fn list_payments_for_user(&self, user_id: &str) -> Result<Vec<Payment>, CoreError>;
    /// Returns true when the payment changed state; refunding twice is a no-op.
    async fn refund_payment(&self, payment_id: &str) -> Result<bool, CoreError>;
    async fn refund_payments_for_user(&self, user_id: &str) -> Result<u64, CoreError>;
}

#[async_trait]
pub trait NotificationRepository: Send + Sync {
    async fn insert_notifications(&self, notifications: &[Notification]) -> Result<(), CoreError>;
    /// Newest first.
    async fn list_notifications(&self, recipient: &str) -> Result<Vec<Notification>, CoreError>;
    /// None when the notification is missing or belongs to someone else.
    async fn mark_notification_read(
        &self,
        notification_id: &str,
        recipient: &str,
    ) -> Result<Option<Notification>, CoreError>;
    /// Deletes notifications the user sent or received.
    async fn delete_notifications_for_user(&self, user_id: &str) -> Result<u64, CoreError>;
}

/// A connection to one tenant's logical database.
#[async_trait]
pub trait TenantDatabase:
    UserRepository
    + ClassRepository
    + RequestRepository
    + AttendanceRepository
    + PaymentRepository
    + NotificationRepository
{
    fn name(&self) -> &str;
    async fn close(&self);
}

/// Opens logical databases by name. Used by the connection registry.
#[async_trait]
pub trait DatabaseConnector: Send + Sync {
    async fn connect(&self, database_name: &str) -> Result<Arc<dyn TenantDatabase>, CoreError>;
}

// Port for publishing events to a message bus
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        event_type: &str,
        event_payload: &[u8],
    ) -> Result<(), CoreError>;
}

// Port for caching data
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CoreError>;
    async fn set(&self, key: &str, value: &[u8], ttl_seconds: Option<u64>)
    -> Result<(), CoreError>;
    async fn delete(&self, key: &str) -> Result<(), CoreError>;
}
