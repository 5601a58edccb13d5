use crate::domain::attendance::{Attendance, AttendanceFilter};
use crate::domain::class::Class;
use crate::domain::notification::Notification;
use crate::domain::payment::{Payment, PaymentStatus};
use crate::domain::request::{ClassRequest, RequestFilter, RequestStatus};
use crate::domain::user::{User, UserFilter};
use crate::{
    AttendanceRepository, ClassRepository, CoreError, DatabaseConnector, NotificationRepository,
    PaymentRepository, RequestRepository, TenantDatabase, UserRepository,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

/// One tenant's logical database held in process memory.
/// Suitable for tests and single-process mode.
#[derive(Debug, Default)]
pub struct InMemoryDatabase {
    name: String,
    users: DashMap<String, User>,
    // Lowercased email -> user id.
    emails: DashMap<String, String>,
    classes: DashMap<String, Class>,
    // Uniqueness checks span several documents, so these sit behind one lock.
    requests: RwLock<HashMap<String, ClassRequest>>,
    attendance: RwLock<HashMap<String, Attendance>>,
    payments: DashMap<String, Payment>,
    notifications: DashMap<String, Notification>,
}

impl InMemoryDatabase {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl UserRepository for InMemoryDatabase {
    async fn insert_user(&self, user: User) -> Result<User, CoreError> {
        match self.emails.entry(user.email.clone()) {
            Entry::Occupied(_) => Err(CoreError::Conflict(format!(
                "User already exists: {}",
                user.email
            ))),
            Entry::Vacant(slot) => {
                slot.insert(user.id.clone());
                self.users.insert(user.id.clone(), user.clone());
                Ok(user)
            }
        }
    }

    async fn get_user(&self, user_id: &str) -> Result<Option<User>, CoreError> {
        Ok(self.users.get(user_id).map(|u| u.value().clone()))
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, CoreError> {
        let email = email.trim().to_lowercase();
        let Some(user_id) = self.emails.get(&email).map(|id| id.value().clone()) else {
            return Ok(None);
        };
        self.get_user(&user_id).await
    }

    async fn list_users(&self, filter: &UserFilter) -> Result<Vec<User>, CoreError> {
        let mut users: Vec<User> = self
            .users
            .iter()
            .filter(|u| filter.matches(u.value()))
            .map(|u| u.value().clone())
            .collect();
        users.sort_by_key(|u| u.created_at);
        Ok(users)
    }

    async fn update_user(&self, user: &User) -> Result<(), CoreError> {
        match self.users.get_mut(&user.id) {
            Some(mut stored) => {
                *stored = user.clone();
                Ok(())
            }
            None => Err(CoreError::NotFound(format!("User not found: {}", user.id))),
        }
    }

    async fn delete_user(&self, user_id: &str) -> Result<bool, CoreError> {
        match self.users.remove(user_id) {
            Some((_, user)) => {
                self.emails.remove(&user.email);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl ClassRepository for InMemoryDatabase {
    async fn insert_class(&self, class: Class) -> Result<Class, CoreError> {
        self.classes.insert(class.id.clone(), class.clone());
        Ok(class)
    }

    async fn get_class(&self, class_id: &str) -> Result<Option<Class>, CoreError> {
        Ok(self.classes.get(class_id).map(|c| c.value().clone()))
    }

    async fn list_classes(&self, active_only: bool) -> Result<Vec<Class>, CoreError> {
        let mut classes: Vec<Class> = self
            .classes
            .iter()
            .filter(|c| !active_only || c.is_active)
            .map(|c| c.value().clone())
            .collect();
        classes.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(classes)
    }

    async fn update_class(&self, class: &Class) -> Result<(), CoreError> {
        match self.classes.get_mut(&class.id) {
            Some(mut stored) => {
                // Enrollment is only changed through the set operations below.
                let enrolled = std::mem::take(&mut stored.enrolled);
                *stored = class.clone();
                stored.enrolled = enrolled;
                Ok(())
            }
            None => Err(CoreError::NotFound(format!("Class not found: {}", class.id))),
        }
    }

    async fn add_enrolled(&self, class_id: &str, user_id: &str) -> Result<bool, CoreError> {
        let mut class = self
            .classes
            .get_mut(class_id)
            .ok_or_else(|| CoreError::NotFound(format!("Class not found: {class_id}")))?;
        if class.is_enrolled(user_id) {
            return Ok(false);
        }
        class.enrolled.push(user_id.to_string());
        Ok(true)
    }

    async fn remove_enrolled_everywhere(&self, user_id: &str) -> Result<u64, CoreError> {
        let mut touched = 0;
        for mut class in self.classes.iter_mut() {
            let before = class.enrolled.len();
            class.enrolled.retain(|u| u != user_id);
            if class.enrolled.len() != before {
                touched += 1;
            }
        }
        Ok(touched)
    }
}

#[async_trait]
impl RequestRepository for InMemoryDatabase {
    async fn insert_pending(&self, request: ClassRequest) -> Result<ClassRequest, CoreError> {
        let mut requests = self.requests.write().await;
        let duplicate = requests.values().any(|r| {
            r.status == RequestStatus::Pending
                && r.user_id == request.user_id
                && r.class_id == request.class_id
        });
        if duplicate {
            return Err(CoreError::Conflict(
                "A pending request for this class already exists".into(),
            ));
        }
        requests.insert(request.id.clone(), request.clone());
        Ok(request)
    }

    async fn get_request(&self, request_id: &str) -> Result<Option<ClassRequest>, CoreError> {
        Ok(self.requests.read().await.get(request_id).cloned())
    }

    async fn list_requests(&self, filter: &RequestFilter) -> Result<Vec<ClassRequest>, CoreError> {
        let mut requests: Vec<ClassRequest> = self
            .requests
            .read()
            .await
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        requests.sort_by(|a, b| b.request_date.cmp(&a.request_date));
        Ok(requests)
    }

    async fn transition_request(
        &self,
        request_id: &str,
        from: RequestStatus,
        to: RequestStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<ClassRequest>, CoreError> {
        let mut requests = self.requests.write().await;
        match requests.get_mut(request_id) {
            Some(request) if request.status == from => {
                request.status = to;
                request.response_date = Some(at);
                Ok(Some(request.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn link_payment(&self, request_id: &str, payment_id: &str) -> Result<(), CoreError> {
        let mut requests = self.requests.write().await;
        let request = requests
            .get_mut(request_id)
            .ok_or_else(|| CoreError::NotFound(format!("Request not found: {request_id}")))?;
        request.payment_id = Some(payment_id.to_string());
        Ok(())
    }

    async fn delete_requests_for_user(&self, user_id: &str) -> Result<u64, CoreError> {
        let mut requests = self.requests.write().await;
        let before = requests.len();
        requests.retain(|_, r| r.user_id != user_id);
        Ok((before - requests.len()) as u64)
    }
}

#[async_trait]
impl AttendanceRepository for InMemoryDatabase {
    async fn upsert_attendance(&self, record: Attendance) -> Result<Attendance, CoreError> {
        let mut attendance = self.attendance.write().await;
        let existing = attendance.values_mut().find(|a| {
            a.user_id == record.user_id && a.class_id == record.class_id && a.day == record.day
        });
        match existing {
            Some(stored) => {
                stored.status = record.status;
                stored.marked_by = record.marked_by;
                stored.date = record.date;
                stored.updated_at = record.updated_at;
                Ok(stored.clone())
            }
            None => {
                attendance.insert(record.id.clone(), record.clone());
                Ok(record)
            }
        }
    }

    async fn list_attendance(
        &self,
        filter: &AttendanceFilter,
    ) -> Result<Vec<Attendance>, CoreError> {
        let mut records: Vec<Attendance> = self
            .attendance
            .read()
            .await
            .values()
            .filter(|a| filter.matches(a))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.day.cmp(&a.day).then(b.date.cmp(&a.date)));
        Ok(records)
    }

    async fn delete_attendance_for_user(&self, user_id: &str) -> Result<u64, CoreError> {
        let mut attendance = self.attendance.write().await;
        let before = attendance.len();
        attendance.retain(|_, a| a.user_id != user_id);
        Ok((before - attendance.len()) as u64)
    }
}

#[async_trait]
impl PaymentRepository for InMemoryDatabase {
    async fn insert_payment(&self, payment: Payment) -> Result<Payment, CoreError> {
        self.payments.insert(payment.id.clone(), payment.clone());
        Ok(payment)
    }

    async fn get_payment(&self, payment_id: &str) -> Result<Option<Payment>, CoreError> {
        Ok(self.payments.get(payment_id).map(|p| p.value().clone()))
    }

    async fn list_payments_for_user(&self, user_id: &str) -> Result<Vec<Payment>, CoreError> {
        let mut payments: Vec<Payment> = self
            .payments
            .iter()
            .filter(|p| p.user_id == user_id)
            .map(|p| p.value().clone())
            .collect();
        payments.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(payments)
    }

    async fn refund_payment(&self, payment_id: &str) -> Result<bool, CoreError> {
        match self.payments.get_mut(payment_id) {
            Some(mut payment) if payment.status != PaymentStatus::Refunded => {
                payment.status = PaymentStatus::Refunded;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn refund_payments_for_user(&self, user_id: &str) -> Result<u64, CoreError> {
        let mut refunded = 0;
        for mut payment in self.payments.iter_mut() {
            if payment.user_id == user_id && payment.status != PaymentStatus::Refunded {
                payment.status = PaymentStatus::Refunded;
                refunded += 1;
            }
        }
        Ok(refunded)
    }
}

#[async_trait]
impl NotificationRepository for InMemoryDatabase {
    async fn insert_notifications(&self, notifications: &[Notification]) -> Result<(), CoreError> {
        for notification in notifications {
            self.notifications
                .insert(notification.id.clone(), notification.clone());
        }
        Ok(())
    }

    async fn list_notifications(&self, recipient: &str) -> Result<Vec<Notification>, CoreError> {
        let mut notifications: Vec<Notification> = self
            .notifications
            .iter()
            .filter(|n| n.recipient == recipient)
            .map(|n| n.value().clone())
            .collect();
        notifications.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(notifications)
    }

    async fn mark_notification_read(
        &self,
        notification_id: &str,
        recipient: &str,
    ) -> Result<Option<Notification>, CoreError> {
        match self.notifications.get_mut(notification_id) {
            Some(mut n) if n.recipient == recipient => {
                n.is_read = true;
                Ok(Some(n.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn delete_notifications_for_user(&self, user_id: &str) -> Result<u64, CoreError> {
        let before = self.notifications.len();
        self.notifications
            .retain(|_, n| n.recipient != user_id && n.sender != user_id);
        Ok((before - self.notifications.len()) as u64)
    }
}

#[async_trait]
impl TenantDatabase for InMemoryDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    async fn close(&self) {
        debug!(database = %self.name, "In-memory database released");
    }
}

/// Hands out in-memory databases by name. Data survives close/reconnect for
/// the lifetime of the connector.
#[derive(Debug, Default)]
pub struct InMemoryConnector {
    databases: DashMap<String, Arc<InMemoryDatabase>>,
    connects: AtomicUsize,
}

impl InMemoryConnector {
    /// Number of times `connect` has been called.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DatabaseConnector for InMemoryConnector {
    async fn connect(&self, database_name: &str) -> Result<Arc<dyn TenantDatabase>, CoreError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        // A real connect suspends; give racing callers the chance to interleave.
        tokio::task::yield_now().await;
        let db = self
            .databases
            .entry(database_name.to_string())
            .or_insert_with(|| Arc::new(InMemoryDatabase::new(database_name)))
            .value()
            .clone();
        Ok(db)
    }
}
