//! Notification fan-out.
//!
//! Every workflow transition that affects another principal inserts one
//! notification per recipient into the tenant database. Delivery is best
//! effort: by the time we notify, the primary mutation is already committed,
//! so a failed insert is logged and swallowed instead of failing the request.
//! Persisted notifications are also pushed on the event bus under
//! `notifications.<recipient>` for live clients.

use crate::{CoreError, EventPublisher, NotificationRepository};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Sender of notifications raised by the service itself rather than by a
/// principal, such as expiries in the `main` tenant which has no owning admin.
pub const SYSTEM_SENDER: &str = "system";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    ClassRequest,
    ClassAccepted,
    ClassRejected,
    ClassCreated,
    ClassUpdated,
    ClassDeleted,
    MeetingLink,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::ClassRequest => "class_request",
            NotificationKind::ClassAccepted => "class_accepted",
            NotificationKind::ClassRejected => "class_rejected",
            NotificationKind::ClassCreated => "class_created",
            NotificationKind::ClassUpdated => "class_updated",
            NotificationKind::ClassDeleted => "class_deleted",
            NotificationKind::MeetingLink => "meeting_link",
        }
    }
}

impl FromStr for NotificationKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "class_request" => Ok(NotificationKind::ClassRequest),
            "class_accepted" => Ok(NotificationKind::ClassAccepted),
            "class_rejected" => Ok(NotificationKind::ClassRejected),
            "class_created" => Ok(NotificationKind::ClassCreated),
            "class_updated" => Ok(NotificationKind::ClassUpdated),
            "class_deleted" => Ok(NotificationKind::ClassDeleted),
            "meeting_link" => Ok(NotificationKind::MeetingLink),
            other => Err(CoreError::Validation(format!(
                "unknown notification type '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub recipient: String,
    pub sender: String,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub message: String,
    pub related_class: Option<String>,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

/// One event to broadcast.
#[derive(Debug, Clone)]
pub struct Announcement<'a> {
    pub sender: &'a str,
    pub kind: NotificationKind,
    pub message: String,
    pub related_class: Option<&'a str>,
}

#[derive(Clone)]
pub struct Notifier {
    publisher: Arc<dyn EventPublisher>,
}

impl Notifier {
    pub fn new(publisher: Arc<dyn EventPublisher>) -> Self {
        Self { publisher }
    }

    /// Inserts one notification per recipient and returns how many were stored.
    /// Never fails: storage errors are logged and reported as zero deliveries.
    pub async fn notify<S>(
        &self,
        store: &S,
        recipients: &[String],
        announcement: Announcement<'_>,
        now: DateTime<Utc>,
    ) -> usize
    where
        S: NotificationRepository + ?Sized,
    {
        if recipients.is_empty() {
            return 0;
        }

        let notifications: Vec<Notification> = recipients
            .iter()
            .map(|recipient| Notification {
                id: Uuid::new_v4().to_string(),
                recipient: recipient.clone(),
                sender: announcement.sender.to_string(),
                kind: announcement.kind,
                message: announcement.message.clone(),
                related_class: announcement.related_class.map(str::to_string),
                is_read: false,
                created_at: now,
            })
            .collect();

        if let Err(e) = store.insert_notifications(&notifications).await {
            warn!(
                kind = announcement.kind.as_str(),
                recipients = recipients.len(),
                "Notification fan-out failed: {}",
                e
            );
            return 0;
        }

        for notification in &notifications {
            let topic = format!("notifications.{}", notification.recipient);
            let payload = match serde_json::to_vec(notification) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Failed to encode notification {}: {}", notification.id, e);
                    continue;
                }
            };
            if let Err(e) = self
                .publisher
                .publish(&topic, notification.kind.as_str(), &payload)
                .await
            {
                debug!(topic = %topic, "Live notification push failed: {}", e);
            }
        }

        notifications.len()
    }
}

pub async fn list_for_recipient<S>(store: &S, recipient: &str) -> Result<Vec<Notification>, CoreError>
where
    S: NotificationRepository + ?Sized,
{
    store.list_notifications(recipient).await
}

/// Only the recipient can mark a notification read. Someone else's
/// notification is reported as missing.
pub async fn mark_read<S>(
    store: &S,
    recipient: &str,
    notification_id: &str,
) -> Result<Notification, CoreError>
where
    S: NotificationRepository + ?Sized,
{
    store
        .mark_notification_read(notification_id, recipient)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("Notification not found: {notification_id}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::in_memory_database::InMemoryDatabase;
    use crate::adapters::in_memory_event_bus::InMemoryEventBus;
    use async_trait::async_trait;
    use tokio::time::{Duration, timeout};

    struct BrokenStore;

    #[async_trait]
    impl NotificationRepository for BrokenStore {
        async fn insert_notifications(&self, _: &[Notification]) -> Result<(), CoreError> {
            Err(CoreError::Internal("disk full".into()))
        }
        async fn list_notifications(&self, _: &str) -> Result<Vec<Notification>, CoreError> {
            Ok(Vec::new())
        }
        async fn mark_notification_read(
            &self,
            _: &str,
            _: &str,
        ) -> Result<Option<Notification>, CoreError> {
            Ok(None)
        }
        async fn delete_notifications_for_user(&self, _: &str) -> Result<u64, CoreError> {
            Ok(0)
        }
    }

    fn announcement(kind: NotificationKind) -> Announcement<'static> {
        Announcement {
            sender: "adm-1",
            kind,
            message: "hello".into(),
            related_class: Some("cls-1"),
        }
    }

    #[tokio::test]
    async fn test_fan_out_creates_one_notification_per_recipient() {
        let store = InMemoryDatabase::new("studio-adm-1");
        let notifier = Notifier::new(Arc::new(InMemoryEventBus::default()));
        let recipients = vec!["u1".to_string(), "u2".to_string(), "u3".to_string()];

        let delivered = notifier
            .notify(&store, &recipients, announcement(NotificationKind::ClassCreated), Utc::now())
            .await;

        assert_eq!(delivered, 3);
        for r in &recipients {
            let inbox = list_for_recipient(&store, r).await.unwrap();
            assert_eq!(inbox.len(), 1);
            assert_eq!(inbox[0].kind, NotificationKind::ClassCreated);
            assert_eq!(inbox[0].related_class.as_deref(), Some("cls-1"));
            assert!(!inbox[0].is_read);
        }
    }

    #[tokio::test]
    async fn test_storage_failure_is_not_fatal() {
        let notifier = Notifier::new(Arc::new(InMemoryEventBus::default()));
        let delivered = notifier
            .notify(
                &BrokenStore,
                &["u1".to_string()],
                announcement(NotificationKind::ClassAccepted),
                Utc::now(),
            )
            .await;
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn test_fan_out_pushes_on_recipient_topic() {
        let store = InMemoryDatabase::new("studio-adm-1");
        let bus = InMemoryEventBus::default();
        let mut receiver = bus.subscribe("notifications.u1");
        let notifier = Notifier::new(Arc::new(bus));

        notifier
            .notify(
                &store,
                &["u1".to_string()],
                announcement(NotificationKind::MeetingLink),
                Utc::now(),
            )
            .await;

        let message = timeout(Duration::from_millis(100), receiver.recv())
            .await
            .expect("push timed out")
            .unwrap();
        assert_eq!(message.event_type, "meeting_link");
        let pushed: Notification = serde_json::from_slice(&message.payload).unwrap();
        assert_eq!(pushed.recipient, "u1");
    }

    #[tokio::test]
    async fn test_only_recipient_can_mark_read() {
        let store = InMemoryDatabase::new("studio-adm-1");
        let notifier = Notifier::new(Arc::new(InMemoryEventBus::default()));
        notifier
            .notify(
                &store,
                &["u1".to_string()],
                announcement(NotificationKind::ClassUpdated),
                Utc::now(),
            )
            .await;
        let id = list_for_recipient(&store, "u1").await.unwrap()[0].id.clone();

        let stranger = mark_read(&store, "u2", &id).await;
        assert!(matches!(stranger, Err(CoreError::NotFound(_))));

        let read = mark_read(&store, "u1", &id).await.unwrap();
        assert!(read.is_read);
        assert!(list_for_recipient(&store, "u1").await.unwrap()[0].is_read);
    }
}
