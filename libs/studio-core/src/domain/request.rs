//! Enrollment requests.
//!
//! ```text
//!            accept
//!   pending ───────▶ accepted
//!      │
//!      │ reject / expiry sweep
//!      ▼
//!   rejected
//! ```
//!
//! Every transition is a compare-and-set on `status`, so of N concurrent
//! decisions on the same request exactly one wins and the rest see `Conflict`.

use crate::domain::class::{Class, PackageType};
use crate::domain::notification::{Announcement, NotificationKind, Notifier, SYSTEM_SENDER};
use crate::domain::user::{AccountStatus, Role, User, UserFilter};
use crate::tenancy::{ConnectionRegistry, TenantScope};
use crate::{Command, CommandHandler, CoreError};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::{info, warn};
use uuid::Uuid;

pub const DEFAULT_AUTO_REJECT_DAYS: i64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Accepted,
    Rejected,
    /// Never produced by a transition. Kept so stored documents always parse.
    Inactive,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Accepted => "accepted",
            RequestStatus::Rejected => "rejected",
            RequestStatus::Inactive => "inactive",
        }
    }
}

impl FromStr for RequestStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RequestStatus::Pending),
            "accepted" => Ok(RequestStatus::Accepted),
            "rejected" => Ok(RequestStatus::Rejected),
            "inactive" => Ok(RequestStatus::Inactive),
            other => Err(CoreError::Validation(format!(
                "unknown request status '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassRequest {
    pub id: String,
    pub user_id: String,
    pub class_id: String,
    pub package_type: PackageType,
    pub status: RequestStatus,
    pub request_date: DateTime<Utc>,
    pub response_date: Option<DateTime<Utc>>,
    pub auto_reject_date: DateTime<Utc>,
    pub payment_id: Option<String>,
}

impl ClassRequest {
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status == RequestStatus::Pending && self.auto_reject_date <= now
    }
}

#[derive(Debug, Clone, Default)]
pub struct RequestFilter {
    pub status: Option<RequestStatus>,
    pub user_id: Option<String>,
    pub class_id: Option<String>,
}

impl RequestFilter {
    pub fn matches(&self, request: &ClassRequest) -> bool {
        self.status.is_none_or(|s| s == request.status)
            && self.user_id.as_deref().is_none_or(|u| u == request.user_id)
            && self.class_id.as_deref().is_none_or(|c| c == request.class_id)
    }
}

/// A request as listed to clients, with the advisory expiry flag.
#[derive(Debug, Clone, Serialize)]
pub struct RequestView {
    #[serde(flatten)]
    pub request: ClassRequest,
    pub expired: bool,
}

impl RequestView {
    fn at(request: ClassRequest, now: DateTime<Utc>) -> Self {
        let expired = request.is_overdue(now);
        Self { request, expired }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Accept,
    Reject,
}

// --- Commands ---

#[derive(Debug, Clone)]
pub struct RequestClass {
    pub actor: User,
    pub class_id: String,
    pub package: PackageType,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct DecideRequest {
    pub actor: User,
    pub request_id: String,
    pub decision: Decision,
    pub now: DateTime<Utc>,
}

/// Rejects every pending request whose auto-reject date has passed.
#[derive(Debug, Clone)]
pub struct ExpireOverdue {
    pub now: DateTime<Utc>,
}

impl Command for RequestClass {}
impl Command for DecideRequest {}
impl Command for ExpireOverdue {}

pub struct EnrollmentWorkflow {
    scope: TenantScope,
    notifier: Notifier,
    auto_reject_after: Duration,
}

impl EnrollmentWorkflow {
    pub fn new(scope: TenantScope, notifier: Notifier, auto_reject_after: Duration) -> Self {
        Self {
            scope,
            notifier,
            auto_reject_after,
        }
    }

    pub async fn list_pending(&self, now: DateTime<Utc>) -> Result<Vec<RequestView>, CoreError> {
        let filter = RequestFilter {
            status: Some(RequestStatus::Pending),
            ..Default::default()
        };
        self.list(&filter, now).await
    }

    pub async fn list_for_user(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<RequestView>, CoreError> {
        let filter = RequestFilter {
            user_id: Some(user_id.to_string()),
            ..Default::default()
        };
        self.list(&filter, now).await
    }

    async fn list(
        &self,
        filter: &RequestFilter,
        now: DateTime<Utc>,
    ) -> Result<Vec<RequestView>, CoreError> {
        let requests = self.scope.db.list_requests(filter).await?;
        Ok(requests
            .into_iter()
            .map(|r| RequestView::at(r, now))
            .collect())
    }

    /// Admin principals of this tenant: the owning admin plus any admin that
    /// selected it.
    async fn tenant_admins(&self) -> Result<Vec<String>, CoreError> {
        let tenant = self.scope.tenant.as_str();
        let filter = UserFilter {
            role: Some(Role::Admin),
            admin_id: None,
        };
        Ok(self
            .scope
            .directory
            .list_users(&filter)
            .await?
            .into_iter()
            .filter(|a| a.id == tenant || a.admin_id.as_deref() == Some(tenant))
            .map(|a| a.id)
            .collect())
    }

    async fn class_name(&self, class_id: &str) -> String {
        match self.scope.db.get_class(class_id).await {
            Ok(Some(class)) => class.name,
            _ => class_id.to_string(),
        }
    }

    async fn accept(&self, request: &ClassRequest, sender: &str, now: DateTime<Utc>) -> Result<(), CoreError> {
        self.enroll(request).await?;

        let class_name = self.class_name(&request.class_id).await;
        self.notifier
            .notify(
                self.scope.db.as_ref(),
                std::slice::from_ref(&request.user_id),
                Announcement {
                    sender,
                    kind: NotificationKind::ClassAccepted,
                    message: format!("Your request to join '{class_name}' was accepted"),
                    related_class: Some(&request.class_id),
                },
                now,
            )
            .await;
        Ok(())
    }

    // Enrollment first: it is the invariant that matters most.
    async fn enroll(&self, request: &ClassRequest) -> Result<(), CoreError> {
        let added = self
            .scope
            .db
            .add_enrolled(&request.class_id, &request.user_id)
            .await?;
        if !added {
            info!(request_id = %request.id, "User was already enrolled");
        }
        self.activate_account(&request.user_id).await
    }

    async fn activate_account(&self, user_id: &str) -> Result<(), CoreError> {
        let Some(mut user) = self.scope.directory.get_user(user_id).await? else {
            warn!(user_id = %user_id, "Accepted request for a user missing from the directory");
            return Ok(());
        };
        if user.status == AccountStatus::Inactive {
            user.status = AccountStatus::Active;
            self.scope.directory.update_user(&user).await?;
            info!(user_id = %user_id, "Account activated by first accepted enrollment");
        }
        Ok(())
    }

    async fn reject(
        &self,
        request: &ClassRequest,
        sender: &str,
        message: String,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        self.refund(request).await?;
        self.notifier
            .notify(
                self.scope.db.as_ref(),
                std::slice::from_ref(&request.user_id),
                Announcement {
                    sender,
                    kind: NotificationKind::ClassRejected,
                    message,
                    related_class: Some(&request.class_id),
                },
                now,
            )
            .await;
        Ok(())
    }

    async fn refund(&self, request: &ClassRequest) -> Result<(), CoreError> {
        if let Some(payment_id) = request.payment_id.as_deref() {
            if self.scope.db.refund_payment(payment_id).await? {
                info!(request_id = %request.id, payment_id = %payment_id, "Payment refunded");
            }
        }
        Ok(())
    }

    /// Called after losing the compare-and-set. An earlier decision with the
    /// same outcome may have committed and then failed on a side effect, so
    /// those are applied again. Nobody is notified twice.
    async fn reapply_decision(&self, request_id: &str, target: RequestStatus) -> Result<(), CoreError> {
        let Some(stored) = self.scope.db.get_request(request_id).await? else {
            return Ok(());
        };
        match (stored.status, target) {
            (RequestStatus::Accepted, RequestStatus::Accepted) => self.enroll(&stored).await,
            (RequestStatus::Rejected, RequestStatus::Rejected) => self.refund(&stored).await,
            _ => Ok(()),
        }
    }
}

impl CommandHandler<RequestClass> for EnrollmentWorkflow {
    type Output = ClassRequest;

    async fn handle(&self, command: RequestClass) -> Result<ClassRequest, CoreError> {
        if command.actor.role != Role::User {
            return Err(CoreError::Forbidden(
                "only users can request to join a class".into(),
            ));
        }
        let class: Class = self
            .scope
            .db
            .get_class(&command.class_id)
            .await?
            .filter(|c| c.is_active)
            .ok_or_else(|| CoreError::NotFound(format!("Class not found: {}", command.class_id)))?;
        if class.price_of(command.package).is_none() {
            return Err(CoreError::Validation(format!(
                "class does not offer the {} package",
                command.package.as_str()
            )));
        }

        let request = ClassRequest {
            id: Uuid::new_v4().to_string(),
            user_id: command.actor.id.clone(),
            class_id: class.id.clone(),
            package_type: command.package,
            status: RequestStatus::Pending,
            request_date: command.now,
            response_date: None,
            auto_reject_date: command.now + self.auto_reject_after,
            payment_id: None,
        };
        let request = self.scope.db.insert_pending(request).await?;
        info!(
            tenant = %self.scope.tenant,
            request_id = %request.id,
            class_id = %class.id,
            "Enrollment requested"
        );

        let admins = self.tenant_admins().await?;
        self.notifier
            .notify(
                self.scope.db.as_ref(),
                &admins,
                Announcement {
                    sender: &command.actor.id,
                    kind: NotificationKind::ClassRequest,
                    message: format!(
                        "{} requested to join '{}' ({})",
                        command.actor.name,
                        class.name,
                        command.package.as_str()
                    ),
                    related_class: Some(&class.id),
                },
                command.now,
            )
            .await;
        Ok(request)
    }
}

impl CommandHandler<DecideRequest> for EnrollmentWorkflow {
    type Output = ClassRequest;

    async fn handle(&self, command: DecideRequest) -> Result<ClassRequest, CoreError> {
        if !command.actor.is_admin() {
            return Err(CoreError::Forbidden("admin role required".into()));
        }
        // Requests live in the tenant database, so a foreign tenant's id is simply not found.
        let current = self
            .scope
            .db
            .get_request(&command.request_id)
            .await?
            .ok_or_else(|| {
                CoreError::NotFound(format!("Request not found: {}", command.request_id))
            })?;
        let target = match command.decision {
            Decision::Accept => RequestStatus::Accepted,
            Decision::Reject => RequestStatus::Rejected,
        };
        let Some(updated) = self
            .scope
            .db
            .transition_request(&current.id, RequestStatus::Pending, target, command.now)
            .await?
        else {
            self.reapply_decision(&current.id, target).await?;
            return Err(CoreError::Conflict(format!(
                "Request {} is no longer pending",
                command.request_id
            )));
        };
        info!(
            tenant = %self.scope.tenant,
            request_id = %updated.id,
            status = updated.status.as_str(),
            "Enrollment decided"
        );

        match command.decision {
            Decision::Accept => self.accept(&updated, &command.actor.id, command.now).await?,
            Decision::Reject => {
                let class_name = self.class_name(&updated.class_id).await;
                let message = format!("Your request to join '{class_name}' was rejected");
                self.reject(&updated, &command.actor.id, message, command.now)
                    .await?
            }
        }
        Ok(updated)
    }
}

impl CommandHandler<ExpireOverdue> for EnrollmentWorkflow {
    type Output = Vec<ClassRequest>;

    async fn handle(&self, command: ExpireOverdue) -> Result<Vec<ClassRequest>, CoreError> {
        let filter = RequestFilter {
            status: Some(RequestStatus::Pending),
            ..Default::default()
        };
        let overdue: Vec<ClassRequest> = self
            .scope
            .db
            .list_requests(&filter)
            .await?
            .into_iter()
            .filter(|r| r.is_overdue(command.now))
            .collect();

        // Expiries speak for the owning admin. `main` has none.
        let sender = if self.scope.tenant.is_main() {
            SYSTEM_SENDER
        } else {
            self.scope.tenant.as_str()
        };
        let mut expired = Vec::with_capacity(overdue.len());
        for request in overdue {
            // Lost the race to an admin decision.
            let Some(updated) = self
                .scope
                .db
                .transition_request(
                    &request.id,
                    RequestStatus::Pending,
                    RequestStatus::Rejected,
                    command.now,
                )
                .await?
            else {
                continue;
            };
            let class_name = self.class_name(&updated.class_id).await;
            let message = format!(
                "Your request to join '{class_name}' expired without a response"
            );
            self.reject(&updated, sender, message, command.now).await?;
            expired.push(updated);
        }

        if !expired.is_empty() {
            info!(tenant = %self.scope.tenant, count = expired.len(), "Expired overdue requests");
        }
        Ok(expired)
    }
}

/// Runs the expiry sweep in every admin tenant plus `main`. A failing tenant
/// is logged and skipped. Returns the number of requests expired.
pub async fn sweep_tenants(
    registry: &ConnectionRegistry,
    notifier: &Notifier,
    now: DateTime<Utc>,
) -> Result<usize, CoreError> {
    let tenants = registry.known_tenants().await?;

    let mut total = 0;
    for tenant in tenants {
        let scope = match registry.scope(tenant.clone()).await {
            Ok(scope) => scope,
            Err(e) => {
                warn!(tenant = %tenant, "Expiry sweep could not open tenant: {}", e);
                continue;
            }
        };
        // Expiry reads each request's stored deadline, so no window is needed.
        let workflow = EnrollmentWorkflow::new(scope, notifier.clone(), Duration::zero());
        match workflow.handle(ExpireOverdue { now }).await {
            Ok(expired) => total += expired.len(),
            Err(e) => warn!(tenant = %tenant, "Expiry sweep failed: {}", e),
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::test_support::Fixture;
    use crate::domain::payment::{PaymentStatus, ProcessPayment, PaymentIssuer, ReceiptIssuer};
    use std::sync::Arc;
    use std::sync::atomic::Ordering;

    fn workflow(fx: &Fixture) -> Arc<EnrollmentWorkflow> {
        Arc::new(EnrollmentWorkflow::new(
            fx.scope.clone(),
            fx.notifier(),
            Duration::days(DEFAULT_AUTO_REJECT_DAYS),
        ))
    }

    fn request(actor: &User, class: &Class, now: DateTime<Utc>) -> RequestClass {
        RequestClass {
            actor: actor.clone(),
            class_id: class.id.clone(),
            package: PackageType::ThreeMonth,
            now,
        }
    }

    fn decide(fx: &Fixture, request_id: &str, decision: Decision) -> DecideRequest {
        DecideRequest {
            actor: fx.admin.clone(),
            request_id: request_id.to_string(),
            decision,
            now: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_request_creates_pending_and_notifies_admins() {
        let fx = Fixture::new().await;
        let class = fx.class("Salsa").await;
        let user = fx.user("u1").await;
        let t0 = Utc::now();

        let created = workflow(&fx).handle(request(&user, &class, t0)).await.unwrap();

        assert_eq!(created.status, RequestStatus::Pending);
        assert_eq!(created.auto_reject_date, t0 + Duration::days(3));
        assert!(created.response_date.is_none());

        let inbox = fx.scope.db.list_notifications(&fx.admin.id).await.unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].kind, NotificationKind::ClassRequest);
        assert_eq!(inbox[0].sender, user.id);
    }

    #[tokio::test]
    async fn test_duplicate_pending_request_conflicts() {
        let fx = Fixture::new().await;
        let class = fx.class("Salsa").await;
        let user = fx.user("u1").await;
        let wf = workflow(&fx);

        wf.handle(request(&user, &class, Utc::now())).await.unwrap();
        let second = wf.handle(request(&user, &class, Utc::now())).await;
        assert!(matches!(second, Err(CoreError::Conflict(_))));

        let pending = wf.list_pending(Utc::now()).await.unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn test_request_requires_offered_package_and_active_class() {
        let fx = Fixture::new().await;
        let mut class = fx.class("Salsa").await;
        let user = fx.user("u1").await;
        let wf = workflow(&fx);

        class.packages.retain(|p| p.package_type == PackageType::ThreeMonth);
        fx.scope.db.update_class(&class).await.unwrap();
        let mut yearly = request(&user, &class, Utc::now());
        yearly.package = PackageType::OneYear;
        assert!(matches!(wf.handle(yearly).await, Err(CoreError::Validation(_))));

        class.is_active = false;
        fx.scope.db.update_class(&class).await.unwrap();
        let result = wf.handle(request(&user, &class, Utc::now())).await;
        assert!(matches!(result, Err(CoreError::NotFound(_))));

        let admin_attempt = wf.handle(request(&fx.admin, &class, Utc::now())).await;
        assert!(matches!(admin_attempt, Err(CoreError::Forbidden(_))));
    }

    #[tokio::test]
    async fn test_accept_enrolls_activates_and_notifies() {
        let fx = Fixture::new().await;
        let class = fx.class("Salsa").await;
        let user = fx.user("u1").await;
        let wf = workflow(&fx);
        let created = wf.handle(request(&user, &class, Utc::now())).await.unwrap();

        let accepted = wf
            .handle(decide(&fx, &created.id, Decision::Accept))
            .await
            .unwrap();

        assert_eq!(accepted.status, RequestStatus::Accepted);
        assert!(accepted.response_date.is_some());
        let class = fx.scope.db.get_class(&class.id).await.unwrap().unwrap();
        assert_eq!(class.enrolled, vec![user.id.clone()]);
        let user_now = fx.scope.directory.get_user(&user.id).await.unwrap().unwrap();
        assert_eq!(user_now.status, AccountStatus::Active);

        let inbox = fx.scope.db.list_notifications(&user.id).await.unwrap();
        assert!(inbox.iter().any(|n| n.kind == NotificationKind::ClassAccepted));
    }

    #[tokio::test]
    async fn test_second_decision_conflicts_and_enrollment_is_not_duplicated() {
        let fx = Fixture::new().await;
        let class = fx.class("Salsa").await;
        let user = fx.user("u1").await;
        let wf = workflow(&fx);
        let first = wf.handle(request(&user, &class, Utc::now())).await.unwrap();
        wf.handle(decide(&fx, &first.id, Decision::Accept)).await.unwrap();

        let again = wf.handle(decide(&fx, &first.id, Decision::Accept)).await;
        assert!(matches!(again, Err(CoreError::Conflict(_))));

        // A fresh request for the same class can be accepted without duplicating membership.
        let second = wf.handle(request(&user, &class, Utc::now())).await.unwrap();
        wf.handle(decide(&fx, &second.id, Decision::Accept)).await.unwrap();
        let class = fx.scope.db.get_class(&class.id).await.unwrap().unwrap();
        assert_eq!(class.enrolled.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_accepts_have_one_winner() {
        let fx = Fixture::new().await;
        let class = fx.class("Salsa").await;
        let user = fx.user("u1").await;
        let wf = workflow(&fx);
        let created = wf.handle(request(&user, &class, Utc::now())).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let wf = wf.clone();
            let command = decide(&fx, &created.id, Decision::Accept);
            handles.push(tokio::spawn(async move { wf.handle(command).await }));
        }
        let mut wins = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => wins += 1,
                Err(CoreError::Conflict(_)) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(wins, 1);

        let accepted: Vec<_> = fx
            .scope
            .db
            .list_notifications(&user.id)
            .await
            .unwrap()
            .into_iter()
            .filter(|n| n.kind == NotificationKind::ClassAccepted)
            .collect();
        assert_eq!(accepted.len(), 1);
    }

    #[tokio::test]
    async fn test_reject_refunds_linked_payment() {
        let fx = Fixture::new().await;
        let class = fx.class("Salsa").await;
        let user = fx.user("u1").await;
        let wf = workflow(&fx);
        let created = wf.handle(request(&user, &class, Utc::now())).await.unwrap();

        let payments = PaymentIssuer::new(fx.scope.clone(), Arc::new(ReceiptIssuer::new("RCPT")));
        let payment = payments
            .handle(ProcessPayment {
                actor: user.clone(),
                class_id: class.id.clone(),
                package: PackageType::ThreeMonth,
                payment_method: "card".into(),
                now: Utc::now(),
            })
            .await
            .unwrap();
        assert_eq!(payment.status, PaymentStatus::Completed);

        let rejected = wf
            .handle(decide(&fx, &created.id, Decision::Reject))
            .await
            .unwrap();
        assert_eq!(rejected.status, RequestStatus::Rejected);
        assert_eq!(rejected.payment_id.as_deref(), Some(payment.id.as_str()));

        let refunded = fx.scope.db.get_payment(&payment.id).await.unwrap().unwrap();
        assert_eq!(refunded.status, PaymentStatus::Refunded);
        let class = fx.scope.db.get_class(&class.id).await.unwrap().unwrap();
        assert!(class.enrolled.is_empty());
        let inbox = fx.scope.db.list_notifications(&user.id).await.unwrap();
        assert!(inbox.iter().any(|n| n.kind == NotificationKind::ClassRejected));
    }

    #[tokio::test]
    async fn test_reject_without_payment_touches_no_payment() {
        let fx = Fixture::new().await;
        let class = fx.class("Salsa").await;
        let user = fx.user("u1").await;
        let other = fx.user("u2").await;
        let wf = workflow(&fx);

        let payments = PaymentIssuer::new(fx.scope.clone(), Arc::new(ReceiptIssuer::new("RCPT")));
        let unrelated = payments
            .handle(ProcessPayment {
                actor: other.clone(),
                class_id: class.id.clone(),
                package: PackageType::ThreeMonth,
                payment_method: "card".into(),
                now: Utc::now(),
            })
            .await
            .unwrap();

        let created = wf.handle(request(&user, &class, Utc::now())).await.unwrap();
        wf.handle(decide(&fx, &created.id, Decision::Reject)).await.unwrap();

        let untouched = fx.scope.db.get_payment(&unrelated.id).await.unwrap().unwrap();
        assert_eq!(untouched.status, PaymentStatus::Completed);
    }

    #[tokio::test]
    async fn test_unknown_or_foreign_request_is_not_found() {
        let fx = Fixture::new().await;
        let other = Fixture::in_registry(fx.registry.clone(), "adm-2").await;
        let class = other.class("Tango").await;
        let user = other.user("u9").await;
        let foreign = workflow(&other)
            .handle(request(&user, &class, Utc::now()))
            .await
            .unwrap();

        let wf = workflow(&fx);
        for id in ["missing", foreign.id.as_str()] {
            let result = wf.handle(decide(&fx, id, Decision::Accept)).await;
            assert!(matches!(result, Err(CoreError::NotFound(_))), "{id}");
        }
    }

    #[tokio::test]
    async fn test_expiry_sweep_rejects_only_overdue_requests() {
        let fx = Fixture::new().await;
        let class = fx.class("Salsa").await;
        let old = fx.user("u-old").await;
        let fresh = fx.user("u-fresh").await;
        let wf = workflow(&fx);
        let t0 = Utc::now() - Duration::days(4);

        let stale = wf.handle(request(&old, &class, t0)).await.unwrap();
        let recent = wf.handle(request(&fresh, &class, Utc::now())).await.unwrap();

        let listed = wf.list_pending(Utc::now()).await.unwrap();
        let flag = |id: &str| listed.iter().find(|v| v.request.id == id).unwrap().expired;
        assert!(flag(&stale.id));
        assert!(!flag(&recent.id));

        let expired = wf.handle(ExpireOverdue { now: Utc::now() }).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, stale.id);

        let stale = fx.scope.db.get_request(&stale.id).await.unwrap().unwrap();
        assert_eq!(stale.status, RequestStatus::Rejected);
        let recent = fx.scope.db.get_request(&recent.id).await.unwrap().unwrap();
        assert_eq!(recent.status, RequestStatus::Pending);

        let inbox = fx.scope.db.list_notifications(&old.id).await.unwrap();
        assert_eq!(inbox[0].kind, NotificationKind::ClassRejected);
        assert_eq!(inbox[0].sender, fx.admin.id);

        // Nothing left to expire.
        let again = wf.handle(ExpireOverdue { now: Utc::now() }).await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_covers_every_admin_tenant() {
        let fx_a = Fixture::for_admin("adm-a").await;
        let fx_b = Fixture::in_registry(fx_a.registry.clone(), "adm-b").await;
        let t0 = Utc::now() - Duration::days(5);

        for fx in [&fx_a, &fx_b] {
            let class = fx.class("Salsa").await;
            let user = fx.user(&format!("u-{}", fx.admin.id)).await;
            workflow(fx).handle(request(&user, &class, t0)).await.unwrap();
        }

        let expired = sweep_tenants(&fx_a.registry, &fx_a.notifier(), Utc::now())
            .await
            .unwrap();
        assert_eq!(expired, 2);

        for fx in [&fx_a, &fx_b] {
            let pending = workflow(fx).list_pending(Utc::now()).await.unwrap();
            assert!(pending.is_empty());
        }
    }

    #[tokio::test]
    async fn test_retried_accept_repairs_enrollment_after_a_failed_side_effect() {
        let fx = Fixture::new().await;
        let class = fx.class("Salsa").await;
        let user = fx.user("u1").await;
        let (flaky, scope) = fx.flaky();
        let wf = EnrollmentWorkflow::new(scope, fx.notifier(), Duration::days(3));
        let created = wf.handle(request(&user, &class, Utc::now())).await.unwrap();

        flaky.fail_enroll.store(true, Ordering::SeqCst);
        let first = wf.handle(decide(&fx, &created.id, Decision::Accept)).await;
        assert!(matches!(first, Err(CoreError::Infrastructure(_))));
        let stored = fx.scope.db.get_request(&created.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RequestStatus::Accepted);
        let class_now = fx.scope.db.get_class(&class.id).await.unwrap().unwrap();
        assert!(!class_now.is_enrolled(&user.id));

        // The retry still loses the compare-and-set but finishes the enrollment.
        let retry = wf.handle(decide(&fx, &created.id, Decision::Accept)).await;
        assert!(matches!(retry, Err(CoreError::Conflict(_))));
        let class_now = fx.scope.db.get_class(&class.id).await.unwrap().unwrap();
        assert_eq!(class_now.enrolled, vec![user.id.clone()]);
        let user_now = fx.scope.directory.get_user(&user.id).await.unwrap().unwrap();
        assert_eq!(user_now.status, AccountStatus::Active);

        // A reject retry on an accepted request changes nothing.
        let wrong_way = wf.handle(decide(&fx, &created.id, Decision::Reject)).await;
        assert!(matches!(wrong_way, Err(CoreError::Conflict(_))));
        let class_now = fx.scope.db.get_class(&class.id).await.unwrap().unwrap();
        assert!(class_now.is_enrolled(&user.id));
    }

    #[tokio::test]
    async fn test_retried_reject_repairs_refund_after_a_failed_side_effect() {
        let fx = Fixture::new().await;
        let class = fx.class("Salsa").await;
        let user = fx.user("u1").await;
        let (flaky, scope) = fx.flaky();
        let wf = EnrollmentWorkflow::new(scope, fx.notifier(), Duration::days(3));
        let created = wf.handle(request(&user, &class, Utc::now())).await.unwrap();
        let payment = PaymentIssuer::new(fx.scope.clone(), Arc::new(ReceiptIssuer::new("RCPT")))
            .handle(ProcessPayment {
                actor: user.clone(),
                class_id: class.id.clone(),
                package: PackageType::ThreeMonth,
                payment_method: "card".into(),
                now: Utc::now(),
            })
            .await
            .unwrap();

        flaky.fail_refund.store(true, Ordering::SeqCst);
        let first = wf.handle(decide(&fx, &created.id, Decision::Reject)).await;
        assert!(matches!(first, Err(CoreError::Infrastructure(_))));
        let unrefunded = fx.scope.db.get_payment(&payment.id).await.unwrap().unwrap();
        assert_eq!(unrefunded.status, PaymentStatus::Completed);

        let retry = wf.handle(decide(&fx, &created.id, Decision::Reject)).await;
        assert!(matches!(retry, Err(CoreError::Conflict(_))));
        let refunded = fx.scope.db.get_payment(&payment.id).await.unwrap().unwrap();
        assert_eq!(refunded.status, PaymentStatus::Refunded);
        let rejections = fx
            .scope
            .db
            .list_notifications(&user.id)
            .await
            .unwrap()
            .into_iter()
            .filter(|n| n.kind == NotificationKind::ClassRejected)
            .count();
        assert_eq!(rejections, 0);
    }

    #[tokio::test]
    async fn test_expiry_in_main_is_sent_by_the_system() {
        let fx = Fixture::new().await;
        let main = fx.registry.scope(crate::tenancy::TenantId::main()).await.unwrap();
        let class = Class::create(
            crate::domain::class::tests::draft("Open Floor"),
            &fx.admin.id,
            Utc::now(),
        )
        .unwrap();
        main.db.insert_class(class.clone()).await.unwrap();
        let user = fx.user_of("u-main", None).await;
        let wf = EnrollmentWorkflow::new(main.clone(), fx.notifier(), Duration::days(3));
        wf.handle(request(&user, &class, Utc::now() - Duration::days(4)))
            .await
            .unwrap();

        let expired = wf.handle(ExpireOverdue { now: Utc::now() }).await.unwrap();
        assert_eq!(expired.len(), 1);
        let inbox = main.db.list_notifications(&user.id).await.unwrap();
        let rejection = inbox
            .iter()
            .find(|n| n.kind == NotificationKind::ClassRejected)
            .unwrap();
        assert_eq!(rejection.sender, SYSTEM_SENDER);
    }

    #[test]
    fn test_status_json_names() {
        assert_eq!(serde_json::to_value(RequestStatus::Inactive).unwrap(), "inactive");
        assert_eq!("accepted".parse::<RequestStatus>().unwrap(), RequestStatus::Accepted);
        assert!("expired".parse::<RequestStatus>().is_err());
    }
}
