//! Account management against the global directory, including the
//! account-deletion cascade.

use crate::domain::user::{AccountStatus, Role, User, UserError, UserFilter};
use crate::tenancy::{ConnectionRegistry, TenantScope};
use crate::{Command, CommandHandler, CoreError, TenantDatabase};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone)]
pub struct DeleteAccount {
    pub actor: User,
}

impl Command for DeleteAccount {}

/// What each cascade step removed or changed. Re-running a finished cascade
/// reports zeros.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeletionReport {
    pub classes_left: u64,
    pub attendance_removed: u64,
    pub payments_refunded: u64,
    pub requests_removed: u64,
    pub notifications_removed: u64,
    pub user_removed: bool,
}

pub struct AccountService {
    scope: TenantScope,
}

impl AccountService {
    /// `scope` must be the tenant resolved for the acting principal.
    pub fn new(scope: TenantScope) -> Self {
        Self { scope }
    }

    pub async fn list_admins(&self) -> Result<Vec<User>, CoreError> {
        let filter = UserFilter {
            role: Some(Role::Admin),
            admin_id: None,
        };
        self.scope.directory.list_users(&filter).await
    }

    pub async fn profile(&self, actor: &User) -> Result<User, CoreError> {
        self.scope
            .directory
            .get_user(&actor.id)
            .await?
            .ok_or_else(|| UserError::NotFound(actor.id.clone()).into())
    }

    pub async fn update_profile(&self, actor: &User, name: &str) -> Result<User, CoreError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(UserError::InvalidInput("name cannot be empty".into()).into());
        }
        let mut user = self.profile(actor).await?;
        user.name = name.to_string();
        self.scope.directory.update_user(&user).await?;
        Ok(user)
    }

    /// Assigns a regular user to an admin's tenant.
    pub async fn select_admin(&self, actor: &User, admin_id: &str) -> Result<User, CoreError> {
        if actor.role != Role::User {
            return Err(CoreError::Forbidden("only users can select an admin".into()));
        }
        let admin = self
            .scope
            .directory
            .get_user(admin_id)
            .await?
            .filter(User::is_admin)
            .ok_or_else(|| CoreError::NotFound(format!("Admin not found: {admin_id}")))?;
        let mut user = self.profile(actor).await?;
        user.admin_id = Some(admin.id.clone());
        self.scope.directory.update_user(&user).await?;
        info!(user_id = %user.id, admin_id = %admin.id, "User selected admin");
        Ok(user)
    }

    /// Admins can deactivate users assigned to their own tenant only.
    pub async fn deactivate(&self, actor: &User, user_id: &str) -> Result<User, CoreError> {
        if !actor.is_admin() {
            return Err(CoreError::Forbidden("admin role required".into()));
        }
        let mut user = self
            .scope
            .directory
            .get_user(user_id)
            .await?
            .filter(|u| u.admin_id.as_deref() == Some(actor.id.as_str()))
            .ok_or_else(|| UserError::NotFound(user_id.to_string()))?;
        if user.status != AccountStatus::Inactive {
            user.status = AccountStatus::Inactive;
            self.scope.directory.update_user(&user).await?;
            info!(user_id = %user.id, "User deactivated");
        }
        Ok(user)
    }
}

impl DeletionReport {
    fn absorb(&mut self, other: DeletionReport) {
        self.classes_left += other.classes_left;
        self.attendance_removed += other.attendance_removed;
        self.payments_refunded += other.payments_refunded;
        self.requests_removed += other.requests_removed;
        self.notifications_removed += other.notifications_removed;
    }
}

/// Runs the deletion cascade. A user can move between admins, so their data
/// may sit in any tenant: every known tenant is cleaned before the directory
/// record goes.
pub struct AccountDeletion {
    registry: Arc<ConnectionRegistry>,
}

impl AccountDeletion {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }
}

// Steps 1-5 of the cascade inside one tenant database.
async fn purge_tenant(db: &dyn TenantDatabase, user_id: &str) -> Result<DeletionReport, CoreError> {
    Ok(DeletionReport {
        classes_left: db.remove_enrolled_everywhere(user_id).await?,
        attendance_removed: db.delete_attendance_for_user(user_id).await?,
        payments_refunded: db.refund_payments_for_user(user_id).await?,
        requests_removed: db.delete_requests_for_user(user_id).await?,
        notifications_removed: db.delete_notifications_for_user(user_id).await?,
        user_removed: false,
    })
}

impl CommandHandler<DeleteAccount> for AccountDeletion {
    type Output = DeletionReport;

    /// Each step is idempotent and the user record goes last, so a failed run
    /// can be retried from the start.
    async fn handle(&self, command: DeleteAccount) -> Result<DeletionReport, CoreError> {
        let user_id = command.actor.id.as_str();
        let mut report = DeletionReport::default();

        for tenant in self.registry.known_tenants().await? {
            let db = self.registry.connection(&tenant).await?;
            let purged = purge_tenant(db.as_ref(), user_id).await?;
            if purged != DeletionReport::default() {
                info!(tenant = %tenant, user_id = %user_id, ?purged, "Purged account data");
            }
            report.absorb(purged);
        }

        report.user_removed = self.registry.main().await?.delete_user(user_id).await?;
        info!(user_id = %user_id, ?report, "Account deleted");
        Ok(report)
    }
}
