use crate::domain::notification::{Announcement, NotificationKind, Notifier};
use crate::domain::user::{Role, User, UserFilter};
use crate::tenancy::TenantScope;
use crate::{Command, CommandHandler, CoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassMode {
    Online,
    Offline,
}

impl ClassMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClassMode::Online => "online",
            ClassMode::Offline => "offline",
        }
    }
}

impl FromStr for ClassMode {
    type Err = ClassError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(ClassMode::Online),
            "offline" => Ok(ClassMode::Offline),
            other => Err(ClassError::InvalidInput(format!("unknown mode '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PackageType {
    #[serde(rename = "3month")]
    ThreeMonth,
    #[serde(rename = "1year")]
    OneYear,
}

impl PackageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PackageType::ThreeMonth => "3month",
            PackageType::OneYear => "1year",
        }
    }
}

impl FromStr for PackageType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "3month" => Ok(PackageType::ThreeMonth),
            "1year" => Ok(PackageType::OneYear),
            other => Err(CoreError::Validation(format!("unknown package '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Package {
    #[serde(rename = "type")]
    pub package_type: PackageType,
    pub price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub days: Vec<String>,
    pub time: String,
    /// Minutes.
    pub duration: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Class {
    pub id: String,
    pub name: String,
    pub description: String,
    pub instructor: String,
    pub schedule: Schedule,
    /// Advisory only; enrollment is not capped at write time.
    pub capacity: u32,
    pub mode: ClassMode,
    pub location: Option<String>,
    pub meeting_link: Option<String>,
    pub enrolled: Vec<String>,
    pub packages: Vec<Package>,
    pub is_active: bool,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Admin-supplied class fields, used for both create and full update.
#[derive(Debug, Clone, Deserialize)]
pub struct ClassDraft {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub instructor: String,
    pub schedule: Schedule,
    pub capacity: u32,
    pub mode: ClassMode,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub meeting_link: Option<String>,
    pub packages: Vec<Package>,
}

#[derive(thiserror::Error, Debug)]
pub enum ClassError {
    #[error("Core Error: {0}")]
    Core(#[from] CoreError),
    #[error("Class not found (ID: {0})")]
    NotFound(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Class {0} belongs to another admin")]
    NotOwner(String),
}

impl From<ClassError> for CoreError {
    fn from(err: ClassError) -> Self {
        match err {
            ClassError::Core(ce) => ce,
            ClassError::NotFound(id) => CoreError::NotFound(format!("Class not found: {}", id)),
            ClassError::InvalidInput(msg) => CoreError::Validation(msg),
            ClassError::NotOwner(id) => {
                CoreError::Forbidden(format!("Class {} belongs to another admin", id))
            }
        }
    }
}

impl ClassDraft {
    fn validate(&self) -> Result<(), ClassError> {
        if self.name.trim().is_empty() {
            return Err(ClassError::InvalidInput("name cannot be empty".into()));
        }
        if self.instructor.trim().is_empty() {
            return Err(ClassError::InvalidInput("instructor cannot be empty".into()));
        }
        if self.capacity == 0 {
            return Err(ClassError::InvalidInput("capacity must be positive".into()));
        }
        if self.schedule.days.is_empty() || self.schedule.time.trim().is_empty() {
            return Err(ClassError::InvalidInput(
                "schedule needs at least one day and a time".into(),
            ));
        }
        if self.schedule.duration == 0 {
            return Err(ClassError::InvalidInput("duration must be positive".into()));
        }
        if self.mode == ClassMode::Offline
            && self.location.as_deref().is_none_or(|l| l.trim().is_empty())
        {
            return Err(ClassError::InvalidInput(
                "offline classes need a location".into(),
            ));
        }
        if self.packages.is_empty() {
            return Err(ClassError::InvalidInput(
                "at least one package is required".into(),
            ));
        }
        for (i, package) in self.packages.iter().enumerate() {
            if !package.price.is_finite() || package.price < 0.0 {
                return Err(ClassError::InvalidInput(format!(
                    "invalid price for package {}",
                    package.package_type.as_str()
                )));
            }
            if self.packages[..i]
                .iter()
                .any(|p| p.package_type == package.package_type)
            {
                return Err(ClassError::InvalidInput(format!(
                    "duplicate package {}",
                    package.package_type.as_str()
                )));
            }
        }
        Ok(())
    }
}

impl Class {
    pub fn create(draft: ClassDraft, created_by: &str, now: DateTime<Utc>) -> Result<Self, ClassError> {
        draft.validate()?;
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            name: draft.name.trim().to_string(),
            description: draft.description,
            instructor: draft.instructor.trim().to_string(),
            schedule: draft.schedule,
            capacity: draft.capacity,
            mode: draft.mode,
            location: draft.location,
            meeting_link: draft.meeting_link,
            enrolled: Vec::new(),
            packages: draft.packages,
            is_active: true,
            created_by: created_by.to_string(),
            created_at: now,
            updated_at: now,
        })
    }

    /// Replaces the admin-editable fields, keeping identity and enrollment.
    pub fn apply(&mut self, draft: ClassDraft, now: DateTime<Utc>) -> Result<(), ClassError> {
        draft.validate()?;
        self.name = draft.name.trim().to_string();
        self.description = draft.description;
        self.instructor = draft.instructor.trim().to_string();
        self.schedule = draft.schedule;
        self.capacity = draft.capacity;
        self.mode = draft.mode;
        self.location = draft.location;
        self.meeting_link = draft.meeting_link;
        self.packages = draft.packages;
        self.updated_at = now;
        Ok(())
    }

    pub fn price_of(&self, package: PackageType) -> Option<f64> {
        self.packages
            .iter()
            .find(|p| p.package_type == package)
            .map(|p| p.price)
    }

    pub fn is_enrolled(&self, user_id: &str) -> bool {
        self.enrolled.iter().any(|u| u == user_id)
    }
}

// --- Commands ---

#[derive(Debug, Clone)]
pub struct CreateClass {
    pub actor: User,
    pub draft: ClassDraft,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct UpdateClass {
    pub actor: User,
    pub class_id: String,
    pub draft: ClassDraft,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct DeleteClass {
    pub actor: User,
    pub class_id: String,
    pub now: DateTime<Utc>,
}

impl Command for CreateClass {}
impl Command for UpdateClass {}
impl Command for DeleteClass {}

/// Class operations inside one tenant.
pub struct ClassDirectory {
    scope: TenantScope,
    notifier: Notifier,
}

impl ClassDirectory {
    pub fn new(scope: TenantScope, notifier: Notifier) -> Self {
        Self { scope, notifier }
    }

    pub async fn list_active(&self) -> Result<Vec<Class>, CoreError> {
        self.scope.db.list_classes(true).await
    }

    pub async fn get(&self, class_id: &str) -> Result<Class, CoreError> {
        self.scope
            .db
            .get_class(class_id)
            .await?
            .ok_or_else(|| ClassError::NotFound(class_id.to_string()).into())
    }

    /// Classes the user is enrolled in.
    pub async fn enrolled_in(&self, user_id: &str) -> Result<Vec<Class>, CoreError> {
        let classes = self.scope.db.list_classes(true).await?;
        Ok(classes
            .into_iter()
            .filter(|c| c.is_enrolled(user_id))
            .collect())
    }

    pub async fn students(&self, actor: &User, class_id: &str) -> Result<Vec<User>, CoreError> {
        let class = self.owned_class(actor, class_id).await?;
        let mut students = Vec::with_capacity(class.enrolled.len());
        for user_id in &class.enrolled {
            if let Some(user) = self.scope.directory.get_user(user_id).await? {
                students.push(user);
            }
        }
        Ok(students)
    }

    /// Sends the class meeting link to every enrolled user.
    pub async fn send_meeting_link(
        &self,
        actor: &User,
        class_id: &str,
        now: DateTime<Utc>,
    ) -> Result<usize, CoreError> {
        let class = self.owned_class(actor, class_id).await?;
        let link = match (class.mode, class.meeting_link.as_deref()) {
            (ClassMode::Online, Some(link)) if !link.trim().is_empty() => link.to_string(),
            _ => {
                return Err(ClassError::InvalidInput(
                    "only online classes with a meeting link can share it".into(),
                )
                .into());
            }
        };
        let delivered = self
            .notifier
            .notify(
                self.scope.db.as_ref(),
                &class.enrolled,
                Announcement {
                    sender: &actor.id,
                    kind: NotificationKind::MeetingLink,
                    message: format!("Meeting link for '{}': {}", class.name, link),
                    related_class: Some(&class.id),
                },
                now,
            )
            .await;
        Ok(delivered)
    }

    async fn owned_class(&self, actor: &User, class_id: &str) -> Result<Class, CoreError> {
        if !actor.is_admin() {
            return Err(CoreError::Forbidden("admin role required".into()));
        }
        let class = self.get(class_id).await?;
        if class.created_by != actor.id {
            return Err(ClassError::NotOwner(class.id).into());
        }
        Ok(class)
    }

    async fn tenant_users(&self) -> Result<Vec<String>, CoreError> {
        let filter = UserFilter {
            role: Some(Role::User),
            admin_id: Some(self.scope.tenant.as_str().to_string()),
        };
        Ok(self
            .scope
            .directory
            .list_users(&filter)
            .await?
            .into_iter()
            .map(|u| u.id)
            .collect())
    }
}

impl CommandHandler<CreateClass> for ClassDirectory {
    type Output = Class;

    async fn handle(&self, command: CreateClass) -> Result<Class, CoreError> {
        if !command.actor.is_admin() {
            return Err(CoreError::Forbidden("admin role required".into()));
        }
        let class = Class::create(command.draft, &command.actor.id, command.now)?;
        let class = self.scope.db.insert_class(class).await?;
        info!(tenant = %self.scope.tenant, class_id = %class.id, "Class created");

        let audience = self.tenant_users().await?;
        self.notifier
            .notify(
                self.scope.db.as_ref(),
                &audience,
                Announcement {
                    sender: &command.actor.id,
                    kind: NotificationKind::ClassCreated,
                    message: format!("New class available: {}", class.name),
                    related_class: Some(&class.id),
                },
                command.now,
            )
            .await;
        Ok(class)
    }
}

impl CommandHandler<UpdateClass> for ClassDirectory {
    type Output = Class;

    async fn handle(&self, command: UpdateClass) -> Result<Class, CoreError> {
        let mut class = self.owned_class(&command.actor, &command.class_id).await?;
        if !class.is_active {
            return Err(ClassError::NotFound(class.id).into());
        }
        class.apply(command.draft, command.now)?;
        self.scope.db.update_class(&class).await?;
        info!(tenant = %self.scope.tenant, class_id = %class.id, "Class updated");

        self.notifier
            .notify(
                self.scope.db.as_ref(),
                &class.enrolled,
                Announcement {
                    sender: &command.actor.id,
                    kind: NotificationKind::ClassUpdated,
                    message: format!("Class '{}' has been updated", class.name),
                    related_class: Some(&class.id),
                },
                command.now,
            )
            .await;
        Ok(class)
    }
}

impl CommandHandler<DeleteClass> for ClassDirectory {
    type Output = Class;

    /// Soft delete. Attendance and payments referencing the class are untouched.
    async fn handle(&self, command: DeleteClass) -> Result<Class, CoreError> {
        let mut class = self.owned_class(&command.actor, &command.class_id).await?;
        if !class.is_active {
            return Ok(class);
        }
        class.is_active = false;
        class.updated_at = command.now;
        self.scope.db.update_class(&class).await?;
        info!(tenant = %self.scope.tenant, class_id = %class.id, "Class deactivated");

        self.notifier
            .notify(
                self.scope.db.as_ref(),
                &class.enrolled,
                Announcement {
                    sender: &command.actor.id,
                    kind: NotificationKind::ClassDeleted,
                    message: format!("Class '{}' has been cancelled", class.name),
                    related_class: Some(&class.id),
                },
                command.now,
            )
            .await;
        Ok(class)
    }
}
