use crate::domain::user::User;
use crate::tenancy::TenantScope;
use crate::{Command, CommandHandler, CoreError};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    Present,
    Absent,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Present => "present",
            AttendanceStatus::Absent => "absent",
        }
    }
}

impl FromStr for AttendanceStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "present" => Ok(AttendanceStatus::Present),
            "absent" => Ok(AttendanceStatus::Absent),
            other => Err(CoreError::Validation(format!(
                "unknown attendance status '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Attendance {
    pub id: String,
    pub user_id: String,
    pub class_id: String,
    /// Timestamp as submitted by the admin.
    pub date: DateTime<Utc>,
    /// UTC calendar day of `date`; part of the uniqueness key.
    pub day: NaiveDate,
    pub status: AttendanceStatus,
    pub marked_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct AttendanceFilter {
    pub user_id: Option<String>,
    pub class_id: Option<String>,
}

impl AttendanceFilter {
    pub fn matches(&self, record: &Attendance) -> bool {
        self.user_id.as_deref().is_none_or(|u| u == record.user_id)
            && self.class_id.as_deref().is_none_or(|c| c == record.class_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceStats {
    pub total_classes: usize,
    pub present: usize,
    pub absent: usize,
    /// Percentage rounded to two decimals; 0 when nothing was recorded.
    pub attendance_rate: f64,
}

impl AttendanceStats {
    pub fn from_records(records: &[Attendance]) -> Self {
        let total_classes = records.len();
        let present = records
            .iter()
            .filter(|r| r.status == AttendanceStatus::Present)
            .count();
        let attendance_rate = if total_classes == 0 {
            0.0
        } else {
            (present as f64 * 100.0 / total_classes as f64 * 100.0).round() / 100.0
        };
        Self {
            total_classes,
            present,
            absent: total_classes - present,
            attendance_rate,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MarkAttendance {
    pub actor: User,
    pub user_id: String,
    pub class_id: String,
    pub date: DateTime<Utc>,
    pub status: AttendanceStatus,
    pub now: DateTime<Utc>,
}

impl Command for MarkAttendance {}

pub struct AttendanceLedger {
    scope: TenantScope,
}

impl AttendanceLedger {
    pub fn new(scope: TenantScope) -> Self {
        Self { scope }
    }

    pub async fn for_class(&self, class_id: &str) -> Result<Vec<Attendance>, CoreError> {
        if self.scope.db.get_class(class_id).await?.is_none() {
            return Err(CoreError::NotFound(format!("Class not found: {class_id}")));
        }
        let filter = AttendanceFilter {
            class_id: Some(class_id.to_string()),
            ..Default::default()
        };
        self.scope.db.list_attendance(&filter).await
    }

    pub async fn for_user(&self, user_id: &str) -> Result<Vec<Attendance>, CoreError> {
        let filter = AttendanceFilter {
            user_id: Some(user_id.to_string()),
            ..Default::default()
        };
        self.scope.db.list_attendance(&filter).await
    }

    pub async fn stats(&self, user_id: &str) -> Result<AttendanceStats, CoreError> {
        let records = self.for_user(user_id).await?;
        Ok(AttendanceStats::from_records(&records))
    }
}

impl CommandHandler<MarkAttendance> for AttendanceLedger {
    type Output = Attendance;

    async fn handle(&self, command: MarkAttendance) -> Result<Attendance, CoreError> {
        if !command.actor.is_admin() {
            return Err(CoreError::Forbidden("admin role required".into()));
        }
        if self.scope.db.get_class(&command.class_id).await?.is_none() {
            return Err(CoreError::NotFound(format!(
                "Class not found: {}",
                command.class_id
            )));
        }
        // Users of another admin are as unknown here as missing ones.
        let tenant = self.scope.tenant.as_str();
        let member = self
            .scope
            .directory
            .get_user(&command.user_id)
            .await?
            .filter(|u| u.admin_id.as_deref() == Some(tenant));
        if member.is_none() {
            return Err(CoreError::NotFound(format!(
                "User not found: {}",
                command.user_id
            )));
        }

        let record = Attendance {
            id: Uuid::new_v4().to_string(),
            user_id: command.user_id,
            class_id: command.class_id,
            date: command.date,
            day: command.date.date_naive(),
            status: command.status,
            marked_by: command.actor.id,
            created_at: command.now,
            updated_at: command.now,
        };
        let stored = self.scope.db.upsert_attendance(record).await?;
        info!(
            tenant = %self.scope.tenant,
            attendance_id = %stored.id,
            day = %stored.day,
            status = stored.status.as_str(),
            "Attendance marked"
        );
        Ok(stored)
    }
}
