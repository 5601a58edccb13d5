use crate::CoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    User,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::User => "user",
        }
    }
}

impl FromStr for Role {
    type Err = UserError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Role::Admin),
            "user" => Ok(Role::User),
            other => Err(UserError::InvalidInput(format!("unknown role '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Active,
    Inactive,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::Inactive => "inactive",
        }
    }
}

impl FromStr for AccountStatus {
    type Err = UserError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(AccountStatus::Active),
            "inactive" => Ok(AccountStatus::Inactive),
            other => Err(UserError::InvalidInput(format!("unknown status '{other}'"))),
        }
    }
}

/// A principal in the global directory. Always stored in the main database.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct User {
    pub id: String,
    pub name: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub role: Role,
    pub status: AccountStatus,
    pub admin_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(thiserror::Error, Debug)]
pub enum UserError {
    #[error("Core Error: {0}")]
    Core(#[from] CoreError),
    #[error("User already exists (email: {0})")]
    AlreadyExists(String),
    #[error("User not found (ID: {0})")]
    NotFound(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl From<UserError> for CoreError {
    fn from(err: UserError) -> Self {
        match err {
            UserError::Core(ce) => ce,
            UserError::AlreadyExists(email) => {
                CoreError::Conflict(format!("User already exists: {}", email))
            }
            UserError::NotFound(id) => CoreError::NotFound(format!("User not found: {}", id)),
            UserError::InvalidInput(msg) => CoreError::Validation(msg),
        }
    }
}

impl User {
    /// Builds a freshly registered principal. Admins start active, users start
    /// inactive until their first enrollment is accepted.
    pub fn register(
        name: &str,
        email: &str,
        password_hash: String,
        role: Role,
        now: DateTime<Utc>,
    ) -> Result<Self, UserError> {
        let name = name.trim();
        let email = email.trim().to_lowercase();
        if name.is_empty() {
            return Err(UserError::InvalidInput("name cannot be empty".into()));
        }
        if !is_plausible_email(&email) {
            return Err(UserError::InvalidInput(format!("invalid email '{email}'")));
        }
        if password_hash.is_empty() {
            return Err(UserError::InvalidInput("password cannot be empty".into()));
        }
        let status = match role {
            Role::Admin => AccountStatus::Active,
            Role::User => AccountStatus::Inactive,
        };
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            email,
            password_hash,
            role,
            status,
            admin_id: None,
            created_at: now,
        })
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

fn is_plausible_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => !local.is_empty() && domain.contains('.') && !domain.starts_with('.'),
        None => false,
    }
}

#[derive(Debug, Clone, Default)]
pub struct UserFilter {
    pub role: Option<Role>,
    pub admin_id: Option<String>,
}

impl UserFilter {
    pub fn matches(&self, user: &User) -> bool {
        self.role.is_none_or(|r| r == user.role)
            && self
                .admin_id
                .as_deref()
                .is_none_or(|a| user.admin_id.as_deref() == Some(a))
    }
}
