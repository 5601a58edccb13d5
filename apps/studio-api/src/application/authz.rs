use studio_core::domain::user::{Role, User};

use super::ApiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requirement {
    AdminOnly,
    UserOnly,
}

/// Route-level role gate. Runs before the handler touches any store.
pub fn authorize(principal: &User, requirement: Requirement) -> Result<(), ApiError> {
    let allowed = match requirement {
        Requirement::AdminOnly => principal.role == Role::Admin,
        Requirement::UserOnly => principal.role == Role::User,
    };
    if allowed {
        Ok(())
    } else {
        Err(ApiError::Forbidden(match requirement {
            Requirement::AdminOnly => "admin role required".to_string(),
            Requirement::UserOnly => "only regular users can do this".to_string(),
        }))
    }
}
