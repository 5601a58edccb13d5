pub mod auth;
pub mod tenant;

pub use auth::{AuthenticatedUser, SessionToken, require_session, session_key};
pub use tenant::{TenantContext, resolve_tenant};
