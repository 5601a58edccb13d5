pub mod account;
pub mod attendance;
pub mod auth;
pub mod classes;
pub mod enrollment;
pub mod notifications;
pub mod payments;
