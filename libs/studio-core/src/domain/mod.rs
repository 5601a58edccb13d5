pub mod account;
pub mod attendance;
pub mod class;
pub mod notification;
pub mod payment;
pub mod request;
pub mod user;
