//! Domain models for the control plane.
//!
//! These are the core types shared across all crates.

pub mod admin;
pub mod email;
pub mod permission;
pub mod service_account;
pub mod session;
pub mod tenant;
pub mod url_token;
pub mod user;
