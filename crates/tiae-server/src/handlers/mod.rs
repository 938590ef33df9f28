//! Request handlers, grouped by the entity they act on.

mod email_template;
mod invite;
mod permission;
mod service_account;
mod session;
mod setup;
mod tenant;
mod user;

pub use invite::InviteInfo;
