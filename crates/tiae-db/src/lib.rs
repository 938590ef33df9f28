//! Tenant control plane database layer: Postgres connection management,
//! the transactional context and the identity store.
//!
//! This crate provides:
//! - Connection management ([`ConnectionRegistry`], [`DbConfig`])
//! - The per-request unit of work ([`TxContext`])
//! - Schema setup and per-tenant migrations ([`schema`])
//! - Entity stores and the session manager ([`store`])
//! - Error types ([`DbError`])

mod connection;
mod context;
mod error;
pub mod schema;
pub mod store;

pub use connection::{ConnectionRegistry, DbConfig};
pub use context::TxContext;
pub use error::{DbError, is_transient, is_unique_violation};
