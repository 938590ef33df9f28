//! Identity store: CRUD and invariants for every control-plane entity.
//!
//! All functions operate on a [`TxContext`](crate::context::TxContext) and
//! take part in its transactions. Global-catalog entities go through
//! `main_tx`, tenant entities through `tenant_tx` and require an attached
//! tenant. Side effects on external systems are only staged here.

pub mod admin;
pub mod email_template;
pub mod permission;
pub mod service_account;
pub mod session;
pub mod tenant;
pub mod url_token;
pub mod user;

use std::str::FromStr;

use tiae_core::error::TiaeError;

use crate::error::DbError;

/// Parse a text column holding an enum value.
pub(crate) fn parse_column<T>(column: &str, raw: &str) -> Result<T, TiaeError>
where
    T: FromStr,
{
    raw.parse()
        .map_err(|_| DbError::Corrupt(format!("{column}: unexpected value {raw:?}")).into())
}
